//! Sized-value parsing for stressor options.
//!
//! All parsers are pure: no I/O, no process teardown. Failures come back as
//! [`ParseError`] carrying the subject (option name) and the offending text,
//! so one malformed option never tears down sibling stressors that already
//! validated.
//!
//! Accepted grammar is deliberately strict: decimal digits, an optional
//! single sign, and at most one scale letter. Multi-suffix forms such as
//! "1h30m" are rejected with `BadSuffix`.

use crate::error::ParseError;
use crate::system::cache::CpuCaches;

/// Byte scale suffixes: b, k, m, g, t, p, e (powers of two).
pub const BYTE_SCALE: &[(char, u64)] = &[
    ('b', 1),
    ('k', 1u64 << 10),
    ('m', 1u64 << 20),
    ('g', 1u64 << 30),
    ('t', 1u64 << 40),
    ('p', 1u64 << 50),
    ('e', 1u64 << 60),
];

/// Time scale suffixes: seconds through years.
pub const TIME_SCALE: &[(char, u64)] = &[
    ('s', 1),
    ('m', 60),
    ('h', 3_600),
    ('d', 86_400),
    ('w', 604_800),
    ('y', 31_536_000),
];

fn malformed(subject: &str, text: &str) -> ParseError {
    ParseError::Malformed {
        subject: subject.to_string(),
        text: text.to_string(),
    }
}

fn too_large(subject: &str, text: &str) -> ParseError {
    ParseError::TooLarge {
        subject: subject.to_string(),
        text: text.to_string(),
    }
}

fn bad_suffix(subject: &str, text: &str) -> ParseError {
    ParseError::BadSuffix {
        subject: subject.to_string(),
        text: text.to_string(),
    }
}

/// Accumulate a run of decimal digits into a u64.
///
/// `whole` is the complete original input, used for error reporting.
fn accumulate_digits(digits: &str, subject: &str, whole: &str) -> Result<u64, ParseError> {
    if digits.is_empty() {
        return Err(malformed(subject, whole));
    }
    let mut value: u64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(10).ok_or_else(|| malformed(subject, whole))? as u64;
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(d))
            .ok_or_else(|| too_large(subject, whole))?;
    }
    Ok(value)
}

/// Parse an unsigned decimal, optionally preceded by '+'.
///
/// No whitespace, no trailing garbage. Out-of-range values surface as
/// `TooLarge`.
pub fn parse_u64(s: &str, subject: &str) -> Result<u64, ParseError> {
    let digits = s.strip_prefix('+').unwrap_or(s);
    accumulate_digits(digits, subject, s)
}

pub fn parse_u32(s: &str, subject: &str) -> Result<u32, ParseError> {
    u32::try_from(parse_u64(s, subject)?).map_err(|_| too_large(subject, s))
}

pub fn parse_u16(s: &str, subject: &str) -> Result<u16, ParseError> {
    u16::try_from(parse_u64(s, subject)?).map_err(|_| too_large(subject, s))
}

pub fn parse_u8(s: &str, subject: &str) -> Result<u8, ParseError> {
    u8::try_from(parse_u64(s, subject)?).map_err(|_| too_large(subject, s))
}

pub fn parse_usize(s: &str, subject: &str) -> Result<usize, ParseError> {
    usize::try_from(parse_u64(s, subject)?).map_err(|_| too_large(subject, s))
}

/// Parse a signed decimal, optionally preceded by '-' or '+'.
pub fn parse_i64(s: &str, subject: &str) -> Result<i64, ParseError> {
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let magnitude = accumulate_digits(digits, subject, s)?;
    if negative {
        // i64::MIN magnitude is one past i64::MAX
        if magnitude > i64::MAX as u64 + 1 {
            return Err(too_large(subject, s));
        }
        Ok((magnitude as i64).wrapping_neg())
    } else {
        i64::try_from(magnitude).map_err(|_| too_large(subject, s))
    }
}

pub fn parse_i32(s: &str, subject: &str) -> Result<i32, ParseError> {
    i32::try_from(parse_i64(s, subject)?).map_err(|_| too_large(subject, s))
}

pub fn parse_i16(s: &str, subject: &str) -> Result<i16, ParseError> {
    i16::try_from(parse_i64(s, subject)?).map_err(|_| too_large(subject, s))
}

pub fn parse_i8(s: &str, subject: &str) -> Result<i8, ParseError> {
    i8::try_from(parse_i64(s, subject)?).map_err(|_| too_large(subject, s))
}

pub fn parse_isize(s: &str, subject: &str) -> Result<isize, ParseError> {
    isize::try_from(parse_i64(s, subject)?).map_err(|_| too_large(subject, s))
}

/// Parse a decimal with at most one trailing scale letter.
///
/// The letter is matched case-insensitively against `scale`. No letter means
/// no scaling. A letter outside the table, or more than one trailing
/// character, is `BadSuffix`.
pub fn parse_scaled(s: &str, scale: &[(char, u64)], subject: &str) -> Result<u64, ParseError> {
    let digit_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (digits, rest) = s.split_at(digit_end);
    let base = accumulate_digits(digits, subject, s)?;

    if rest.is_empty() {
        return Ok(base);
    }

    // Single suffix only: "1h30m" and friends are rejected here.
    let mut rest_chars = rest.chars();
    let letter = rest_chars.next().unwrap().to_ascii_lowercase();
    if rest_chars.next().is_some() {
        return Err(bad_suffix(subject, s));
    }

    let multiplier = scale
        .iter()
        .find(|(c, _)| *c == letter)
        .map(|(_, m)| *m)
        .ok_or_else(|| bad_suffix(subject, s))?;

    base.checked_mul(multiplier)
        .ok_or_else(|| too_large(subject, s))
}

/// Parse a byte size such as "64", "4k" or "2G".
pub fn parse_bytes(s: &str, subject: &str) -> Result<u64, ParseError> {
    parse_scaled(s, BYTE_SCALE, subject)
}

/// Parse a duration in seconds such as "30", "90s", "2m" or "1h".
pub fn parse_time(s: &str, subject: &str) -> Result<u64, ParseError> {
    parse_scaled(s, TIME_SCALE, subject)
}

/// Parse a byte size, or a CPU-cache alias when the value starts with 'L'.
///
/// "LLC" selects the last-level cache; "L0".."L5" select that level. A cache
/// that is absent from the probed topology, or has no known size, is
/// `UnknownCache`.
pub fn parse_bytes_or_cache(
    s: &str,
    caches: &CpuCaches,
    subject: &str,
) -> Result<u64, ParseError> {
    if !s.starts_with('L') && !s.starts_with('l') {
        return parse_bytes(s, subject);
    }

    let unknown = || ParseError::UnknownCache {
        subject: subject.to_string(),
        text: s.to_string(),
    };

    if s.eq_ignore_ascii_case("llc") {
        return caches.last_level_size().ok_or_else(unknown);
    }

    let level: u32 = s[1..].parse().map_err(|_| unknown())?;
    if level > 5 {
        return Err(unknown());
    }
    caches.level_size(level).ok_or_else(unknown)
}

/// Parse a byte size with optional trailing '%'.
///
/// A percentage is resolved against `max` split across `instances`:
/// `max * v / (100 * instances)`. Returns the resolved size and whether the
/// input was percent-form. Zero instances or a zero maximum cannot be split
/// and surface as `DivByZero`; negative percentages are malformed.
pub fn parse_bytes_percent(
    s: &str,
    instances: u32,
    max: u64,
    subject: &str,
) -> Result<(u64, bool), ParseError> {
    let Some(prefix) = s.strip_suffix('%') else {
        return Ok((parse_bytes(s, subject)?, false));
    };

    if prefix.starts_with('-') {
        return Err(malformed(subject, s));
    }
    let percent = accumulate_digits(prefix.strip_prefix('+').unwrap_or(prefix), subject, s)?;
    if instances == 0 || max == 0 {
        return Err(ParseError::DivByZero {
            subject: subject.to_string(),
            text: s.to_string(),
        });
    }

    let scaled = (max as u128) * (percent as u128) / (100u128 * instances as u128);
    let bytes = u64::try_from(scaled).map_err(|_| too_large(subject, s))?;
    Ok((bytes, true))
}

/// Parse an instance count with optional trailing '%' of online CPUs.
pub fn parse_instances_percent(s: &str, subject: &str) -> Result<i32, ParseError> {
    instances_percent_with_cpus(s, num_cpus::get() as u64, subject)
}

/// CPU-count-parameterized form of [`parse_instances_percent`].
///
/// "N%" resolves to round(cpus * N / 100), at least 1 for any positive
/// percentage, capped at i32::MAX.
pub fn instances_percent_with_cpus(
    s: &str,
    cpus: u64,
    subject: &str,
) -> Result<i32, ParseError> {
    let Some(prefix) = s.strip_suffix('%') else {
        return parse_i32(s, subject);
    };

    let percent = accumulate_digits(prefix.strip_prefix('+').unwrap_or(prefix), subject, s)?;
    let rounded = (cpus as u128 * percent as u128 + 50) / 100;
    let mut instances = u64::try_from(rounded).unwrap_or(u64::MAX);
    if percent > 0 && instances == 0 {
        instances = 1;
    }
    Ok(instances.min(i32::MAX as u64) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::cache::{CacheLevel, CpuCaches};

    fn caches() -> CpuCaches {
        CpuCaches::from_levels(vec![
            CacheLevel {
                level: 1,
                size: 32 * 1024,
            },
            CacheLevel {
                level: 2,
                size: 1024 * 1024,
            },
            CacheLevel {
                level: 3,
                size: 16 * 1024 * 1024,
            },
        ])
    }

    #[test]
    fn test_parse_u64_plain() {
        assert_eq!(parse_u64("0", "t").unwrap(), 0);
        assert_eq!(parse_u64("+42", "t").unwrap(), 42);
        assert_eq!(parse_u64("18446744073709551615", "t").unwrap(), u64::MAX);
    }

    #[test]
    fn test_parse_u64_rejects_garbage() {
        assert!(matches!(
            parse_u64("", "t"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(parse_u64(" 1", "t").is_err());
        assert!(parse_u64("1 ", "t").is_err());
        assert!(parse_u64("0x10", "t").is_err());
        assert!(parse_u64("-1", "t").is_err());
    }

    #[test]
    fn test_parse_u64_overflow() {
        assert!(matches!(
            parse_u64("18446744073709551616", "t"),
            Err(ParseError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_parse_narrow_unsigned_ranges() {
        assert_eq!(parse_u8("255", "t").unwrap(), 255);
        assert!(matches!(
            parse_u8("256", "t"),
            Err(ParseError::TooLarge { .. })
        ));
        assert_eq!(parse_u16("65535", "t").unwrap(), 65535);
        assert!(parse_u16("65536", "t").is_err());
        assert_eq!(parse_u32("4294967295", "t").unwrap(), u32::MAX);
        assert!(parse_u32("4294967296", "t").is_err());
    }

    #[test]
    fn test_parse_int32_boundaries() {
        assert_eq!(parse_i32("2147483647", "t").unwrap(), i32::MAX);
        assert!(matches!(
            parse_i32("2147483648", "t"),
            Err(ParseError::TooLarge { .. })
        ));
        assert_eq!(parse_i32("-2147483648", "t").unwrap(), i32::MIN);
        assert!(parse_i32("-2147483649", "t").is_err());
    }

    #[test]
    fn test_parse_i64_boundaries() {
        assert_eq!(parse_i64("-9223372036854775808", "t").unwrap(), i64::MIN);
        assert_eq!(parse_i64("9223372036854775807", "t").unwrap(), i64::MAX);
        assert!(parse_i64("9223372036854775808", "t").is_err());
        assert!(parse_i64("-9223372036854775809", "t").is_err());
    }

    #[test]
    fn test_parse_bytes_scaling() {
        assert_eq!(parse_bytes("1k", "t").unwrap(), 1024);
        assert_eq!(parse_bytes("1K", "t").unwrap(), 1024);
        assert_eq!(parse_bytes("2G", "t").unwrap(), 2 * (1u64 << 30));
        assert_eq!(parse_bytes("64", "t").unwrap(), 64);
        assert_eq!(parse_bytes("3b", "t").unwrap(), 3);
        assert_eq!(parse_bytes("1e", "t").unwrap(), 1u64 << 60);
    }

    #[test]
    fn test_parse_bytes_bad_suffix() {
        assert!(matches!(
            parse_bytes("10q", "t"),
            Err(ParseError::BadSuffix { .. })
        ));
        assert!(matches!(
            parse_bytes("1kk", "t"),
            Err(ParseError::BadSuffix { .. })
        ));
    }

    #[test]
    fn test_parse_bytes_overflow_on_scale() {
        assert!(matches!(
            parse_bytes("16e", "t"),
            Err(ParseError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_parse_time_units() {
        assert_eq!(parse_time("90", "t").unwrap(), 90);
        assert_eq!(parse_time("90s", "t").unwrap(), 90);
        assert_eq!(parse_time("2m", "t").unwrap(), 120);
        assert_eq!(parse_time("1h", "t").unwrap(), 3600);
        assert_eq!(parse_time("1d", "t").unwrap(), 86_400);
        assert_eq!(parse_time("1w", "t").unwrap(), 604_800);
        assert_eq!(parse_time("1y", "t").unwrap(), 31_536_000);
    }

    #[test]
    fn test_parse_time_multi_suffix_rejected() {
        // Single suffix only by design.
        assert!(matches!(
            parse_time("1h30m", "t"),
            Err(ParseError::BadSuffix { .. })
        ));
        assert!(matches!(
            parse_time("2m30s", "t"),
            Err(ParseError::BadSuffix { .. })
        ));
    }

    #[test]
    fn test_parse_cache_aliases() {
        let c = caches();
        assert_eq!(parse_bytes_or_cache("LLC", &c, "t").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_bytes_or_cache("llc", &c, "t").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_bytes_or_cache("L1", &c, "t").unwrap(), 32 * 1024);
        assert_eq!(parse_bytes_or_cache("L2", &c, "t").unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_parse_cache_unknown() {
        let c = caches();
        assert!(matches!(
            parse_bytes_or_cache("L4", &c, "t"),
            Err(ParseError::UnknownCache { .. })
        ));
        assert!(matches!(
            parse_bytes_or_cache("L6", &c, "t"),
            Err(ParseError::UnknownCache { .. })
        ));
        assert!(matches!(
            parse_bytes_or_cache("Lx", &c, "t"),
            Err(ParseError::UnknownCache { .. })
        ));
        let empty = CpuCaches::from_levels(Vec::new());
        assert!(matches!(
            parse_bytes_or_cache("LLC", &empty, "t"),
            Err(ParseError::UnknownCache { .. })
        ));
    }

    #[test]
    fn test_parse_cache_falls_through_to_bytes() {
        let c = caches();
        assert_eq!(parse_bytes_or_cache("4k", &c, "t").unwrap(), 4096);
    }

    #[test]
    fn test_parse_bytes_percent() {
        assert_eq!(
            parse_bytes_percent("50%", 4, 1000, "t").unwrap(),
            (125, true)
        );
        assert_eq!(
            parse_bytes_percent("100%", 1, 4096, "t").unwrap(),
            (4096, true)
        );
        assert_eq!(
            parse_bytes_percent("1g", 4, 1000, "t").unwrap(),
            (1u64 << 30, false)
        );
    }

    #[test]
    fn test_parse_bytes_percent_zero_divisors() {
        assert!(matches!(
            parse_bytes_percent("50%", 0, 1000, "t"),
            Err(ParseError::DivByZero { .. })
        ));
        assert!(matches!(
            parse_bytes_percent("50%", 4, 0, "t"),
            Err(ParseError::DivByZero { .. })
        ));
    }

    #[test]
    fn test_parse_bytes_percent_negative() {
        assert!(parse_bytes_percent("-50%", 4, 1000, "t").is_err());
    }

    #[test]
    fn test_instances_percent() {
        assert_eq!(instances_percent_with_cpus("50%", 8, "t").unwrap(), 4);
        assert_eq!(instances_percent_with_cpus("100%", 8, "t").unwrap(), 8);
        assert_eq!(instances_percent_with_cpus("200%", 8, "t").unwrap(), 16);
        // Rounds to nearest
        assert_eq!(instances_percent_with_cpus("33%", 8, "t").unwrap(), 3);
        // Positive percentage never rounds to zero
        assert_eq!(instances_percent_with_cpus("1%", 4, "t").unwrap(), 1);
        // Plain integer path
        assert_eq!(instances_percent_with_cpus("6", 8, "t").unwrap(), 6);
    }

    #[test]
    fn test_instances_percent_caps_at_i32_max() {
        let huge = u64::MAX / 200;
        assert_eq!(
            instances_percent_with_cpus("200%", huge, "t").unwrap(),
            i32::MAX
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parse_u64_roundtrips(v in any::<u64>()) {
                prop_assert_eq!(parse_u64(&v.to_string(), "p").unwrap(), v);
            }

            #[test]
            fn parse_i64_roundtrips(v in any::<i64>()) {
                prop_assert_eq!(parse_i64(&v.to_string(), "p").unwrap(), v);
            }

            #[test]
            fn parse_bytes_kilo_matches_shift(v in 0u64..=(u64::MAX >> 10)) {
                let s = format!("{}k", v);
                prop_assert_eq!(parse_bytes(&s, "p").unwrap(), v << 10);
            }

            #[test]
            fn percent_never_exceeds_max(v in 0u64..=100, inst in 1u32..64) {
                let s = format!("{}%", v);
                let (bytes, is_pct) = parse_bytes_percent(&s, inst, 1 << 40, "p").unwrap();
                prop_assert!(is_pct);
                prop_assert!(bytes <= 1 << 40);
            }
        }
    }
}
