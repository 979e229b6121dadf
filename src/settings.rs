//! Typed, stressor-scoped settings store.
//!
//! Options are parsed from the run plan into tagged values keyed by
//! (stressor name, option name). The store is populated entirely before the
//! first worker forks and is read-only thereafter; workers read their own
//! options once inside the entry function.
//!
//! A key's tag is fixed by its first insertion. A typed read with the wrong
//! tag panics the calling worker, never the supervisor: by the time a worker
//! reads settings it is a forked child, so the panic surfaces as one failed
//! worker slot.

use std::collections::HashMap;

use crate::error::SettingsError;

/// Discriminates the type a setting was parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Size,
    Ssize,
    Uint,
    Int,
    Bool,
    Str,
    OffSize,
    ByteSizeVm,
    ByteSizeFs,
    ByteSizeFsPercent,
    SizeVm,
    SizeFs,
    SizeFsPercent,
    MethodIndex,
    Callback,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::U8 => "u8",
            Tag::U16 => "u16",
            Tag::U32 => "u32",
            Tag::U64 => "u64",
            Tag::I8 => "i8",
            Tag::I16 => "i16",
            Tag::I32 => "i32",
            Tag::I64 => "i64",
            Tag::Size => "size",
            Tag::Ssize => "ssize",
            Tag::Uint => "unsigned",
            Tag::Int => "signed",
            Tag::Bool => "bool",
            Tag::Str => "string",
            Tag::OffSize => "off-size",
            Tag::ByteSizeVm => "byte-size-vm",
            Tag::ByteSizeFs => "byte-size-fs",
            Tag::ByteSizeFsPercent => "byte-size-fs-percent",
            Tag::SizeVm => "size-vm",
            Tag::SizeFs => "size-fs",
            Tag::SizeFsPercent => "size-fs-percent",
            Tag::MethodIndex => "method-index",
            Tag::Callback => "callback",
        }
    }
}

/// A parsed setting value together with its tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Size(u64),
    Ssize(i64),
    Uint(u64),
    Int(i64),
    Bool(bool),
    Str(String),
    OffSize(u64),
    ByteSizeVm(u64),
    ByteSizeFs(u64),
    ByteSizeFsPercent(u64),
    SizeVm(u64),
    SizeFs(u64),
    SizeFsPercent(u64),
    MethodIndex(usize),
    Callback(fn()),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::U8(_) => Tag::U8,
            Value::U16(_) => Tag::U16,
            Value::U32(_) => Tag::U32,
            Value::U64(_) => Tag::U64,
            Value::I8(_) => Tag::I8,
            Value::I16(_) => Tag::I16,
            Value::I32(_) => Tag::I32,
            Value::I64(_) => Tag::I64,
            Value::Size(_) => Tag::Size,
            Value::Ssize(_) => Tag::Ssize,
            Value::Uint(_) => Tag::Uint,
            Value::Int(_) => Tag::Int,
            Value::Bool(_) => Tag::Bool,
            Value::Str(_) => Tag::Str,
            Value::OffSize(_) => Tag::OffSize,
            Value::ByteSizeVm(_) => Tag::ByteSizeVm,
            Value::ByteSizeFs(_) => Tag::ByteSizeFs,
            Value::ByteSizeFsPercent(_) => Tag::ByteSizeFsPercent,
            Value::SizeVm(_) => Tag::SizeVm,
            Value::SizeFs(_) => Tag::SizeFs,
            Value::SizeFsPercent(_) => Tag::SizeFsPercent,
            Value::MethodIndex(_) => Tag::MethodIndex,
            Value::Callback(_) => Tag::Callback,
        }
    }

    /// The unsigned magnitude behind any unsigned-backed tag.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(*v as u64),
            Value::U16(v) => Some(*v as u64),
            Value::U32(v) => Some(*v as u64),
            Value::U64(v)
            | Value::Size(v)
            | Value::Uint(v)
            | Value::OffSize(v)
            | Value::ByteSizeVm(v)
            | Value::ByteSizeFs(v)
            | Value::ByteSizeFsPercent(v)
            | Value::SizeVm(v)
            | Value::SizeFs(v)
            | Value::SizeFsPercent(v) => Some(*v),
            Value::MethodIndex(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(*v as i64),
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) | Value::Ssize(v) | Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Process-wide mapping from (stressor, option) to a tagged value.
#[derive(Debug, Default, Clone)]
pub struct Settings {
    map: HashMap<(String, String), Value>,
}

impl Settings {
    pub fn new() -> Self {
        Settings {
            map: HashMap::new(),
        }
    }

    /// Upsert a value. The first insertion for a key fixes its tag; a later
    /// upsert with a different tag is rejected.
    pub fn set(
        &mut self,
        stressor: &str,
        key: &str,
        value: Value,
    ) -> Result<(), SettingsError> {
        let map_key = (stressor.to_string(), key.to_string());
        if let Some(existing) = self.map.get(&map_key) {
            if existing.tag() != value.tag() {
                return Err(SettingsError::TagConflict {
                    stressor: stressor.to_string(),
                    key: key.to_string(),
                    first: existing.tag().as_str(),
                    second: value.tag().as_str(),
                });
            }
        }
        self.map.insert(map_key, value);
        Ok(())
    }

    /// Record a present-flag option as true.
    pub fn set_true(&mut self, stressor: &str, key: &str) -> Result<(), SettingsError> {
        self.set(stressor, key, Value::Bool(true))
    }

    /// Raw lookup: tag and value, or None when absent.
    pub fn get(&self, stressor: &str, key: &str) -> Option<&Value> {
        self.map.get(&(stressor.to_string(), key.to_string()))
    }

    /// Lookup insisting on a tag. Absent keys are None; a present key with a
    /// different tag panics the caller (intended for worker-side reads).
    pub fn get_checked(&self, stressor: &str, key: &str, tag: Tag) -> Option<&Value> {
        let value = self.get(stressor, key)?;
        if value.tag() != tag {
            panic!(
                "{}",
                SettingsError::TagMismatch {
                    stressor: stressor.to_string(),
                    key: key.to_string(),
                    wanted: tag.as_str(),
                    stored: value.tag().as_str(),
                }
            );
        }
        Some(value)
    }

    /// Unsigned amount stored under `tag`, or None when unset.
    pub fn amount(&self, stressor: &str, key: &str, tag: Tag) -> Option<u64> {
        self.get_checked(stressor, key, tag).and_then(Value::as_u64)
    }

    /// Signed amount stored under `tag`, or None when unset.
    pub fn signed(&self, stressor: &str, key: &str, tag: Tag) -> Option<i64> {
        self.get_checked(stressor, key, tag).and_then(Value::as_i64)
    }

    /// Present-flag lookup: absent means false.
    pub fn flag(&self, stressor: &str, key: &str) -> bool {
        self.get_checked(stressor, key, Tag::Bool)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// String option, or None when unset.
    pub fn string(&self, stressor: &str, key: &str) -> Option<&str> {
        self.get_checked(stressor, key, Tag::Str).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip_same_bytes_same_tag() {
        let mut s = Settings::new();
        s.set("vm", "vm-bytes", Value::ByteSizeVm(1 << 30)).unwrap();
        let v = s.get("vm", "vm-bytes").unwrap();
        assert_eq!(v.tag(), Tag::ByteSizeVm);
        assert_eq!(v.as_u64(), Some(1 << 30));
    }

    #[test]
    fn test_first_insert_fixes_tag() {
        let mut s = Settings::new();
        s.set("vm", "vm-bytes", Value::ByteSizeVm(4096)).unwrap();
        // Same tag upserts fine
        s.set("vm", "vm-bytes", Value::ByteSizeVm(8192)).unwrap();
        assert_eq!(s.get("vm", "vm-bytes").unwrap().as_u64(), Some(8192));
        // Different tag is rejected
        let err = s.set("vm", "vm-bytes", Value::U32(1)).unwrap_err();
        assert!(matches!(err, SettingsError::TagConflict { .. }));
    }

    #[test]
    fn test_get_true_flag() {
        let mut s = Settings::new();
        assert!(!s.flag("cpu", "cpu-verify"));
        s.set_true("cpu", "cpu-verify").unwrap();
        assert!(s.flag("cpu", "cpu-verify"));
    }

    #[test]
    fn test_scoping_by_stressor() {
        let mut s = Settings::new();
        s.set("vm", "ops", Value::U64(10)).unwrap();
        s.set("cpu", "ops", Value::U64(20)).unwrap();
        assert_eq!(s.amount("vm", "ops", Tag::U64), Some(10));
        assert_eq!(s.amount("cpu", "ops", Tag::U64), Some(20));
        assert_eq!(s.get("pipe", "ops"), None);
    }

    #[test]
    #[should_panic(expected = "read as u32 but stored as byte-size-vm")]
    fn test_tag_mismatch_panics_reader() {
        let mut s = Settings::new();
        s.set("vm", "vm-bytes", Value::ByteSizeVm(4096)).unwrap();
        let _ = s.amount("vm", "vm-bytes", Tag::U32);
    }

    #[test]
    fn test_signed_and_string_accessors() {
        let mut s = Settings::new();
        s.set("x", "nice", Value::I32(-19)).unwrap();
        s.set("x", "method", Value::Str("rowhammer".into())).unwrap();
        assert_eq!(s.signed("x", "nice", Tag::I32), Some(-19));
        assert_eq!(s.string("x", "method"), Some("rowhammer"));
    }
}
