//! Unified error type hierarchy for stresskit
//!
//! Provides structured error handling with ParseError, SettingsError,
//! ArenaError, SchedError, SpawnError, PlanError and CapabilityError.

use std::io;
use thiserror::Error;

/// Sized-value parsing errors (option strings such as "4k" or "50%").
///
/// Every variant carries the subject (the option being parsed) and the
/// offending text so the failure can be reported against the exact input
/// without tearing down sibling stressors that already validated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{subject}: malformed value '{text}'")]
    Malformed { subject: String, text: String },

    #[error("{subject}: value '{text}' out of range")]
    TooLarge { subject: String, text: String },

    #[error("{subject}: illegal suffix in '{text}'")]
    BadSuffix { subject: String, text: String },

    #[error("{subject}: unknown CPU cache in '{text}'")]
    UnknownCache { subject: String, text: String },

    #[error("{subject}: percentage '{text}' with zero divisor")]
    DivByZero { subject: String, text: String },
}

impl ParseError {
    /// The offending substring the parser choked on.
    pub fn offending_text(&self) -> &str {
        match self {
            ParseError::Malformed { text, .. }
            | ParseError::TooLarge { text, .. }
            | ParseError::BadSuffix { text, .. }
            | ParseError::UnknownCache { text, .. }
            | ParseError::DivByZero { text, .. } => text,
        }
    }

    /// The subject (option name) the value belonged to.
    pub fn subject(&self) -> &str {
        match self {
            ParseError::Malformed { subject, .. }
            | ParseError::TooLarge { subject, .. }
            | ParseError::BadSuffix { subject, .. }
            | ParseError::UnknownCache { subject, .. }
            | ParseError::DivByZero { subject, .. } => subject,
        }
    }
}

/// Settings store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("setting {stressor}.{key}: tag changed within one run ({first} then {second})")]
    TagConflict {
        stressor: String,
        key: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("setting {stressor}.{key}: read as {wanted} but stored as {stored}")]
    TagMismatch {
        stressor: String,
        key: String,
        wanted: &'static str,
        stored: &'static str,
    },
}

/// Shared-memory arena errors.
#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("mmap of shared arena failed: {0}")]
    MapFailed(nix::errno::Errno),

    #[error("worker index {index} out of range (arena sized for {capacity})")]
    SlotOutOfRange { index: usize, capacity: usize },

    #[error("metric id {id} out of range (K = {k})")]
    MetricOutOfRange { id: usize, k: usize },
}

/// Scheduler-policy application errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("priority {prio} invalid for {policy} (valid {min}..={max})")]
    InvalidPriority {
        policy: &'static str,
        prio: i32,
        min: i32,
        max: i32,
    },

    #[error("sched_setscheduler({policy}) failed: {errno}")]
    SetFailed {
        policy: &'static str,
        errno: nix::errno::Errno,
    },
}

/// Worker spawn errors.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("fork failed after {attempts} attempts: {errno}")]
    ForkFailed {
        errno: nix::errno::Errno,
        attempts: u32,
    },
}

/// Run-plan construction and job-file errors.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("unknown stressor '{0}'")]
    UnknownStressor(String),

    #[error("stressor name '{0}' contains invalid characters")]
    InvalidName(String),

    #[error("unknown option '{option}' for stressor '{stressor}'")]
    UnknownOption { stressor: String, option: String },

    #[error("unknown scheduling policy '{0}'")]
    UnknownSched(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("job file error: {0}")]
    Io(#[from] io::Error),

    #[error("job file parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A stressor requires a capability the process does not hold.
///
/// The affected stressor is skipped (NOT_IMPLEMENTED at its slot), never
/// failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stressor '{stressor}' requires {capability}")]
pub struct CapabilityError {
    pub stressor: String,
    pub capability: &'static str,
}

/// Top-level result type for operations that may fail.
/// Use this as the return type for all fallible functions.
/// Example: `fn risky_operation() -> Result<String>`
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::BadSuffix {
            subject: "timeout".to_string(),
            text: "2m30s".to_string(),
        };
        assert_eq!(err.to_string(), "timeout: illegal suffix in '2m30s'");
        assert_eq!(err.offending_text(), "2m30s");
        assert_eq!(err.subject(), "timeout");
    }

    #[test]
    fn test_settings_error_display() {
        let err = SettingsError::TagMismatch {
            stressor: "vm".to_string(),
            key: "vm-bytes".to_string(),
            wanted: "u32",
            stored: "size-vm",
        };
        assert_eq!(
            err.to_string(),
            "setting vm.vm-bytes: read as u32 but stored as size-vm"
        );
    }

    #[test]
    fn test_result_type_ok() {
        let result: Result<i32> = Ok(42);
        assert!(result.is_ok());
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<i32> = Err("test error".into());
        assert!(result.is_err());
    }
}
