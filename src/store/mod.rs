//! Key/value configuration store
//!
//! Device identity and the report sequence live behind a fixed key
//! enumeration. Each key has a typed default, so reads never fail for a key
//! that was never written.

pub mod kvstore;

pub use kvstore::KvStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum AWS IoT thing-name length
pub const THING_NAME_MAX_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Key '{key}' holds a {expected} value")]
    TypeMismatch {
        key: &'static str,
        expected: &'static str,
    },
    #[error("Unknown store key: {0}")]
    UnknownKey(String),
    #[error("Invalid thing name: {0}")]
    InvalidThingName(String),
}

/// Fixed set of store keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KvKey {
    ThingName,
    ReportSequence,
}

impl KvKey {
    pub const ALL: [KvKey; 2] = [KvKey::ThingName, KvKey::ReportSequence];

    pub fn as_str(&self) -> &'static str {
        match self {
            KvKey::ThingName => "thing_name",
            KvKey::ReportSequence => "report_seq",
        }
    }

    pub fn default_value(&self) -> KvValue {
        match self {
            KvKey::ThingName => KvValue::Text(String::new()),
            KvKey::ReportSequence => KvValue::UInt(0),
        }
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KvKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| StoreError::UnknownKey(s.to_string()))
    }
}

/// Stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KvValue {
    UInt(u64),
    Text(String),
}

impl KvValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            KvValue::UInt(_) => "uint",
            KvValue::Text(_) => "text",
        }
    }

    fn same_type(&self, other: &KvValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Check a thing name against the AWS IoT charset `[a-zA-Z0-9:_-]`
pub fn validate_thing_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > THING_NAME_MAX_LEN {
        return Err(StoreError::InvalidThingName(format!(
            "'{name}' must be 1 to {THING_NAME_MAX_LEN} characters"
        )));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-');
    if !valid_chars {
        return Err(StoreError::InvalidThingName(format!(
            "'{name}' must match pattern [a-zA-Z0-9:_-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_round_trip() {
        for key in KvKey::ALL {
            assert_eq!(key.as_str().parse::<KvKey>().unwrap(), key);
        }
        assert!(matches!(
            "nope".parse::<KvKey>(),
            Err(StoreError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_thing_name_validation() {
        assert!(validate_thing_name("thing-42").is_ok());
        assert!(validate_thing_name("factory:line_7-dev").is_ok());
        assert!(validate_thing_name("").is_err());
        assert!(validate_thing_name("bad/name").is_err());
        assert!(validate_thing_name("has space").is_err());
        assert!(validate_thing_name(&"a".repeat(129)).is_err());
        assert!(validate_thing_name(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_untagged_values_deserialize() {
        let uint: KvValue = serde_json::from_str("17").unwrap();
        assert_eq!(uint, KvValue::UInt(17));
        let text: KvValue = serde_json::from_str("\"thing\"").unwrap();
        assert_eq!(text, KvValue::Text("thing".to_string()));
    }
}
