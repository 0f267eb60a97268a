//! Mutex-guarded key/value cache with optional JSON write-through

use super::{validate_thing_name, KvKey, KvValue, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct KvStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<KvKey, KvValue>>,
}

impl KvStore {
    /// Store without a backing file
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Open a store persisted at `path`, loading it if the file exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let raw: BTreeMap<String, KvValue> = serde_json::from_str(&content)?;

            for (name, value) in raw {
                match name.parse::<KvKey>() {
                    Ok(key) if key.default_value().same_type(&value) => {
                        entries.insert(key, value);
                    }
                    Ok(key) => warn!(
                        key = %key,
                        found = value.type_name(),
                        "Ignoring stored value of the wrong type"
                    ),
                    Err(_) => warn!(key = %name, "Ignoring unknown stored key"),
                }
            }
            debug!(path = %path.display(), entries = entries.len(), "Loaded key/value store");
        }

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<KvKey, KvValue>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, key: KvKey) -> KvValue {
        self.lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| key.default_value())
    }

    /// Owned copy of a text value; an empty value reads as `None`
    pub fn get_string(&self, key: KvKey) -> Result<Option<String>, StoreError> {
        match self.get(key) {
            KvValue::Text(s) if s.is_empty() => Ok(None),
            KvValue::Text(s) => Ok(Some(s)),
            KvValue::UInt(_) => Err(StoreError::TypeMismatch {
                key: key.as_str(),
                expected: "uint",
            }),
        }
    }

    pub fn get_u64(&self, key: KvKey) -> Result<u64, StoreError> {
        match self.get(key) {
            KvValue::UInt(v) => Ok(v),
            KvValue::Text(_) => Err(StoreError::TypeMismatch {
                key: key.as_str(),
                expected: "text",
            }),
        }
    }

    pub fn set_string(&self, key: KvKey, value: &str) -> Result<(), StoreError> {
        if key == KvKey::ThingName {
            validate_thing_name(value)?;
        }
        self.set(key, KvValue::Text(value.to_string()))
    }

    pub fn set_u64(&self, key: KvKey, value: u64) -> Result<(), StoreError> {
        self.set(key, KvValue::UInt(value))
    }

    fn set(&self, key: KvKey, value: KvValue) -> Result<(), StoreError> {
        let default = key.default_value();
        if !default.same_type(&value) {
            return Err(StoreError::TypeMismatch {
                key: key.as_str(),
                expected: default.type_name(),
            });
        }

        // The cache only changes once the new table is on disk
        let mut entries = self.lock();
        let mut updated = entries.clone();
        updated.insert(key, value);
        self.persist(&updated)?;
        *entries = updated;
        Ok(())
    }

    /// Write the whole table to a sibling temp file, then rename over the target
    fn persist(&self, entries: &HashMap<KvKey, KvValue>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let table: BTreeMap<&'static str, &KvValue> =
            entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let json = serde_json::to_string_pretty(&table)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_unset_keys() {
        let store = KvStore::in_memory();
        assert_eq!(store.get_string(KvKey::ThingName).unwrap(), None);
        assert_eq!(store.get_u64(KvKey::ReportSequence).unwrap(), 0);
    }

    #[test]
    fn test_set_and_get() {
        let store = KvStore::in_memory();
        store.set_string(KvKey::ThingName, "thing-42").unwrap();
        store.set_u64(KvKey::ReportSequence, 9).unwrap();

        assert_eq!(
            store.get_string(KvKey::ThingName).unwrap(),
            Some("thing-42".to_string())
        );
        assert_eq!(store.get_u64(KvKey::ReportSequence).unwrap(), 9);
    }

    #[test]
    fn test_type_mismatch() {
        let store = KvStore::in_memory();
        assert!(matches!(
            store.set_u64(KvKey::ThingName, 1),
            Err(StoreError::TypeMismatch { key: "thing_name", .. })
        ));
        assert!(matches!(
            store.get_string(KvKey::ReportSequence),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_thing_name_is_validated_on_set() {
        let store = KvStore::in_memory();
        assert!(matches!(
            store.set_string(KvKey::ThingName, "bad/name"),
            Err(StoreError::InvalidThingName(_))
        ));
        assert_eq!(store.get_string(KvKey::ThingName).unwrap(), None);
    }

    #[test]
    fn test_failed_write_keeps_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directory does not exist, so every write fails
        let store = KvStore::open(dir.path().join("missing").join("store.json")).unwrap();

        assert!(matches!(
            store.set_u64(KvKey::ReportSequence, 77),
            Err(StoreError::Io(_))
        ));
        assert_eq!(store.get_u64(KvKey::ReportSequence).unwrap(), 0);
    }
}
