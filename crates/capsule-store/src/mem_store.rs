use crate::{StateStore, StoreResult, check_overwrite, validate_key};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// In-memory snapshot store; clones share the same map.
#[derive(Clone, Default)]
pub struct MemStateStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl std::fmt::Debug for MemStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStateStore")
            .field("entries", &self.len())
            .finish()
    }
}

impl MemStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let guard = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StateStore for MemStateStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let guard = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let mut guard = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = guard.get(key) {
            return check_overwrite(key, existing, bytes);
        }
        guard.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StateStoreExt, StoreError};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        name: String,
        counter: u64,
    }

    #[test]
    fn state_round_trip() {
        let store = MemStateStore::new();
        let value = Dummy {
            name: "demo".into(),
            counter: 7,
        };
        store.put_state("abc_o0", &value).expect("put");
        let loaded: Option<Dummy> = store.get_state("abc_o0").expect("get");
        assert_eq!(loaded, Some(value));
        assert_eq!(store.get_state::<Dummy>("missing_o0").unwrap(), None);
    }

    #[test]
    fn identical_rewrite_is_noop_but_different_content_conflicts() {
        let store = MemStateStore::new();
        store.set("abc_o1", b"one").unwrap();
        store.set("abc_o1", b"one").unwrap();
        let err = store.set("abc_o1", b"two").unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref key, .. } if key == "abc_o1"));
        assert_eq!(store.get("abc_o1").unwrap().as_deref(), Some(&b"one"[..]));
    }

    #[test]
    fn rejects_path_like_keys() {
        let store = MemStateStore::new();
        assert!(matches!(
            store.set("../escape", b"x"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("../escape"),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
