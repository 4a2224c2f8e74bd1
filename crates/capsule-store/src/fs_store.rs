use crate::{StateStore, StoreResult, check_overwrite, io_error, validate_key};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

/// Filesystem-backed snapshot store rooted at `<root>/.capsules/states`.
#[derive(Clone)]
pub struct FsStateStore {
    states_dir: PathBuf,
}

impl fmt::Debug for FsStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStateStore")
            .field("states_dir", &self.states_dir)
            .finish()
    }
}

impl FsStateStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let states_dir = root.as_ref().join(".capsules").join("states");
        fs::create_dir_all(&states_dir).map_err(|e| io_error(&states_dir, e))?;
        Ok(Self { states_dir })
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.states_dir.join(key.replace(':', "-"))
    }

    /// Returns `Ok(false)` when the file already exists.
    fn write_once(path: &Path, bytes: &[u8]) -> StoreResult<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_error(path, e))?;
                file.sync_all().map_err(|e| io_error(path, e))?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

impl StateStore for FsStateStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.state_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn set(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let path = self.state_path(key);
        if Self::write_once(&path, bytes)? {
            return Ok(());
        }
        let existing = fs::read(&path).map_err(|e| io_error(path.clone(), e))?;
        check_overwrite(key, &existing, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StateStoreExt, StoreError};
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        name: String,
        counter: u64,
    }

    #[test]
    fn state_round_trip_survives_reopen() {
        let dir = TempDir::new().expect("tmp");
        let value = Dummy {
            name: "demo".into(),
            counter: 42,
        };
        {
            let store = FsStateStore::open(dir.path()).expect("open");
            store.put_state("feed_o2", &value).expect("put");
        }
        let store = FsStateStore::open(dir.path()).expect("reopen");
        let loaded: Option<Dummy> = store.get_state("feed_o2").expect("get");
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn conflicting_write_is_rejected() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStateStore::open(dir.path()).expect("open");
        store.set("feed_d0", b"gone").unwrap();
        store.set("feed_d0", b"gone").unwrap();
        assert!(matches!(
            store.set("feed_d0", b"back"),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn path_like_keys_are_rejected_on_read_and_write() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStateStore::open(dir.path()).expect("open");
        assert!(matches!(store.get("../x"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.set("a/b", b"x"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn missing_key_is_none() {
        let dir = TempDir::new().expect("tmp");
        let store = FsStateStore::open(dir.path()).expect("open");
        assert_eq!(store.get("nothing_o0").unwrap(), None);
    }
}
