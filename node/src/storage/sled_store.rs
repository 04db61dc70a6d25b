use super::{KeyValueStore, Result, StorageError};
use std::path::Path;

/// Durable store backed by a single sled tree.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    const TREE: &'static str = "local_storage";

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|source| StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn tree(&self) -> sled::Result<sled::Tree> {
        self.db.open_tree(Self::TREE)
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(value) = self.tree()?.get(key.as_bytes())? else {
            return Ok(None);
        };
        String::from_utf8(value.to_vec())
            .map(Some)
            .map_err(|_| StorageError::InvalidUtf8(key.to_owned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let tree = self.tree()?;
        tree.insert(key.as_bytes(), value.as_bytes())?;
        tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let tree = self.tree()?;
        tree.remove(key.as_bytes())?;
        tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = SledStore::open(&path).unwrap();
            store.set("messages_c1", r#"{"messages":[]}"#).unwrap();
            store.set("scratch", "1").unwrap();
            store.remove("scratch").unwrap();
        }

        let store = SledStore::open(&path).unwrap();
        assert_eq!(
            store.get("messages_c1").unwrap().as_deref(),
            Some(r#"{"messages":[]}"#)
        );
        assert_eq!(store.get("scratch").unwrap(), None);
    }
}
