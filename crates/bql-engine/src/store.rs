//! Btable persistence

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::btable::Btable;
use crate::error::EngineError;

/// Where btables live between statements.
pub trait BtableStore: Send {
    /// Names of all stored btables, sorted.
    fn list(&self) -> Result<Vec<String>, EngineError>;

    fn get(&self, name: &str) -> Result<Option<Btable>, EngineError>;

    fn put(&mut self, btable: &Btable) -> Result<(), EngineError>;

    /// Returns whether the btable existed.
    fn remove(&mut self, name: &str) -> Result<bool, EngineError>;

    fn exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.get(name)?.is_some())
    }
}

/// In-process store, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    btables: BTreeMap<String, Btable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BtableStore for MemoryStore {
    fn list(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.btables.keys().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<Option<Btable>, EngineError> {
        Ok(self.btables.get(name).cloned())
    }

    fn put(&mut self, btable: &Btable) -> Result<(), EngineError> {
        self.btables.insert(btable.name.clone(), btable.clone());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<bool, EngineError> {
        Ok(self.btables.remove(name).is_some())
    }

    fn exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.btables.contains_key(name))
    }
}

/// One JSON file per btable under a data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::file(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl BtableStore for FileStore {
    fn list(&self) -> Result<Vec<String>, EngineError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| EngineError::file(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| EngineError::file(&self.dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn get(&self, name: &str) -> Result<Option<Btable>, EngineError> {
        let path = self.path_for(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::file(&path, e)),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn put(&mut self, btable: &Btable) -> Result<(), EngineError> {
        let path = self.path_for(&btable.name);
        let tmp = self.dir.join(format!("{}.json.tmp", btable.name));
        let json = serde_json::to_vec(btable)?;
        std::fs::write(&tmp, json).map_err(|e| EngineError::file(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| EngineError::file(&path, e))?;
        debug!(btable = %btable.name, path = %path.display(), "Saved btable");
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<bool, EngineError> {
        let path = self.path_for(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::file(&path, e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.path_for(name).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btable::ColumnMeta;
    use bql_model::ColumnType;
    use chrono::Utc;

    fn sample(name: &str) -> Btable {
        Btable {
            name: name.to_string(),
            columns: vec![ColumnMeta { name: "x".into(), ctype: ColumnType::Multinomial }],
            rows: vec![vec![Some("a".into())], vec![None]],
            models: Default::default(),
            labels: Default::default(),
            metadata: Default::default(),
            column_lists: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn exercise(store: &mut dyn BtableStore) {
        assert!(store.list().unwrap().is_empty());
        store.put(&sample("zeta")).unwrap();
        store.put(&sample("alpha")).unwrap();
        assert_eq!(store.list().unwrap(), ["alpha", "zeta"]);
        assert!(store.exists("alpha").unwrap());
        assert_eq!(store.get("alpha").unwrap().unwrap().rows[1], vec![None]);
        assert!(store.remove("alpha").unwrap());
        assert!(!store.remove("alpha").unwrap());
        assert!(store.get("alpha").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise(&mut MemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path().join("data")).unwrap();
        exercise(&mut store);
        assert!(!store.dir().join("zeta.json.tmp").exists());
    }
}
