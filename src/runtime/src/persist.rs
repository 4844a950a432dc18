//! Atomic JSON files for engine metadata.
//!
//! Metadata is written to a sibling `*.json.tmp` file and renamed over
//! the target, so a crash never leaves a half-written file behind.

use dockyard_core::error::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// A JSON document of type `T` stored at a fixed path.
#[derive(Debug)]
pub struct JsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + Default> JsonFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Load the document, or `T::default()` if the file doesn't exist yet.
    pub fn load(&self) -> Result<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }

        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            EngineError::Other(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_str(&data).map_err(|e| {
            EngineError::SerializationError(format!(
                "failed to parse {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Save the document (atomic write).
    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Other(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(value)?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            EngineError::Other(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            EngineError::Other(format!(
                "failed to rename {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<HashMap<String, u32>> = JsonFile::new(dir.path().join("x.json"));
        assert!(file.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<HashMap<String, u32>> =
            JsonFile::new(dir.path().join("nested").join("x.json"));

        let mut value = HashMap::new();
        value.insert("a".to_string(), 1);
        file.save(&value).unwrap();

        assert_eq!(file.load().unwrap(), value);
        assert!(!dir.path().join("nested").join("x.json.tmp").exists());
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        std::fs::write(&path, "not json").unwrap();
        let file: JsonFile<HashMap<String, u32>> = JsonFile::new(path);
        assert!(matches!(
            file.load().unwrap_err(),
            EngineError::SerializationError(_)
        ));
    }
}
