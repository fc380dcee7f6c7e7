//! Whole-file JSON documents with file locking and atomic replace.
//!
//! Used for calibration profiles and the keg book, which are read whole,
//! modified, and written back.

use crate::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Load a JSON document with a shared lock.
///
/// Returns `Ok(None)` if the file does not exist. Unlike journals, a
/// corrupted document is an error and is never replaced with defaults.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let mut contents = String::new();
    let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
    file.unlock()?;
    read?;

    let value = serde_json::from_str(&contents).map_err(|e| {
        tracing::warn!("Failed to parse {:?}: {}", path, e);
        Error::Json(e)
    })?;
    tracing::debug!("Loaded {:?}", path);
    Ok(Some(value))
}

/// Save a JSON document atomically:
/// 1. Write to a temp file in the same directory
/// 2. Sync to disk
/// 3. Rename over the original
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Other(format!("{:?} has no parent directory", path)))?;
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    temp.as_file().lock_exclusive()?;

    {
        let mut writer = std::io::BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    temp.as_file().sync_all()?;
    temp.as_file().unlock()?;

    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::debug!("Saved {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
        litres: f64,
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("sub/doc.json");
        let doc = Doc {
            name: "stout".into(),
            litres: 19.5,
        };

        save_json(&path, &doc).unwrap();
        let loaded: Option<Doc> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(doc));
    }

    #[test]
    fn test_missing_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let loaded: Option<Doc> = load_json(&temp_dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupted_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("doc.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let result: Result<Option<Doc>> = load_json(&path);
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("doc.json");
        save_json(
            &path,
            &Doc {
                name: "ipa".into(),
                litres: 1.0,
            },
        )
        .unwrap();

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "doc.json")
            .collect();
        assert!(extras.is_empty(), "unexpected files: {:?}", extras);
    }
}
