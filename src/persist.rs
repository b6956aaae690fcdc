//! JSON documents on disk, replaced atomically.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Outcome of reading a JSON document.
#[derive(Debug)]
pub enum Loaded<T> {
    Missing,
    Parsed(T),
    /// File exists but is not a valid document.
    Unparseable(String),
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Loaded<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(e),
    };

    if content.trim().is_empty() {
        return Ok(Loaded::Missing);
    }

    Ok(match serde_json::from_str(&content) {
        Ok(value) => Loaded::Parsed(value),
        Err(e) => Loaded::Unparseable(e.to_string()),
    })
}

/// Write to `{path}.tmp`, then rename over `path`. Readers see either the old
/// or the new document, never a partial one.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(value).map_err(io::Error::other)?;

    let temp_path = temp_path(path);
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}

/// Move an unreadable document aside so a fresh one can take its place.
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    let target = PathBuf::from(name);
    std::fs::rename(path, &target)?;
    Ok(target)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn missing_and_empty_files_read_as_missing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        assert!(matches!(read_json::<BTreeMap<String, u32>>(&path).unwrap(), Loaded::Missing));

        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(read_json::<BTreeMap<String, u32>>(&path).unwrap(), Loaded::Missing));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/doc.json");
        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 1u32);

        write_json_atomic(&path, &doc).unwrap();

        assert!(!temp_dir.path().join("nested/doc.json.tmp").exists());
        match read_json::<BTreeMap<String, u32>>(&path).unwrap() {
            Loaded::Parsed(read) => assert_eq!(read, doc),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_reported_and_can_be_quarantined() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            read_json::<BTreeMap<String, u32>>(&path).unwrap(),
            Loaded::Unparseable(_)
        ));

        let moved = quarantine(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(moved, temp_dir.path().join("doc.json.corrupt"));
    }
}
