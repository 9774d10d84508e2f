//! Filesystem helpers shared across modules.
//!
//! Every error carries the operation and path that failed.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| Error::io_path("creating directory", parent, e))
}

/// Ensure the parent directory of a file path exists (synchronous variant).
pub fn ensure_parent_dir_sync(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(parent).map_err(|e| Error::io_path("creating directory", parent, e))
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// Readers see either the previous file or the new one, never a partial write.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path).await?;
    let body = serde_json::to_vec_pretty(value)?;

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| Error::io_path("writing", &tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::io_path("replacing", path, e));
    }
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io_path("reading", path, e)),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.tmp", std::process::id()));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        executions: u64,
    }

    #[tokio::test]
    async fn test_write_then_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/status.json");

        write_json_atomic(&path, &Probe { executions: 3 }).await.unwrap();
        write_json_atomic(&path, &Probe { executions: 4 }).await.unwrap();

        assert_eq!(read_json::<Probe>(&path).unwrap(), Some(Probe { executions: 4 }));
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_missing_json_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_json::<Probe>(&dir.path().join("absent.json")).unwrap(), None);
    }

    #[test]
    fn test_read_corrupt_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read_json::<Probe>(&path), Err(Error::Serialization(_))));
    }
}
