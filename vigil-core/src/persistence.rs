//! Shared persistence utilities: atomic file writes and JSON load/save.
//!
//! Checkpoints and the configuration backup are both written through
//! [`atomic_write`]: the full payload lands in a `.tmp` sibling, is synced,
//! and only then renamed over the target. Readers never observe a partial file.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON and hands it to [`atomic_write`].
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling file, syncs it, then renames to the target path.
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Read and deserialize a JSON file that must exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// SHA-256 over the compact JSON encoding of `value`.
///
/// `serde_json` objects keep their keys sorted, so equal documents always
/// produce equal fingerprints regardless of the key order in the source file.
pub fn json_fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        epoch: usize,
        weights: Vec<f64>,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record.json");

        let data = Record {
            epoch: 3,
            weights: vec![0.1, -2.5e-7, 1.0 / 3.0],
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Record> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("save").join("checkpoints").join("ckpt.best.json");

        atomic_write_json(&path, &"best").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<Record>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_read_json_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = read_json::<Record>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.best.json");

        atomic_write(&path, b"{}").unwrap();
        atomic_write(&path, b"{\"epoch\": 2}").unwrap();

        assert!(!path.with_extension("tmp").exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"epoch\": 2}");
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"type": "mlp", "hidden": 32}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"hidden": 32, "type": "mlp"}"#).unwrap();
        let c: serde_json::Value = serde_json::from_str(r#"{"hidden": 64, "type": "mlp"}"#).unwrap();
        assert_eq!(json_fingerprint(&a), json_fingerprint(&b));
        assert_ne!(json_fingerprint(&a), json_fingerprint(&c));
    }
}
