//! Atomic JSON file persistence, shared by the paired-device registry and
//! the known-peers file (spec §6: "written atomically, write-temp-then-rename").

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{SyncError, SyncResult};

/// Read a JSON file, returning `default` if it doesn't exist yet.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> SyncResult<T> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Persistence(format!("parsing {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(SyncError::Persistence(format!("reading {}: {e}", path.display()))),
    }
}

/// Write `value` to `path` atomically: serialize to a sibling temp file,
/// flush, then rename over the destination. A reader never observes a
/// partially written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::Persistence(format!("creating {}: {e}", parent.display())))?;
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| SyncError::Persistence(format!("serializing {}: {e}", path.display())))?;

    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, &json)
        .map_err(|e| SyncError::Persistence(format!("writing {}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| SyncError::Persistence(format!("renaming {} to {}: {e}", tmp_path.display(), path.display())))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::path::PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        values: Vec<u32>,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");

        let sample = Sample { values: vec![1, 2, 3] };
        write_json_atomic(&path, &sample).unwrap();

        let loaded: Sample = read_json_or_default(&path).unwrap();
        assert_eq!(loaded, sample);
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Sample = read_json_or_default(&path).unwrap();
        assert_eq!(loaded, Sample::default());
    }
}
