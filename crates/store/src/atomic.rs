use fleetstate_core::StateError;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Scratch path used while writing `path`: same directory, `.tmp` extension.
pub fn temp_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Write `bytes` to `path` so that readers only ever see the old or the new
/// contents: write a sibling temp file, fsync it, then rename over the target.
///
/// This does not serialize concurrent writers; the last rename wins.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Pretty-print `value` as JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}
