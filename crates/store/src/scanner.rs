use chrono::{DateTime, Utc};
use fleetstate_core::{BotState, BotStatus, FileObservation, StateError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Summarise every readable `*.json` file in the state directory, keyed by
/// file stem. Files that cannot be read or parsed are skipped.
pub fn scan_state_dir(dir: &Path) -> BTreeMap<String, FileObservation> {
    let mut states = BTreeMap::new();
    for path in json_files(dir) {
        let Some(bot_id) = bot_id_of(&path) else {
            continue;
        };
        match observe_file(&path) {
            Ok(obs) => {
                states.insert(bot_id, obs);
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable state file");
            }
        }
    }
    states
}

/// Load the full state of every bot. Only files that are not a JSON object
/// are skipped; fields of an unexpected type read as their defaults.
pub fn load_all_states(dir: &Path) -> BTreeMap<String, BotState> {
    let mut states = BTreeMap::new();
    for path in json_files(dir) {
        let Some(bot_id) = bot_id_of(&path) else {
            continue;
        };
        let parsed = read_object(&path)
            .and_then(|doc| BotState::from_document(&bot_id, doc).map_err(StateError::from));
        match parsed {
            Ok(state) => {
                states.insert(bot_id, state);
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable state file");
            }
        }
    }
    states
}

/// Delete every state file. Returns how many were removed.
pub fn clear_all_states(dir: &Path) -> Result<usize, StateError> {
    let mut removed = 0;
    for path in json_files(dir) {
        fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Cannot list state directory");
            }
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    files.sort();
    files
}

fn bot_id_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_string())
}

fn read_object(path: &Path) -> Result<Map<String, Value>, StateError> {
    let bytes = fs::read(path)?;
    match serde_json::from_slice(&bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(StateError::ParseError(format!("{} is not a JSON object", path.display()))),
    }
}

fn observe_file(path: &Path) -> Result<FileObservation, StateError> {
    let obj = read_object(path)?;

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .map(BotStatus::from)
        .unwrap_or_default();
    let last_update = obj
        .get("last_update")
        .and_then(Value::as_str)
        .map(str::to_string);
    let file_mtime: DateTime<Utc> = fs::metadata(path)?.modified()?.into();

    Ok(FileObservation {
        status,
        last_update,
        file_mtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.json"), r#"{"status": "running", "last_update": "2026-01-01T00:00:00Z"}"#).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("array.json"), "[1, 2]").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("good.tmp"), "{").unwrap();

        let states = scan_state_dir(dir.path());
        assert_eq!(states.len(), 1);
        let good = &states["good"];
        assert_eq!(good.status, BotStatus::Running);
        assert_eq!(good.last_update.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_missing_status_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bare.json"), "{}").unwrap();
        let states = scan_state_dir(dir.path());
        assert_eq!(states["bare"].status, BotStatus::Unknown);
        assert!(states["bare"].last_update.is_none());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_state_dir(&dir.path().join("nope")).is_empty());
        assert!(load_all_states(&dir.path().join("nope")).is_empty());
    }

    #[test]
    fn test_load_and_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), r#"{"bot_id": "a", "status": "paused"}"#).unwrap();
        fs::write(dir.path().join("b.json"), r#"{"pnl_total": "oops", "uptime_seconds": 12.7, "status": "running"}"#).unwrap();
        fs::write(dir.path().join("c.json"), "[1, 2]").unwrap();

        let states = load_all_states(dir.path());
        assert_eq!(states.len(), 2);
        assert_eq!(states["a"].status, BotStatus::Paused);
        let b = &states["b"];
        assert_eq!(b.bot_id, "b");
        assert_eq!(b.status, BotStatus::Running);
        assert_eq!(b.pnl_total, 0.0);
        assert_eq!(b.uptime_seconds, 12.7);

        assert_eq!(clear_all_states(dir.path()).unwrap(), 3);
        assert!(scan_state_dir(dir.path()).is_empty());
    }
}
