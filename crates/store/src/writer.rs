//! State writer used by bots to publish their status for the dashboard.
//!
//! Every operation is an independent read-modify-write of one file with no
//! locking. Two processes writing the same bot id can lose an update (the
//! last rename wins); readers never see a torn file.

use crate::atomic::write_json_atomic;
use chrono::{DateTime, Utc};
use fleetstate_core::{
    parse_timestamp, validate_bot_id, BotState, BotStatus, FleetConfig, LastTrade, Position,
    StateError,
};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub type Fields = Map<String, Value>;

/// Writes `<state_dir>/<bot_id>.json` for a single bot.
#[derive(Debug, Clone)]
pub struct StateWriter {
    bot_id: String,
    bot_name: String,
    path: PathBuf,
}

impl StateWriter {
    /// Create a writer and make sure a state file exists, writing the
    /// initial record if there is none yet.
    pub fn new(
        config: &FleetConfig,
        bot_id: &str,
        bot_name: Option<&str>,
    ) -> Result<Self, StateError> {
        let writer = Self::open(config, bot_id, bot_name)?;
        fs::create_dir_all(&config.state_dir)?;
        if !writer.path.exists() {
            let initial = writer.defaults()?;
            writer.commit(initial, None)?;
        }
        Ok(writer)
    }

    /// Create a writer without touching the filesystem.
    pub fn open(
        config: &FleetConfig,
        bot_id: &str,
        bot_name: Option<&str>,
    ) -> Result<Self, StateError> {
        validate_bot_id(bot_id)?;
        Ok(Self {
            bot_id: bot_id.to_string(),
            bot_name: bot_name.unwrap_or(bot_id).to_string(),
            path: config.state_file(bot_id),
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shallow-merge `updates` over the current record and persist it.
    ///
    /// Nested values such as `position` are replaced wholesale. `bot_id`,
    /// `status_color` and `last_update` are always recomputed, whatever the
    /// caller passed for them.
    pub fn update(&self, updates: Fields) -> Result<BotState, StateError> {
        let mut doc = self.current()?;
        let previous = last_update_of(&doc);
        doc.extend(updates);
        self.commit(doc, previous)
    }

    /// Mark the bot running. `extra` is merged after the status, so it may
    /// override it.
    pub fn set_running(&self, extra: Option<Fields>) -> Result<BotState, StateError> {
        let mut updates = status_fields(BotStatus::Running);
        if let Some(extra) = extra {
            updates.extend(extra);
        }
        self.update(updates)
    }

    pub fn set_error(&self, message: &str) -> Result<BotState, StateError> {
        let mut updates = status_fields(BotStatus::Error);
        updates.insert("last_error".into(), Value::from(message));
        self.update(updates)
    }

    pub fn set_paused(&self) -> Result<BotState, StateError> {
        self.update(status_fields(BotStatus::Paused))
    }

    pub fn set_stopped(&self) -> Result<BotState, StateError> {
        self.update(status_fields(BotStatus::Stopped))
    }

    /// Count a closed trade and add its P&L to both accumulators.
    ///
    /// Counters are incremented relative to what is on disk right now, so a
    /// concurrent writer between our read and our rename is overwritten.
    pub fn record_trade(&self, pnl: f64, side: &str) -> Result<BotState, StateError> {
        let mut doc = self.current()?;
        let previous = last_update_of(&doc);

        bump_count(&mut doc, "trades_total");
        bump_count(&mut doc, "trades_24h");
        add_number(&mut doc, "pnl_total", pnl);
        add_number(&mut doc, "pnl_24h", pnl);
        let trade = LastTrade {
            time: Some(Utc::now()),
            pnl,
            side: side.to_string(),
        };
        doc.insert("last_trade".into(), serde_json::to_value(trade)?);

        self.commit(doc, previous)
    }

    /// Replace the position, or clear it when `side` is `None`.
    pub fn update_position(
        &self,
        side: Option<&str>,
        size: f64,
        entry_price: Option<f64>,
    ) -> Result<BotState, StateError> {
        let position = side.map(|side| Position {
            side: side.to_string(),
            size,
            entry_price,
            opened_at: Some(Utc::now()),
        });
        let mut updates = Fields::new();
        updates.insert("position".into(), serde_json::to_value(position)?);
        self.update(updates)
    }

    /// The record on disk, or the initial record if there is no file.
    pub fn get_state(&self) -> Result<BotState, StateError> {
        let doc = self.current()?;
        to_state(&self.bot_id, doc)
    }

    fn defaults(&self) -> Result<Fields, StateError> {
        to_fields(&BotState::initial(&self.bot_id, &self.bot_name))
    }

    fn read_document(&self) -> Result<Option<Fields>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(StateError::ParseError(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
        }
    }

    fn current(&self) -> Result<Fields, StateError> {
        let mut doc = self.defaults()?;
        if let Some(on_disk) = self.read_document()? {
            doc.extend(on_disk);
        }
        Ok(doc)
    }

    /// Stamp the merged document and persist it as-is. Only `bot_id`,
    /// `status_color` and `last_update` are rewritten; every other value is
    /// written back exactly as the caller or the previous file had it.
    fn commit(
        &self,
        mut doc: Fields,
        previous: Option<DateTime<Utc>>,
    ) -> Result<BotState, StateError> {
        let status = doc
            .get("status")
            .and_then(Value::as_str)
            .map(BotStatus::from)
            .unwrap_or_default();

        doc.insert("bot_id".into(), Value::from(self.bot_id.as_str()));
        doc.insert("status_color".into(), Value::from(status.color().as_str()));
        doc.insert("last_update".into(), serde_json::to_value(next_stamp(previous))?);

        write_json_atomic(&self.path, &doc)?;
        debug!(bot_id = %self.bot_id, status = %status, "Wrote state file");
        to_state(&self.bot_id, doc)
    }
}

fn status_fields(status: BotStatus) -> Fields {
    let mut fields = Fields::new();
    fields.insert("status".into(), Value::from(status.as_str()));
    fields
}

fn to_fields(state: &BotState) -> Result<Fields, StateError> {
    match serde_json::to_value(state)? {
        Value::Object(map) => Ok(map),
        _ => Err(StateError::ParseError("state did not serialize to an object".into())),
    }
}

fn to_state(bot_id: &str, doc: Fields) -> Result<BotState, StateError> {
    BotState::from_document(bot_id, doc)
        .map_err(|e| StateError::ParseError(format!("invalid state for {}: {}", bot_id, e)))
}

fn last_update_of(doc: &Fields) -> Option<DateTime<Utc>> {
    doc.get("last_update")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

fn number_of(doc: &Fields, key: &str) -> f64 {
    match doc.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

fn bump_count(doc: &mut Fields, key: &str) {
    let current = match doc.get(key).and_then(Value::as_u64) {
        Some(n) => n,
        None => number_of(doc, key).max(0.0) as u64,
    };
    doc.insert(key.to_string(), Value::from(current + 1));
}

fn add_number(doc: &mut Fields, key: &str, delta: f64) {
    let total = number_of(doc, key) + delta;
    doc.insert(key.to_string(), Value::from(total));
}

/// Current time, nudged forward if the clock has not passed `previous`.
fn next_stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::temp_path;
    use fleetstate_core::StatusColor;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (tempfile::TempDir, FleetConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = FleetConfig::from_workspace(dir.path());
        (dir, config)
    }

    #[test]
    fn test_new_writes_initial_record() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", Some("Market Maker 1H")).unwrap();

        let state = writer.get_state().unwrap();
        assert_eq!(state.bot_id, "mm_1h");
        assert_eq!(state.bot_name, "Market Maker 1H");
        assert_eq!(state.status, BotStatus::Initializing);
        assert_eq!(state.status_color, StatusColor::Yellow);
        assert_eq!(state.trades_total, 0);
        assert!(state.position.is_none());
        assert!(state.last_update.is_some());
        assert!(writer.path().exists());
    }

    #[test]
    fn test_open_does_not_create_file() {
        let (_dir, config) = setup();
        let writer = StateWriter::open(&config, "mm_1h", None).unwrap();
        assert!(!writer.path().exists());
        assert_eq!(writer.get_state().unwrap().bot_name, "mm_1h");
    }

    #[test]
    fn test_status_update_leaves_other_fields() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "btc_long_v1", None).unwrap();
        writer
            .update(fields(json!({"pnl_total": 12.5, "trades_total": 7})))
            .unwrap();
        writer.update_position(Some("long"), 0.5, Some(45000.0)).unwrap();

        let state = writer.update(fields(json!({"status": "paused"}))).unwrap();
        assert_eq!(state.status, BotStatus::Paused);
        assert_eq!(state.pnl_total, 12.5);
        assert_eq!(state.trades_total, 7);
        let position = state.position.unwrap();
        assert_eq!(position.side, "long");
        assert_eq!(position.entry_price, Some(45000.0));
    }

    #[test]
    fn test_color_and_stamp_not_caller_settable() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_15m", None).unwrap();
        let state = writer
            .update(fields(json!({
                "status": "stopped",
                "status_color": "green",
                "last_update": "2000-01-01T00:00:00Z",
                "bot_id": "someone_else"
            })))
            .unwrap();
        assert_eq!(state.status_color, StatusColor::Red);
        assert_eq!(state.bot_id, "mm_15m");
        assert!(state.last_update.unwrap().timestamp() > 946_684_800);
    }

    #[test]
    fn test_unrecognized_status_is_yellow() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        let state = writer.update(fields(json!({"status": "warming_up"}))).unwrap();
        assert_eq!(state.status.as_str(), "warming_up");
        assert_eq!(state.status_color, StatusColor::Yellow);
    }

    #[test]
    fn test_record_trade_accumulates() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "doge_short_v1", None).unwrap();
        writer.record_trade(5.0, "long").unwrap();
        let state = writer.record_trade(3.0, "short").unwrap();

        assert_eq!(state.trades_total, 2);
        assert_eq!(state.trades_24h, 2);
        assert_eq!(state.pnl_total, 8.0);
        assert_eq!(state.pnl_24h, 8.0);
        let last = state.last_trade.unwrap();
        assert_eq!(last.pnl, 3.0);
        assert_eq!(last.side, "short");

        // persisted, not just returned
        assert_eq!(writer.get_state().unwrap().trades_total, 2);
    }

    #[test]
    fn test_record_trade_without_file() {
        let (_dir, config) = setup();
        let writer = StateWriter::open(&config, "fresh", None).unwrap();
        let state = writer.record_trade(-1.5, "long").unwrap();
        assert_eq!(state.trades_total, 1);
        assert_eq!(state.pnl_total, -1.5);
        assert_eq!(state.status, BotStatus::Initializing);
    }

    #[test]
    fn test_position_cleared_when_side_missing() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        writer.update_position(Some("short"), 2.0, None).unwrap();
        let state = writer.update_position(None, 0.0, None).unwrap();
        assert!(state.position.is_none());

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(writer.path()).unwrap()).unwrap();
        assert!(raw["position"].is_null());
    }

    #[test]
    fn test_derived_status_operations() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();

        let state = writer
            .set_running(Some(fields(json!({"uptime_seconds": 30}))))
            .unwrap();
        assert_eq!(state.status, BotStatus::Running);
        assert_eq!(state.status_color, StatusColor::Green);
        assert_eq!(state.uptime_seconds, 30.0);

        let state = writer.set_error("exchange timeout").unwrap();
        assert_eq!(state.status, BotStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("exchange timeout"));

        assert_eq!(writer.set_paused().unwrap().status_color, StatusColor::Yellow);
        assert_eq!(writer.set_stopped().unwrap().status_color, StatusColor::Red);
    }

    #[test]
    fn test_last_update_strictly_increases() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        let mut last = writer.get_state().unwrap().last_update.unwrap();
        for _ in 0..20 {
            let stamp = writer.set_paused().unwrap().last_update.unwrap();
            assert!(stamp > last);
            last = stamp;
        }
    }

    #[test]
    fn test_extra_keys_survive_updates() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        writer.update(fields(json!({"pid": 99, "exchange": "sim"}))).unwrap();
        let state = writer.record_trade(1.0, "long").unwrap();
        assert_eq!(state.extra.get("pid"), Some(&json!(99)));
        assert_eq!(state.extra.get("exchange"), Some(&json!("sim")));
    }

    #[test]
    fn test_partial_position_is_merged_verbatim() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        let state = writer
            .update(fields(json!({
                "status": "running",
                "pnl_24h": 12.45,
                "position": {"side": "long", "size": 0.5}
            })))
            .unwrap();

        let position = state.position.unwrap();
        assert_eq!(position.side, "long");
        assert_eq!(position.size, 0.5);
        assert!(position.opened_at.is_none());

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(writer.path()).unwrap()).unwrap();
        assert_eq!(raw["position"], json!({"side": "long", "size": 0.5}));
        assert_eq!(raw["status_color"], "green");
    }

    #[test]
    fn test_foreign_field_types_survive_writes() {
        let (_dir, config) = setup();
        fs::create_dir_all(&config.state_dir).unwrap();
        let path = config.state_file("btc_long_v1");
        fs::write(
            &path,
            r#"{"bot_id": "btc_long_v1", "status": "running", "uptime_seconds": 12.7, "trades_total": 3.0, "pnl_total": 1}"#,
        )
        .unwrap();

        let writer = StateWriter::open(&config, "btc_long_v1", None).unwrap();
        let state = writer.set_paused().unwrap();
        assert_eq!(state.status, BotStatus::Paused);
        assert_eq!(state.uptime_seconds, 12.7);

        let state = writer.record_trade(2.5, "long").unwrap();
        assert_eq!(state.trades_total, 4);
        assert_eq!(state.pnl_total, 3.5);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["uptime_seconds"], json!(12.7));
        assert_eq!(raw["trades_total"], json!(4));
        assert_eq!(raw["status"], "paused");
    }

    #[test]
    fn test_crash_mid_write_leaves_previous_document() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        let before = writer.set_running(None).unwrap();

        // A writer killed after starting the temp file but before the rename.
        fs::write(temp_path(writer.path()), b"{\"bot_id\": \"mm_1h\", \"sta").unwrap();

        let text = fs::read_to_string(writer.path()).unwrap();
        let on_disk: BotState = serde_json::from_str(&text).unwrap();
        assert_eq!(on_disk, before);

        // The next write recovers and removes the stray temp file.
        writer.set_paused().unwrap();
        assert!(!temp_path(writer.path()).exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (_dir, config) = setup();
        let writer = StateWriter::new(&config, "mm_1h", None).unwrap();
        fs::write(writer.path(), b"[1, 2, 3]").unwrap();
        assert!(matches!(writer.set_paused(), Err(StateError::ParseError(_))));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let (_dir, config) = setup();
        assert!(matches!(
            StateWriter::new(&config, "../escape", None),
            Err(StateError::InvalidBotId(_))
        ));
    }
}
