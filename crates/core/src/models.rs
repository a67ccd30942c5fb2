use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status a bot reports about itself.
///
/// Any string outside the known set is kept verbatim in `Other` so a state
/// file written by a newer bot survives a round trip through this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BotStatus {
    Initializing,
    Running,
    Active,
    Paused,
    Stopped,
    Error,
    Offline,
    #[default]
    Unknown,
    Other(String),
}

impl BotStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BotStatus::Initializing => "initializing",
            BotStatus::Running => "running",
            BotStatus::Active => "active",
            BotStatus::Paused => "paused",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
            BotStatus::Offline => "offline",
            BotStatus::Unknown => "unknown",
            BotStatus::Other(s) => s,
        }
    }

    /// Dashboard color for this status.
    pub fn color(&self) -> StatusColor {
        match self {
            BotStatus::Running | BotStatus::Active => StatusColor::Green,
            BotStatus::Initializing | BotStatus::Paused => StatusColor::Yellow,
            BotStatus::Stopped | BotStatus::Error => StatusColor::Red,
            BotStatus::Offline => StatusColor::Gray,
            BotStatus::Unknown | BotStatus::Other(_) => StatusColor::Yellow,
        }
    }

    /// Whether the status claims a live process behind it.
    pub fn is_live(&self) -> bool {
        matches!(self, BotStatus::Running | BotStatus::Active)
    }
}

impl From<&str> for BotStatus {
    fn from(s: &str) -> Self {
        match s {
            "initializing" => BotStatus::Initializing,
            "running" => BotStatus::Running,
            "active" => BotStatus::Active,
            "paused" => BotStatus::Paused,
            "stopped" => BotStatus::Stopped,
            "error" => BotStatus::Error,
            "offline" => BotStatus::Offline,
            "unknown" => BotStatus::Unknown,
            other => BotStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for BotStatus {
    fn from(s: String) -> Self {
        BotStatus::from(s.as_str())
    }
}

impl From<BotStatus> for String {
    fn from(status: BotStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Color shown next to a bot on the dashboard. Always derived from
/// [`BotStatus::color`], never set independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    Green,
    #[default]
    Yellow,
    Red,
    Gray,
}

impl StatusColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusColor::Green => "green",
            StatusColor::Yellow => "yellow",
            StatusColor::Red => "red",
            StatusColor::Gray => "gray",
        }
    }
}

// ---------------------------------------------------------------------------
// Bot state document
// ---------------------------------------------------------------------------

/// An open position. `None` on the state means the bot is flat.
///
/// Bots may write a partial position (no `entry_price`, no `opened_at`);
/// missing or mistyped fields read as their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, deserialize_with = "lenient::text")]
    pub side: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub size: f64,
    #[serde(default, deserialize_with = "lenient::optional_number")]
    pub entry_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub opened_at: Option<DateTime<Utc>>,
}

/// The most recently recorded trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastTrade {
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub pnl: f64,
    #[serde(default, deserialize_with = "lenient::text")]
    pub side: String,
}

/// Typed view of one bot's state file, `<state_dir>/<bot_id>.json`.
///
/// The file itself is a plain JSON object owned by whichever bot writes it,
/// so this view never rejects a document over a field's type: a value that
/// does not fit reads as the field's default. Keys this struct does not
/// know about (`pid`, `started_at`, `reconciled`, anything a bot adds) are
/// carried in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    #[serde(default, deserialize_with = "lenient::text")]
    pub bot_id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub bot_name: String,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub status: BotStatus,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub status_color: StatusColor,
    #[serde(default, deserialize_with = "lenient::number")]
    pub pnl_total: f64,
    #[serde(default, deserialize_with = "lenient::number")]
    pub pnl_24h: f64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub trades_total: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub trades_24h: u64,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub position: Option<Position>,
    #[serde(
        default,
        deserialize_with = "lenient::or_default",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_trade: Option<LastTrade>,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub last_error: Option<String>,
    /// Python bots write elapsed wall time here, often fractional.
    #[serde(default, deserialize_with = "lenient::number")]
    pub uptime_seconds: f64,
    #[serde(default = "default_version", deserialize_with = "lenient::text")]
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub const DEFAULT_STATE_VERSION: &str = "1.0.0";

fn default_version() -> String {
    DEFAULT_STATE_VERSION.to_string()
}

impl BotState {
    /// The record a bot starts from before its first write.
    pub fn initial(bot_id: &str, bot_name: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            bot_name: bot_name.to_string(),
            status: BotStatus::Initializing,
            status_color: BotStatus::Initializing.color(),
            pnl_total: 0.0,
            pnl_24h: 0.0,
            trades_total: 0,
            trades_24h: 0,
            position: None,
            last_trade: None,
            last_update: None,
            last_error: None,
            uptime_seconds: 0.0,
            version: default_version(),
            extra: Map::new(),
        }
    }

    /// View a raw state document. `bot_id` falls back to `file_id` (the
    /// file's base name) when the document does not carry one.
    pub fn from_document(file_id: &str, doc: Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut state: BotState = serde_json::from_value(Value::Object(doc))?;
        if state.bot_id.is_empty() {
            state.bot_id = file_id.to_string();
        }
        Ok(state)
    }
}

/// Parse a stored timestamp. RFC 3339 is what the writers produce; naive
/// ISO-8601 (no offset) is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Field deserializers for state documents. None of them fail on a value
/// of the wrong type; they fall back to the field's default instead.
mod lenient {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn or_default<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        let value = Value::deserialize(d)?;
        Ok(T::deserialize(value).unwrap_or_default())
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    fn as_number(value: &Value) -> Option<f64> {
        match value {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        }
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(as_number(&Value::deserialize(d)?).unwrap_or(0.0))
    }

    pub fn optional_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(as_number(&Value::deserialize(d)?))
    }

    /// Non-negative integer; fractional values are truncated.
    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(value
            .as_u64()
            .or_else(|| as_number(&value).filter(|n| *n >= 0.0).map(|n| n as u64))
            .unwrap_or(0))
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => parse_timestamp(&s),
            _ => None,
        })
    }
}

/// Reject ids that cannot safely name a file inside the state directory.
pub fn validate_bot_id(bot_id: &str) -> Result<(), crate::StateError> {
    let bad = bot_id.is_empty()
        || bot_id.starts_with('.')
        || bot_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(crate::StateError::InvalidBotId(bot_id.to_string()));
    }
    Ok(())
}

/// Turn `btc_long_v1` into `Btc Long V1` for display.
pub fn display_name_from_id(bot_id: &str) -> String {
    bot_id
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// A live OS process recognised as one of the fleet's bots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessObservation {
    pub bot_id: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Command line, truncated to [`MAX_CMDLINE_CHARS`].
    pub cmdline: String,
}

pub const MAX_CMDLINE_CHARS: usize = 200;

impl ProcessObservation {
    pub fn new(
        bot_id: impl Into<String>,
        pid: Option<u32>,
        started_at: Option<DateTime<Utc>>,
        cmdline: &str,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            pid,
            running: true,
            started_at,
            cmdline: cmdline.chars().take(MAX_CMDLINE_CHARS).collect(),
        }
    }
}

/// Minimal summary of a state file as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObservation {
    pub status: BotStatus,
    /// Raw `last_update` value; not validated.
    pub last_update: Option<String>,
    pub file_mtime: DateTime<Utc>,
}
