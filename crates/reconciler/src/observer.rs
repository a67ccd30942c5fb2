//! Discovers which fleet bots currently have a live OS process.
//!
//! Processes are classified by matching their command line against an
//! ordered rule table; the first matching rule names the bot. Unmatched
//! processes are ignored.

use chrono::{DateTime, Utc};
use fleetstate_core::ProcessObservation;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

pub type ProcessMap = BTreeMap<String, ProcessObservation>;

// ---------------------------------------------------------------------------
// Classification rules
// ---------------------------------------------------------------------------

/// A command line prepared for substring matching.
pub struct CommandLine<'a> {
    raw: &'a str,
    lower: String,
}

impl<'a> CommandLine<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            raw,
            lower: raw.to_lowercase(),
        }
    }

    /// Case-sensitive substring test.
    pub fn contains(&self, needle: &str) -> bool {
        self.raw.contains(needle)
    }

    /// Case-insensitive substring test. `needle` must be lowercase.
    pub fn contains_ci(&self, needle: &str) -> bool {
        self.lower.contains(needle)
    }
}

/// Maps a command line predicate to the bot id it identifies.
#[derive(Clone, Copy)]
pub struct ClassificationRule {
    pub bot_id: &'static str,
    pub matches: fn(&CommandLine) -> bool,
}

impl std::fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("bot_id", &self.bot_id)
            .finish()
    }
}

/// Legacy v1 directional bots: either named `bot_v1`, or a python process
/// whose arguments mention long or short.
fn is_v1_bot(cmd: &CommandLine) -> bool {
    cmd.contains("bot_v1")
        || (cmd.contains_ci("python") && (cmd.contains_ci("long") || cmd.contains_ci("short")))
}

/// The fleet's rule table, in evaluation order.
///
/// A v1 bot that names no known asset is deliberately left unclassified,
/// even if the line also mentions hummingbot.
pub fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            bot_id: "mm_15m",
            matches: |c| c.contains("mm_optimized_15m"),
        },
        ClassificationRule {
            bot_id: "mm_1h",
            matches: |c| c.contains("mm_optimized_1h"),
        },
        ClassificationRule {
            bot_id: "btc_long_v1",
            matches: |c| is_v1_bot(c) && c.contains_ci("btc") && c.contains_ci("long"),
        },
        ClassificationRule {
            bot_id: "btc_short_v1",
            matches: |c| is_v1_bot(c) && c.contains_ci("btc") && c.contains_ci("short"),
        },
        ClassificationRule {
            bot_id: "doge_long_v1",
            matches: |c| {
                is_v1_bot(c) && !c.contains_ci("btc") && c.contains_ci("doge") && c.contains_ci("long")
            },
        },
        ClassificationRule {
            bot_id: "doge_short_v1",
            matches: |c| {
                is_v1_bot(c) && !c.contains_ci("btc") && c.contains_ci("doge") && c.contains_ci("short")
            },
        },
        ClassificationRule {
            bot_id: "hummingbot",
            matches: |c| !is_v1_bot(c) && c.contains_ci("hummingbot"),
        },
    ]
}

/// First rule that matches wins.
pub fn classify(rules: &[ClassificationRule], cmdline: &str) -> Option<&'static str> {
    let cmd = CommandLine::new(cmdline);
    rules.iter().find(|rule| (rule.matches)(&cmd)).map(|rule| rule.bot_id)
}

// ---------------------------------------------------------------------------
// Process sources
// ---------------------------------------------------------------------------

/// One OS process as reported by a [`ProcessSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawProcess {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub cmdline: String,
}

/// Which process is kept when several map to the same bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplicates {
    KeepFirst,
    KeepLast,
}

/// Something that can enumerate the process table.
pub trait ProcessSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn duplicates(&self) -> Duplicates {
        Duplicates::KeepFirst
    }

    /// List processes. An error means the facility is unavailable and the
    /// observer should try its next source.
    fn list(&self) -> io::Result<Vec<RawProcess>>;
}

/// Linux procfs: full command line, pid, and start time.
pub struct ProcFs {
    root: PathBuf,
}

/// Kernel USER_HZ; fixed at 100 on every mainstream Linux architecture.
const CLOCK_TICKS_PER_SEC: u64 = 100;

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessSource for ProcFs {
    fn name(&self) -> &'static str {
        "procfs"
    }

    /// Listing is in pid order, so the newest pid wins a duplicate.
    fn duplicates(&self) -> Duplicates {
        Duplicates::KeepLast
    }

    fn list(&self) -> io::Result<Vec<RawProcess>> {
        let boot_time = fs::read_to_string(self.root.join("stat"))
            .ok()
            .and_then(|s| parse_boot_time(&s));

        let mut processes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes exit or deny access between listing and reading.
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let cmdline = join_cmdline(&raw);
            if cmdline.is_empty() {
                continue;
            }
            let started_at = boot_time.and_then(|bt| process_start(&entry.path(), bt));
            processes.push(RawProcess {
                pid: Some(pid),
                started_at,
                cmdline,
            });
        }
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }
}

/// `/proc/<pid>/cmdline` is NUL-separated arguments.
fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

fn process_start(proc_dir: &Path, boot_time: i64) -> Option<DateTime<Utc>> {
    let stat = fs::read_to_string(proc_dir.join("stat")).ok()?;
    let ticks = parse_start_ticks(&stat)?;
    let secs = boot_time + (ticks / CLOCK_TICKS_PER_SEC) as i64;
    let nanos = ((ticks % CLOCK_TICKS_PER_SEC) * (1_000_000_000 / CLOCK_TICKS_PER_SEC)) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// `btime` line of `/proc/stat`: boot time in unix seconds.
pub fn parse_boot_time(proc_stat: &str) -> Option<i64> {
    proc_stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// Field 22 (`starttime`) of `/proc/<pid>/stat`, in clock ticks since boot.
/// The command name in field 2 may contain spaces, so fields are counted
/// from the last closing parenthesis.
pub fn parse_start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// `ps aux` fallback: command text only, no pid or start time.
pub struct PsAux;

impl ProcessSource for PsAux {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn list(&self) -> io::Result<Vec<RawProcess>> {
        let output = Command::new("ps").arg("aux").output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!("ps exited with {}", output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| RawProcess {
                pid: None,
                started_at: None,
                cmdline: line.to_string(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Builds the `bot_id -> ProcessObservation` map from the first process
/// source that works.
pub struct ProcessObserver {
    rules: Vec<ClassificationRule>,
    sources: Vec<Box<dyn ProcessSource>>,
}

impl ProcessObserver {
    pub fn new(rules: Vec<ClassificationRule>, sources: Vec<Box<dyn ProcessSource>>) -> Self {
        Self { rules, sources }
    }

    /// Default rules over procfs, falling back to `ps aux`.
    pub fn system() -> Self {
        Self::new(default_rules(), vec![Box::new(ProcFs::default()), Box::new(PsAux)])
    }

    pub fn observe(&self) -> ProcessMap {
        for source in &self.sources {
            match source.list() {
                Ok(processes) => {
                    debug!(source = source.name(), count = processes.len(), "Listed processes");
                    return self.classify_all(processes, source.duplicates());
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Process source unavailable, trying next");
                }
            }
        }
        warn!("No process source available; assuming no bots are running");
        ProcessMap::new()
    }

    /// Classify processes in listing order. `duplicates` decides which one
    /// is kept when two processes map to one bot.
    pub fn classify_all(&self, processes: Vec<RawProcess>, duplicates: Duplicates) -> ProcessMap {
        let mut map = ProcessMap::new();
        for process in processes {
            let Some(bot_id) = classify(&self.rules, &process.cmdline) else {
                continue;
            };
            let observation =
                || ProcessObservation::new(bot_id, process.pid, process.started_at, &process.cmdline);
            match duplicates {
                Duplicates::KeepFirst => {
                    map.entry(bot_id.to_string()).or_insert_with(observation);
                }
                Duplicates::KeepLast => {
                    map.insert(bot_id.to_string(), observation());
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(cmdline: &str) -> Option<&'static str> {
        classify(&default_rules(), cmdline)
    }

    #[test]
    fn test_market_maker_rules() {
        assert_eq!(id("python3 /bots/mm_optimized_15m.py --live"), Some("mm_15m"));
        assert_eq!(id("python3 /bots/mm_optimized_1h.py"), Some("mm_1h"));
        // case-sensitive
        assert_eq!(id("python3 /bots/MM_OPTIMIZED_1H.py"), None);
    }

    #[test]
    fn test_v1_directional_rules() {
        assert_eq!(id("python3 btc_long.py"), Some("btc_long_v1"));
        assert_eq!(id("python3 BTC_SHORT.py"), Some("btc_short_v1"));
        assert_eq!(id("./bot_v1 --asset doge --side long"), Some("doge_long_v1"));
        assert_eq!(id("python doge_short_bot.py"), Some("doge_short_v1"));
    }

    #[test]
    fn test_btc_takes_precedence_over_doge() {
        assert_eq!(id("python btc_doge_long.py"), Some("btc_long_v1"));
        // btc branch chosen but no side: unclassified, doge is not tried
        assert_eq!(id("bot_v1 btc doge"), None);
    }

    #[test]
    fn test_v1_without_asset_is_unclassified() {
        assert_eq!(id("python eth_long.py"), None);
        assert_eq!(id("python hummingbot_long.py"), None);
    }

    #[test]
    fn test_hummingbot_rule() {
        assert_eq!(id("/opt/Hummingbot/bin/hummingbot_quickstart.py"), Some("hummingbot"));
    }

    #[test]
    fn test_unmatched_dropped() {
        assert_eq!(id("/usr/sbin/sshd -D"), None);
        assert_eq!(id(""), None);
    }

    #[test]
    fn test_first_rule_wins() {
        assert_eq!(id("python mm_optimized_15m.py btc long"), Some("mm_15m"));
    }

    #[test]
    fn test_parse_stat_fields() {
        let stat = "1234 (python3 my bot) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 2 0 0 20 0 1 0 4567 123456 789";
        assert_eq!(parse_start_ticks(stat), Some(4567));
        assert_eq!(parse_boot_time("cpu 1 2 3\nbtime 1700000000\nprocesses 10\n"), Some(1_700_000_000));
        assert_eq!(parse_boot_time("cpu 1 2 3\n"), None);
    }

    #[test]
    fn test_join_cmdline() {
        assert_eq!(join_cmdline(b"python3\0mm_optimized_1h.py\0--live\0"), "python3 mm_optimized_1h.py --live");
        assert_eq!(join_cmdline(b""), "");
    }

    struct Failing;
    impl ProcessSource for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn list(&self) -> io::Result<Vec<RawProcess>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no procfs"))
        }
    }

    struct Fixed(Vec<RawProcess>);
    impl ProcessSource for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn list(&self) -> io::Result<Vec<RawProcess>> {
            Ok(self.0.clone())
        }
    }

    fn raw(pid: Option<u32>, cmdline: &str) -> RawProcess {
        RawProcess {
            pid,
            started_at: None,
            cmdline: cmdline.to_string(),
        }
    }

    #[test]
    fn test_falls_back_to_next_source() {
        let observer = ProcessObserver::new(
            default_rules(),
            vec![
                Box::new(Failing),
                Box::new(Fixed(vec![raw(None, "user 1 0.0 python3 mm_optimized_1h.py")])),
            ],
        );
        let map = observer.observe();
        assert_eq!(map.len(), 1);
        assert_eq!(map["mm_1h"].pid, None);
        assert!(map["mm_1h"].running);
    }

    #[test]
    fn test_all_sources_failing_is_empty() {
        let observer = ProcessObserver::new(default_rules(), vec![Box::new(Failing)]);
        assert!(observer.observe().is_empty());
    }

    fn duplicate_mm() -> Vec<RawProcess> {
        vec![
            raw(Some(10), "python3 mm_optimized_15m.py"),
            raw(Some(11), "python3 mm_optimized_15m.py --dup"),
            raw(Some(12), "bash"),
        ]
    }

    #[test]
    fn test_first_process_per_bot_wins() {
        let observer = ProcessObserver::new(default_rules(), vec![]);
        let map = observer.classify_all(duplicate_mm(), Duplicates::KeepFirst);
        assert_eq!(map.len(), 1);
        assert_eq!(map["mm_15m"].pid, Some(10));
    }

    #[test]
    fn test_last_process_per_bot_wins() {
        let observer = ProcessObserver::new(default_rules(), vec![]);
        let map = observer.classify_all(duplicate_mm(), Duplicates::KeepLast);
        assert_eq!(map.len(), 1);
        assert_eq!(map["mm_15m"].pid, Some(11));
        assert!(map["mm_15m"].cmdline.contains("--dup"));
    }

    #[test]
    fn test_procfs_keeps_highest_pid_per_bot() {
        let dir = tempfile::tempdir().unwrap();
        for pid in ["900", "77", "4100"] {
            let p = dir.path().join(pid);
            fs::create_dir(&p).unwrap();
            fs::write(p.join("cmdline"), format!("python3\0mm_optimized_1h.py\0--pid={pid}\0")).unwrap();
        }

        let observer = ProcessObserver::new(default_rules(), vec![Box::new(ProcFs::new(dir.path()))]);
        let map = observer.observe();
        assert_eq!(map.len(), 1);
        assert_eq!(map["mm_1h"].pid, Some(4100));
        assert!(map["mm_1h"].started_at.is_none());
    }

    #[test]
    fn test_procfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stat"), "cpu 0\nbtime 1700000000\n").unwrap();
        let p = dir.path().join("4242");
        fs::create_dir(&p).unwrap();
        fs::write(p.join("cmdline"), b"python3\0mm_optimized_1h.py\0").unwrap();
        fs::write(
            p.join("stat"),
            "4242 (python3) S 1 1 1 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 250 0 0",
        )
        .unwrap();
        let k = dir.path().join("2");
        fs::create_dir(&k).unwrap();
        fs::write(k.join("cmdline"), b"").unwrap();

        let processes = ProcFs::new(dir.path()).list().unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, Some(4242));
        assert_eq!(processes[0].cmdline, "python3 mm_optimized_1h.py");
        let started = processes[0].started_at.unwrap();
        assert_eq!(started.timestamp(), 1_700_000_002);
    }

    #[test]
    fn test_missing_procfs_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProcFs::new(dir.path().join("absent")).list().is_err());
    }
}
