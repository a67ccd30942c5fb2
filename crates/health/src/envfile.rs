use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub type EnvMap = BTreeMap<String, String>;

/// Parse `KEY=value` lines. Blank lines, `#` comments and lines without `=`
/// are ignored; one layer of surrounding quotes is stripped from values.
pub fn parse_env(text: &str) -> EnvMap {
    let mut vars = EnvMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        vars.insert(key.trim().to_string(), strip_quotes(value.trim()).to_string());
    }
    vars
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '\'')
}

/// Read one env file. A missing file is empty; an unreadable one is logged
/// and treated as empty.
pub fn load_env_file(path: &Path) -> EnvMap {
    match fs::read_to_string(path) {
        Ok(text) => {
            let vars = parse_env(&text);
            debug!(path = %path.display(), count = vars.len(), "Loaded env file");
            vars
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EnvMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read env file");
            EnvMap::new()
        }
    }
}

/// Merge env files in order, then `process_env` on top.
pub fn collect_config<I>(files: &[PathBuf], process_env: I) -> EnvMap
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars = EnvMap::new();
    for file in files {
        vars.extend(load_env_file(file));
    }
    vars.extend(process_env);
    vars
}
