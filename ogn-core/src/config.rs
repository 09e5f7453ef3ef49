//! Configuration file management for ogn-basestation.
//!
//! Reads/writes `~/.ogn-basestation/config.yaml` with the APRS feed
//! settings, device database options, tracking timeouts and one
//! `sink <name>:` section per BaseStation output.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ddb::DDB_URL;
use crate::filter::SinkFilter;
use crate::types::OgnError;

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub feed: FeedConfig,
    pub ddb: DdbConfig,
    pub tracking: TrackingConfig,
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub passcode: String,
    pub filter: Option<String>,
    pub autoreconnect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DdbConfig {
    pub enabled: bool,
    pub url: String,
    pub icao_url: Option<String>,
    pub icao_path: Option<String>,
    pub cache_path: Option<String>,
    pub refresh_hours: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingConfig {
    pub sweep_secs: u64,
    pub timeout_secs: u64,
}

impl DdbConfig {
    /// Time between refreshes. Values that do not fit a `Duration` fall back
    /// to the 24 hour default.
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::try_from_secs_f64(self.refresh_hours.max(0.0) * 3600.0).unwrap_or_else(|_| {
            warn!(refresh_hours = self.refresh_hours, "refresh_hours out of range, using 24");
            std::time::Duration::from_secs(24 * 3600)
        })
    }
}

impl TrackingConfig {
    pub fn sweep_interval(&self) -> chrono::Duration {
        seconds_or(self.sweep_secs, 300, "sweep_secs")
    }

    pub fn timeout(&self) -> chrono::Duration {
        seconds_or(self.timeout_secs, 600, "timeout_secs")
    }
}

fn seconds_or(secs: u64, default: i64, key: &str) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(|| {
            warn!(key, secs, default, "value out of range, using default");
            chrono::Duration::seconds(default)
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub matched_data: bool,
    pub min_ground_speed: Option<f64>,
    pub max_altitude: Option<f64>,
    pub retry_secs: u64,
    pub max_retries: Option<u32>,
    pub queue: usize,
}

impl SinkConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        SinkConfig {
            name: name.into(),
            host: host.into(),
            port,
            matched_data: true,
            min_ground_speed: None,
            max_altitude: None,
            retry_secs: 5,
            max_retries: None,
            queue: 1024,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Predicate built from the configured thresholds.
    pub fn filter(&self) -> SinkFilter {
        let mut filter = SinkFilter::always();
        filter.min_ground_speed_kmh = self.min_ground_speed;
        filter.max_altitude_m = self.max_altitude;
        filter
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            feed: FeedConfig {
                host: "aprs.glidernet.org".into(),
                port: 10152,
                user: "OGNBS".into(),
                passcode: "-1".into(),
                filter: None,
                autoreconnect: true,
            },
            ddb: DdbConfig {
                enabled: true,
                url: DDB_URL.into(),
                icao_url: None,
                icao_path: None,
                cache_path: Some(config_dir().join("ddb.json").display().to_string()),
                refresh_hours: 24.0,
            },
            tracking: TrackingConfig {
                sweep_secs: 300,
                timeout_secs: 600,
            },
            sinks: vec![SinkConfig::new("main", "localhost", 30003)],
        }
    }
}

/// Get the config directory path (`~/.ogn-basestation/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".ogn-basestation")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.ogn-basestation/config.yaml`.
///
/// Returns default config if file doesn't exist or can't be read.
pub fn load_config() -> Config {
    let path = config_file();
    if !path.exists() {
        return Config::default();
    }
    load_config_from(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
        Config::default()
    })
}

/// Load config from an explicit path. A missing file is an error here.
pub fn load_config_from(path: &Path) -> Result<Config, OgnError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| OgnError::Config(format!("{}: {e}", path.display())))?;
    Ok(parse_config(&text))
}

/// Save config to `path` (default `~/.ogn-basestation/config.yaml`).
pub fn save_config(config: &Config, path: Option<&Path>) -> Result<PathBuf, OgnError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| OgnError::Config(e.to_string()))?;
    }

    let text = serialize_config(config);
    std::fs::write(&path, text).map_err(|e| OgnError::Config(e.to_string()))?;

    Ok(path)
}

/// Parse simple YAML-like config text. Unknown keys are ignored and
/// unparseable values keep their defaults.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;
    let mut default_sinks = true;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = Some(key.to_string());
            if let Some(name) = key.strip_prefix("sink ") {
                if default_sinks {
                    config.sinks.clear();
                    default_sinks = false;
                }
                config
                    .sinks
                    .push(SinkConfig::new(name.trim(), "localhost", 30003));
            }
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };

        match section {
            "feed" => {
                let feed = &mut config.feed;
                match key {
                    "host" => set_string(&mut feed.host, val),
                    "port" => set_parsed(&mut feed.port, key, val),
                    "user" => set_string(&mut feed.user, val),
                    "passcode" => set_string(&mut feed.passcode, val),
                    "filter" => feed.filter = parse_string_value(val),
                    "autoreconnect" => set_bool(&mut feed.autoreconnect, key, val),
                    _ => {}
                }
            }
            "ddb" => {
                let ddb = &mut config.ddb;
                match key {
                    "enabled" => set_bool(&mut ddb.enabled, key, val),
                    "url" => set_string(&mut ddb.url, val),
                    "icao_url" => ddb.icao_url = parse_string_value(val),
                    "icao_path" => ddb.icao_path = parse_string_value(val),
                    "cache_path" => ddb.cache_path = parse_string_value(val),
                    "refresh_hours" => set_parsed(&mut ddb.refresh_hours, key, val),
                    _ => {}
                }
            }
            "tracking" => match key {
                "sweep_secs" => set_parsed(&mut config.tracking.sweep_secs, key, val),
                "timeout_secs" => set_parsed(&mut config.tracking.timeout_secs, key, val),
                _ => {}
            },
            s if s.starts_with("sink ") => {
                let Some(sink) = config.sinks.last_mut() else {
                    continue;
                };
                match key {
                    "host" => set_string(&mut sink.host, val),
                    "port" => set_parsed(&mut sink.port, key, val),
                    "matched_data" => set_bool(&mut sink.matched_data, key, val),
                    "min_ground_speed" => sink.min_ground_speed = parse_float_value(val),
                    "max_altitude" => sink.max_altitude = parse_float_value(val),
                    "retry_secs" => set_parsed(&mut sink.retry_secs, key, val),
                    "max_retries" => {
                        sink.max_retries = parse_string_value(val).and_then(|v| v.parse().ok())
                    }
                    "queue" => set_parsed(&mut sink.queue, key, val),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_float_value(val: &str) -> Option<f64> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    val.parse().ok()
}

fn set_string(slot: &mut String, val: &str) {
    if let Some(v) = parse_string_value(val) {
        *slot = v;
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, val: &str) {
    match val.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value = val, "ignoring invalid config value"),
    }
}

fn set_bool(slot: &mut bool, key: &str, val: &str) {
    match val {
        "true" | "yes" | "on" => *slot = true,
        "false" | "no" | "off" => *slot = false,
        _ => warn!(key, value = val, "ignoring invalid boolean"),
    }
}

fn opt_line(key: &str, val: &Option<String>) -> String {
    match val {
        Some(v) => format!("  {key}: \"{v}\""),
        None => format!("  {key}: null"),
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# ogn-basestation configuration".to_string(), String::new()];

    let feed = &config.feed;
    lines.push("feed:".into());
    lines.push(format!("  host: \"{}\"", feed.host));
    lines.push(format!("  port: {}", feed.port));
    lines.push(format!("  user: \"{}\"", feed.user));
    lines.push(format!("  passcode: \"{}\"", feed.passcode));
    lines.push(opt_line("filter", &feed.filter));
    lines.push(format!("  autoreconnect: {}", feed.autoreconnect));
    lines.push(String::new());

    let ddb = &config.ddb;
    lines.push("ddb:".into());
    lines.push(format!("  enabled: {}", ddb.enabled));
    lines.push(format!("  url: \"{}\"", ddb.url));
    lines.push(opt_line("icao_url", &ddb.icao_url));
    lines.push(opt_line("icao_path", &ddb.icao_path));
    lines.push(opt_line("cache_path", &ddb.cache_path));
    lines.push(format!("  refresh_hours: {}", ddb.refresh_hours));
    lines.push(String::new());

    lines.push("tracking:".into());
    lines.push(format!("  sweep_secs: {}", config.tracking.sweep_secs));
    lines.push(format!("  timeout_secs: {}", config.tracking.timeout_secs));

    for sink in &config.sinks {
        lines.push(String::new());
        lines.push(format!("sink {}:", sink.name));
        lines.push(format!("  host: \"{}\"", sink.host));
        lines.push(format!("  port: {}", sink.port));
        lines.push(format!("  matched_data: {}", sink.matched_data));
        match sink.min_ground_speed {
            Some(v) => lines.push(format!("  min_ground_speed: {v}")),
            None => lines.push("  min_ground_speed: null".into()),
        }
        match sink.max_altitude {
            Some(v) => lines.push(format!("  max_altitude: {v}")),
            None => lines.push("  max_altitude: null".into()),
        }
        lines.push(format!("  retry_secs: {}", sink.retry_secs));
        match sink.max_retries {
            Some(v) => lines.push(format!("  max_retries: {v}")),
            None => lines.push("  max_retries: null".into()),
        }
        lines.push(format!("  queue: {}", sink.queue));
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
