use crate::nw::history::DEFAULT_HISTORY_SIZE;
use crate::nw::watch::{Watch, WatchFile};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon-wide options plus the watch definitions, resolved from the YAML file.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket: PathBuf,
    /// Unix socket mode (octal), e.g. 0o660.
    pub socket_mode: u32,
    pub history_size: usize,
    /// How often the liveness poll runs against every running watch.
    pub poll_interval: Duration,
    /// How often resource limits and health probes are evaluated per running watch.
    pub check_interval: Duration,
    /// Registration order is the file order.
    pub watches: Vec<Watch>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            socket_mode: default_socket_mode(),
            history_size: default_history_size(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            check_interval: Duration::from_millis(default_check_interval_ms()),
            watches: Vec::new(),
        }
    }
}

pub fn default_socket() -> PathBuf {
    "/tmp/nightwatch.sock".into()
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_check_interval_ms() -> u64 {
    10_000
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    daemon: Option<DaemonSectionFile>,
    /// serde_yaml maps keep document order, which becomes registration order.
    #[serde(default)]
    watches: Option<serde_yaml::Mapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonSectionFile {
    #[serde(default = "default_socket")]
    socket: PathBuf,
    #[serde(default = "default_socket_mode", deserialize_with = "deserialize_socket_mode")]
    socket_mode: u32,
    #[serde(default = "default_history_size")]
    history_size: usize,
    #[serde(default = "default_poll_interval_ms", deserialize_with = "deserialize_duration_ms")]
    poll_interval: u64,
    #[serde(default = "default_check_interval_ms", deserialize_with = "deserialize_duration_ms")]
    check_interval: u64,
}

fn deserialize_socket_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        // A bare 660 in YAML is decimal; read its digits as octal like chmod does.
        serde_yaml::Value::Number(n) => parse_mode_str(&n.to_string()).map_err(D::Error::custom),
        serde_yaml::Value::String(s) => parse_mode_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "socket_mode must be an integer or string (e.g. 660 or \"0660\")",
        )),
    }
}

fn parse_mode_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| format!("invalid socket_mode {s:?}: {e}"))
}

fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be an integer milliseconds or string like \"5s\"",
        )),
    }
}

/// `1500ms`, `10s`, `1m`, `2h`, or a bare number of milliseconds.
pub fn parse_duration_str(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "" | "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok((num * mult).round() as u64)
}

pub fn parse_config(raw: &str, base: &Path) -> anyhow::Result<DaemonConfig> {
    let file: ConfigFile = serde_yaml::from_str(raw)?;
    let mut cfg = DaemonConfig::default();

    if let Some(d) = file.daemon {
        anyhow::ensure!(d.history_size > 0, "daemon.history_size must be at least 1");
        anyhow::ensure!(d.poll_interval > 0, "daemon.poll_interval must not be zero");
        anyhow::ensure!(d.check_interval > 0, "daemon.check_interval must not be zero");
        cfg.socket = d.socket;
        cfg.socket_mode = d.socket_mode;
        cfg.history_size = d.history_size;
        cfg.poll_interval = Duration::from_millis(d.poll_interval);
        cfg.check_interval = Duration::from_millis(d.check_interval);
    }

    if let Some(watches) = file.watches {
        for (key, value) in watches {
            let name = match key {
                serde_yaml::Value::String(s) => s,
                other => anyhow::bail!("watch names must be strings, got {other:?}"),
            };
            let wf: WatchFile = serde_yaml::from_value(value)
                .map_err(|e| anyhow::anyhow!("watch {name}: {e}"))?;
            let mut watch = wf.into_watch(&name)?;
            if let Some(dir) = watch.dir.as_ref() {
                if dir.is_relative() {
                    watch.dir = Some(base.join(dir));
                }
            }
            cfg.watches.push(watch);
        }
    }

    if cfg.socket.is_relative() {
        cfg.socket = base.join(&cfg.socket);
    }
    Ok(cfg)
}

/// Reads and validates the config file; relative paths resolve against its directory.
pub fn load_config(config_path: &Path) -> anyhow::Result<DaemonConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&raw, base)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e:#}", config_path.display()))
}

/// Watch for a bare `nightwatch -- program args...` invocation.
pub fn single_command_watch(argv: Vec<String>) -> anyhow::Result<Watch> {
    let program = argv
        .first()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow::anyhow!("cannot derive a watch name from {program:?}"))?;
    let watch = Watch::new(name, argv);
    watch.validate()?;
    Ok(watch)
}

/// Name-indexed view, for reload diffs.
pub fn watches_by_name(cfg: &DaemonConfig) -> BTreeMap<&str, &Watch> {
    cfg.watches.iter().map(|w| (w.name.as_str(), w)).collect()
}
