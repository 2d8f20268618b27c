use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Static description of one supervised process. Shared as `Arc<Watch>`; reload swaps the
/// `Arc`, it never edits a bound watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub name: String,
    /// argv of the supervised process.
    pub start: Vec<String>,
    /// Optional argv run to stop the process; empty means "send SIGTERM".
    pub stop: Vec<String>,
    /// Seconds to wait for a graceful exit before SIGKILL.
    pub stop_timeout: u32,
    pub dir: Option<PathBuf>,
    /// User name or numeric uid.
    pub uid: Option<String>,
    /// Group name or numeric gid.
    pub gid: Option<String>,
    /// Bytes; 0 disables the check.
    pub max_memory: u64,
    /// Percent of one core; 0 disables the check.
    pub max_cpu: u32,
    pub port_check: u16,
    pub http_check: Option<String>,
    pub http_check_method: HttpMethod,
    /// 0 means the default HTTP port.
    pub http_check_port: u16,
    pub env: BTreeMap<String, String>,
    pub autostart: bool,
}

pub const DEFAULT_HTTP_PORT: u16 = 80;

impl Watch {
    pub fn new(name: impl Into<String>, start: Vec<String>) -> Self {
        Self {
            name: name.into(),
            start,
            stop: Vec::new(),
            stop_timeout: default_stop_timeout(),
            dir: None,
            uid: None,
            gid: None,
            max_memory: 0,
            max_cpu: 0,
            port_check: 0,
            http_check: None,
            http_check_method: HttpMethod::default(),
            http_check_port: 0,
            env: BTreeMap::new(),
            autostart: default_autostart(),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.stop_timeout))
    }

    pub fn http_port(&self) -> u16 {
        if self.http_check_port == 0 {
            DEFAULT_HTTP_PORT
        } else {
            self.http_check_port
        }
    }

    pub fn has_resource_limits(&self) -> bool {
        self.max_memory > 0 || self.max_cpu > 0
    }

    /// Whether a running process of this watch needs periodic inspection.
    pub fn needs_checks(&self) -> bool {
        self.has_resource_limits() || self.port_check > 0 || self.http_check.is_some()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.name.is_empty(), "watch name must not be empty");
        anyhow::ensure!(
            !self.name.chars().any(char::is_whitespace),
            "watch name must not contain whitespace: {:?}",
            self.name
        );
        anyhow::ensure!(
            self.start.first().is_some_and(|s| !s.trim().is_empty()),
            "watch {}: start must name a program",
            self.name
        );
        for key in self.env.keys() {
            anyhow::ensure!(!key.is_empty(), "watch {}: env name must not be empty", self.name);
            anyhow::ensure!(
                !key.contains('='),
                "watch {}: env name must not contain '=': {key}",
                self.name
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_stop_timeout() -> u32 {
    5
}

fn default_autostart() -> bool {
    true
}

// -------- YAML schema of one `watches.<name>` entry (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct WatchFile {
    start: Vec<String>,
    #[serde(default)]
    stop: Vec<String>,
    #[serde(default = "default_stop_timeout")]
    stop_timeout: u32,
    #[serde(default)]
    dir: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_id_opt")]
    uid: Option<String>,
    #[serde(default, deserialize_with = "deserialize_id_opt")]
    gid: Option<String>,
    #[serde(default, deserialize_with = "deserialize_memory")]
    max_memory: u64,
    #[serde(default)]
    max_cpu: u32,
    #[serde(default)]
    port_check: u16,
    #[serde(default)]
    http_check: Option<String>,
    #[serde(default)]
    http_check_method: HttpMethod,
    #[serde(default)]
    http_check_port: u16,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_autostart")]
    autostart: bool,
}

impl WatchFile {
    pub(crate) fn into_watch(self, name: &str) -> anyhow::Result<Watch> {
        let watch = Watch {
            name: name.to_string(),
            start: self.start,
            stop: self.stop,
            stop_timeout: self.stop_timeout,
            dir: self.dir,
            uid: self.uid,
            gid: self.gid,
            max_memory: self.max_memory,
            max_cpu: self.max_cpu,
            port_check: self.port_check,
            http_check: self.http_check.filter(|s| !s.trim().is_empty()),
            http_check_method: self.http_check_method,
            http_check_port: self.http_check_port,
            env: self.env,
            autostart: self.autostart,
        };
        watch.validate()?;
        Ok(watch)
    }
}

/// uid/gid may be written as a name or as a bare number.
fn deserialize_id_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match v {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Number(n)) => n
            .as_u64()
            .map(|x| Some(x.to_string()))
            .ok_or_else(|| D::Error::custom("uid/gid must be a non-negative integer or a name")),
        Some(serde_yaml::Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        _ => Err(D::Error::custom("uid/gid must be a string or integer")),
    }
}

fn deserialize_memory<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Null => Ok(0),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("max_memory must be a non-negative integer")),
        serde_yaml::Value::String(s) => parse_memory_size(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "max_memory must be an integer (bytes) or a string like \"512M\"",
        )),
    }
}

/// Parses sizes like `1024`, `64K`, `512M`, `1.5G`, `256MiB`. Suffixes are binary (1K = 1024).
pub fn parse_memory_size(s: &str) -> Result<u64, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty memory size".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid memory size: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid memory size {s:?}: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(format!("unknown memory unit {unit_s:?} (use K/M/G/T)")),
    };
    Ok((num * mult).round() as u64)
}
