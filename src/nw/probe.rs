use crate::nw::process::{ProcessControl, Usage};
use crate::nw::watch::{HttpMethod, Watch};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A check that should make a running watch restart.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckFailure {
    Memory { used: u64, limit: u64 },
    Cpu { used: f32, limit: u32 },
    Port { port: u16, error: String },
    Http { url: String, error: String },
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFailure::Memory { used, limit } => {
                write!(f, "check=max_memory used={used} limit={limit}")
            }
            CheckFailure::Cpu { used, limit } => {
                write!(f, "check=max_cpu used={used:.1} limit={limit}")
            }
            CheckFailure::Port { port, error } => write!(f, "check=port port={port} err={error}"),
            CheckFailure::Http { url, error } => write!(f, "check=http url={url} err={error}"),
        }
    }
}

/// Compares one usage sample against the watch's limits; memory wins when both are exceeded.
pub fn resource_breach(watch: &Watch, usage: Usage) -> Option<CheckFailure> {
    if watch.max_memory > 0 && usage.memory_bytes > watch.max_memory {
        return Some(CheckFailure::Memory {
            used: usage.memory_bytes,
            limit: watch.max_memory,
        });
    }
    if watch.max_cpu > 0 && usage.cpu_percent > watch.max_cpu as f32 {
        return Some(CheckFailure::Cpu {
            used: usage.cpu_percent,
            limit: watch.max_cpu,
        });
    }
    None
}

/// `http_check` may be a full URL or a path on localhost.
pub fn http_url(watch: &Watch) -> Option<String> {
    let target = watch.http_check.as_deref()?.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        return Some(target.to_string());
    }
    let path = target.trim_start_matches('/');
    Some(format!("http://127.0.0.1:{}/{path}", watch.http_port()))
}

fn reqwest_method(m: HttpMethod) -> reqwest::Method {
    match m {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

pub async fn check_port(port: u16) -> Result<(), String> {
    match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {}s", PROBE_TIMEOUT.as_secs())),
    }
}

pub async fn check_http(url: &str, method: HttpMethod) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;
    let resp = client
        .request(reqwest_method(method), url)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("status={}", status.as_u16()))
    }
}

/// Runs every configured check against a running process. The first failure is returned.
pub async fn inspect(
    control: Arc<dyn ProcessControl>,
    watch: Arc<Watch>,
    pid: u32,
) -> Option<CheckFailure> {
    if watch.has_resource_limits() {
        let usage = tokio::task::spawn_blocking(move || control.usage(pid))
            .await
            .ok()
            .flatten();
        if let Some(failure) = usage.and_then(|u| resource_breach(&watch, u)) {
            return Some(failure);
        }
    }
    if watch.port_check > 0 {
        if let Err(error) = check_port(watch.port_check).await {
            return Some(CheckFailure::Port {
                port: watch.port_check,
                error,
            });
        }
    }
    if let Some(url) = http_url(&watch) {
        if let Err(error) = check_http(&url, watch.http_check_method).await {
            return Some(CheckFailure::Http { url, error });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(max_memory: u64, max_cpu: u32) -> Watch {
        let mut w = Watch::new("w", vec!["/bin/true".to_string()]);
        w.max_memory = max_memory;
        w.max_cpu = max_cpu;
        w
    }

    #[test]
    fn usage_within_limits_passes() {
        let w = limited(1000, 50);
        let u = Usage { memory_bytes: 1000, cpu_percent: 50.0 };
        assert_eq!(resource_breach(&w, u), None);
    }

    #[test]
    fn memory_and_cpu_breaches() {
        let w = limited(1000, 50);
        let mem = resource_breach(&w, Usage { memory_bytes: 1001, cpu_percent: 0.0 });
        assert_eq!(mem, Some(CheckFailure::Memory { used: 1001, limit: 1000 }));
        let cpu = resource_breach(&w, Usage { memory_bytes: 0, cpu_percent: 75.5 }).unwrap();
        assert_eq!(cpu.to_string(), "check=max_cpu used=75.5 limit=50");
    }

    #[test]
    fn zero_limits_disable_checks() {
        let w = limited(0, 0);
        let u = Usage { memory_bytes: u64::MAX, cpu_percent: 800.0 };
        assert_eq!(resource_breach(&w, u), None);
    }

    #[test]
    fn http_targets() {
        let mut w = limited(0, 0);
        assert_eq!(http_url(&w), None);
        w.http_check = Some("/health".into());
        assert_eq!(http_url(&w).as_deref(), Some("http://127.0.0.1:80/health"));
        w.http_check_port = 8081;
        w.http_check = Some("ready".into());
        assert_eq!(http_url(&w).as_deref(), Some("http://127.0.0.1:8081/ready"));
        w.http_check = Some("https://example.test/x".into());
        assert_eq!(http_url(&w).as_deref(), Some("https://example.test/x"));
    }

    #[tokio::test]
    async fn port_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_port(port).await.is_ok());
        drop(listener);
        assert!(check_port(port).await.is_err());
    }
}
