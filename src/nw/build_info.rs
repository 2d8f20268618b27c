use chrono::TimeZone as _;

/// Version string reported by the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn build_host() -> &'static str {
    option_env!("NIGHTWATCH_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("NIGHTWATCH_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

/// Renders `epoch:<secs>` (as written by build.rs) in UTC; anything else is passed through.
pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        if let Ok(secs) = epoch.trim().parse::<i64>() {
            if let Some(dt) = chrono::Utc.timestamp_opt(secs, 0).single() {
                return dt.format("%Y-%m-%d %H:%M:%S").to_string();
            }
        }
    }
    raw.to_string()
}

pub fn banner() -> String {
    format!(
        "nightwatch {VERSION} (built on {} at {})",
        build_host(),
        build_time_pretty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_build_time_is_rendered_in_utc() {
        assert_eq!(format_build_time_pretty("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(format_build_time_pretty(" epoch:86400 "), "1970-01-02 00:00:00");
    }

    #[test]
    fn unknown_build_time_passes_through() {
        assert_eq!(format_build_time_pretty("unknown"), "unknown");
        assert_eq!(format_build_time_pretty("epoch:nope"), "epoch:nope");
    }
}
