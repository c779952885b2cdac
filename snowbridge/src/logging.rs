//! Tracing setup shared by the bridge binaries.
//!
//! Logs always go to stderr; stdout belongs to host output.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log level for the workspace's own targets (`SNOWBRIDGE_LOG`).
pub const ENV_LOG_LEVEL: &str = "SNOWBRIDGE_LOG";
/// `text` (default) or `json`.
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
/// Full filter directives; replaces the level-based filter when set.
pub const ENV_LOG_DIRECTIVES: &str = "RUST_LOG";

/// Targets the level applies to. Frame-level codec tracing stays off unless
/// asked for through explicit directives.
const TARGETS: &[&str] = &["snowbridge", "snowbridge_host", "snowball_responder"];
const QUIET_TARGETS: &[&str] = &["snowbridge::bridge::codec"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    /// Raw `EnvFilter` directives that take precedence over `level`.
    pub directives: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            directives: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unrecognised values fall back to the defaults; logging setup never
    /// stops a process from starting.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup(ENV_LOG_LEVEL)
            .and_then(|v| parse_level(&v))
            .unwrap_or(Level::INFO);
        let format = lookup(ENV_LOG_FORMAT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let directives = lookup(ENV_LOG_DIRECTIVES).filter(|d| !d.trim().is_empty());
        Self {
            level,
            format,
            directives,
        }
    }

    fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.directives {
            match EnvFilter::try_new(directives) {
                Ok(filter) => return filter,
                Err(e) => eprintln!("ignoring invalid {ENV_LOG_DIRECTIVES}: {e}"),
            }
        }
        EnvFilter::new(default_directives(self.level))
    }
}

fn parse_level(value: &str) -> Option<Level> {
    match value.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        other => other.parse().ok(),
    }
}

fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=off")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(settings: &LogSettings) {
    let (json, text) = match settings.format {
        LogFormat::Json => (Some(fmt::layer().json().with_writer(std::io::stderr)), None),
        LogFormat::Text => (None, Some(fmt::layer().with_writer(std::io::stderr))),
    };

    let _ = tracing_subscriber::registry()
        .with(settings.filter())
        .with(json)
        .with(text)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_info_text() {
        assert_eq!(settings(&[]), LogSettings::default());
    }

    #[test]
    fn level_and_format_from_env() {
        let s = settings(&[(ENV_LOG_LEVEL, "warning"), (ENV_LOG_FORMAT, "JSON")]);
        assert_eq!(s.level, Level::WARN);
        assert_eq!(s.format, LogFormat::Json);
    }

    #[test]
    fn unknown_values_fall_back() {
        let s = settings(&[(ENV_LOG_LEVEL, "loud"), (ENV_LOG_FORMAT, "xml")]);
        assert_eq!(s.level, Level::INFO);
        assert_eq!(s.format, LogFormat::Text);
    }

    #[test]
    fn blank_directives_are_ignored() {
        assert_eq!(settings(&[(ENV_LOG_DIRECTIVES, "  ")]).directives, None);
    }

    #[test]
    fn default_directives_cover_workspace_targets() {
        insta::assert_snapshot!(
            default_directives(Level::DEBUG),
            @"snowbridge=debug,snowbridge_host=debug,snowball_responder=debug,snowbridge::bridge::codec=off"
        );
    }
}
