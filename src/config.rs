//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Delivery agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Whether the delivery loop runs at all.
    pub enabled: bool,
    /// Poll interval between ticks.
    pub tick_interval: Duration,
    /// How far ahead of `now` a reminder counts as due.
    pub lookahead: Duration,
    /// How late a missed reminder may still be delivered. Anything older is
    /// advanced without notifying.
    pub catchup_window: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(30),
            lookahead: Duration::from_secs(5 * 60),
            catchup_window: Duration::from_secs(30 * 60),
        }
    }
}

impl DeliveryConfig {
    /// Build config from `HEALTH_REMINDERS_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            enabled: parse_var(&lookup, "HEALTH_REMINDERS_DELIVERY_ENABLED")?
                .unwrap_or(defaults.enabled),
            tick_interval: parse_var(&lookup, "HEALTH_REMINDERS_TICK_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.tick_interval),
            lookahead: parse_var(&lookup, "HEALTH_REMINDERS_LOOKAHEAD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lookahead),
            catchup_window: parse_var(&lookup, "HEALTH_REMINDERS_CATCHUP_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.catchup_window),
        };

        if config.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "HEALTH_REMINDERS_TICK_SECS".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(config)
    }

    /// Lookahead as a calendar duration for repository queries.
    pub fn lookahead_chrono(&self) -> chrono::Duration {
        to_chrono(self.lookahead)
    }

    pub fn catchup_chrono(&self) -> chrono::Duration {
        to_chrono(self.catchup_window)
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// Directory for daily-rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/health-reminders.db"),
            port: 8080,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: lookup("HEALTH_REMINDERS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: parse_var(&lookup, "HEALTH_REMINDERS_PORT")?.unwrap_or(defaults.port),
            log_dir: lookup("HEALTH_REMINDERS_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = DeliveryConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DeliveryConfig::default());
        assert_eq!(config.lookahead_chrono(), chrono::Duration::minutes(5));
        assert_eq!(config.catchup_chrono(), chrono::Duration::minutes(30));

        let server = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(server, ServerConfig::default());
    }

    #[test]
    fn overrides_from_env() {
        let config = DeliveryConfig::from_lookup(lookup(&[
            ("HEALTH_REMINDERS_TICK_SECS", "60"),
            ("HEALTH_REMINDERS_CATCHUP_SECS", " 900 "),
            ("HEALTH_REMINDERS_DELIVERY_ENABLED", "false"),
        ]))
        .unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.catchup_window, Duration::from_secs(900));
        assert!(!config.enabled);

        let server = ServerConfig::from_lookup(lookup(&[
            ("HEALTH_REMINDERS_PORT", "9191"),
            ("HEALTH_REMINDERS_DB_PATH", "/tmp/r.db"),
            ("HEALTH_REMINDERS_LOG_DIR", "/var/log/hr"),
        ]))
        .unwrap();
        assert_eq!(server.port, 9191);
        assert_eq!(server.db_path, PathBuf::from("/tmp/r.db"));
        assert_eq!(server.log_dir, Some(PathBuf::from("/var/log/hr")));
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = DeliveryConfig::from_lookup(lookup(&[("HEALTH_REMINDERS_TICK_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HEALTH_REMINDERS_TICK_SECS"));

        let err = DeliveryConfig::from_lookup(lookup(&[("HEALTH_REMINDERS_TICK_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ServerConfig::from_lookup(lookup(&[("HEALTH_REMINDERS_PORT", "70000")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
