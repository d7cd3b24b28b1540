use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::device::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_QUEUE, DEFAULT_LOOP_PERIOD, DEFAULT_SCAN_SECONDS};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Spacing between writes of a repeating send.
    pub loop_period_ms: u64,
    pub scan_seconds: u64,
    /// Capacity of the radio and session event channels.
    pub event_queue: usize,
    pub connect_timeout_ms: u64,
    pub log_level: String,
}

impl Config {
    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(self.loop_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_period_ms == 0 {
            return Err(ConfigError::ZeroValue { field: "loopPeriodMs" });
        }
        if self.event_queue == 0 {
            return Err(ConfigError::ZeroValue { field: "eventQueue" });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue { field: "connectTimeoutMs" });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            loop_period_ms: DEFAULT_LOOP_PERIOD,
            scan_seconds: DEFAULT_SCAN_SECONDS,
            event_queue: DEFAULT_EVENT_QUEUE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{"loopPeriodMs": 250}"#).unwrap();
        assert_eq!(config.loop_period(), Duration::from_millis(250));
        assert_eq!(config.event_queue, DEFAULT_EVENT_QUEUE);
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn reference_period_is_half_a_second() {
        assert_eq!(Config::default().loop_period(), Duration::from_millis(500));
    }

    #[test]
    fn zero_period_is_rejected() {
        let config = Config { loop_period_ms: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroValue { field: "loopPeriodMs" })));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config { log_level: "loud".to_string(), ..Config::default() };
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
        let config = Config { log_level: "debug".to_string(), ..Config::default() };
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
    }
}
