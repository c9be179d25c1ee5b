use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`Peer`](crate::Peer). Validated once at construction and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_connections: usize,
    pub max_connect_attempts: u32,
    pub connect_attempt_interval: Duration,
    pub disconnect_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Unacknowledged reliable frames are resent after
    /// `disconnect_timeout * resend_fraction`.
    pub resend_fraction: f32,
    pub max_in_flight: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 32,
            max_connect_attempts: 10,
            connect_attempt_interval: Duration::from_millis(500),
            disconnect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(1),
            resend_fraction: 0.02,
            max_in_flight: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("keep-alive interval {keep_alive:?} must be shorter than disconnect timeout {timeout:?}")]
    KeepAliveTooLong {
        keep_alive: Duration,
        timeout: Duration,
    },
    #[error("max_connect_attempts must be at least 1")]
    NoConnectAttempts,
    #[error("connect_attempt_interval must be non-zero")]
    ZeroAttemptInterval,
    #[error("resend_fraction must be in (0, 1], got {0}")]
    ResendFraction(f32),
    #[error("max_in_flight must be at least 1")]
    NoSendWindow,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_interval >= self.disconnect_timeout {
            return Err(ConfigError::KeepAliveTooLong {
                keep_alive: self.keep_alive_interval,
                timeout: self.disconnect_timeout,
            });
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::NoConnectAttempts);
        }
        if self.connect_attempt_interval.is_zero() {
            return Err(ConfigError::ZeroAttemptInterval);
        }
        if !(self.resend_fraction > 0.0 && self.resend_fraction <= 1.0) {
            return Err(ConfigError::ResendFraction(self.resend_fraction));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::NoSendWindow);
        }
        Ok(())
    }

    pub fn resend_interval(&self) -> Duration {
        self.disconnect_timeout.mul_f32(self.resend_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let resend = config.resend_interval();
        assert!(resend > Duration::from_millis(199) && resend < Duration::from_millis(201));
    }

    #[test]
    fn keep_alive_must_be_shorter_than_timeout() {
        let config = Config {
            keep_alive_interval: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::KeepAliveTooLong { .. })
        ));
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = Config {
            max_connect_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoConnectAttempts));
    }

    #[test]
    fn resend_fraction_bounds() {
        for fraction in [0.0, -0.5, 1.5, f32::NAN] {
            let config = Config {
                resend_fraction: fraction,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{fraction} accepted");
        }
    }

    #[test]
    fn zero_connections_allowed() {
        let config = Config {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "max_connections": 4, "keep_alive_interval": { "secs": 2, "nanos": 0 } }"#,
        )
        .unwrap();

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(2));
        assert_eq!(config.disconnect_timeout, Config::default().disconnect_timeout);
        assert!(config.validate().is_ok());

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }
}
