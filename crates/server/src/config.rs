use std::fs;
use std::path::Path;

use anyhow::Context;
use tether::Config;

pub const DEFAULT_PORT: u16 = 27015;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub peer: Config,
    /// When set, only clients presenting this token are admitted and every
    /// admitted client is marked authenticated.
    pub secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            peer: Config::default(),
            secret: None,
        }
    }
}

/// Reads peer tunables from a JSON file. Fields left out keep their defaults;
/// durations are `{ "secs": .., "nanos": .. }` objects.
pub fn load_peer_config(path: &Path) -> anyhow::Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: Config = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_config(name: &str, json: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tether-{}-{}.json", name, std::process::id()));
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn loads_partial_config() {
        let path = write_config(
            "partial",
            r#"{ "max_connections": 2, "disconnect_timeout": { "secs": 5, "nanos": 0 } }"#,
        );

        let config = load_peer_config(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.disconnect_timeout, Duration::from_secs(5));
        assert_eq!(config.max_in_flight, Config::default().max_in_flight);
    }

    #[test]
    fn rejects_keep_alive_not_below_timeout() {
        let path = write_config(
            "invalid",
            r#"{ "keep_alive_interval": { "secs": 10, "nanos": 0 } }"#,
        );

        let err = load_peer_config(&path).unwrap_err();
        fs::remove_file(&path).unwrap();

        assert!(err.to_string().starts_with("invalid config"));
    }
}
