use std::time::Duration;

use tether::Config;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub ping_interval: Duration,
    /// Token presented in the connect request.
    pub secret: Option<String>,
    pub peer: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "anonymous".to_string(),
            ping_interval: Duration::from_millis(250),
            secret: None,
            peer: Config::default(),
        }
    }
}
