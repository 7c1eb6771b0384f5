//! Dashboard API configuration.

use std::time::Duration;

/// Bind address and request handling settings for the dashboard API.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// How long `POST /tasks` waits for a result before answering with the
    /// pending task id. Must stay below `request_timeout`.
    pub sync_wait_timeout: Duration,
    /// Time allowed for in-flight requests to finish after shutdown.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            sync_wait_timeout: Duration::from_secs(20),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Checks that a synchronous wait can finish inside the request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when `sync_wait_timeout` is not below
    /// `request_timeout`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_wait_timeout >= self.request_timeout {
            anyhow::bail!(
                "sync_wait_timeout ({:?}) must be below request_timeout ({:?})",
                self.sync_wait_timeout,
                self.request_timeout
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.sync_wait_timeout, Duration::from_secs(20));
        config.validate().unwrap();
    }

    #[test]
    fn sync_wait_must_fit_in_request_timeout() {
        let config = NetworkConfig {
            sync_wait_timeout: Duration::from_secs(30),
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
