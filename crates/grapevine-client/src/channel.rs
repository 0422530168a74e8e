// ABOUTME: gRPC channel creation for the event bus endpoint.
// ABOUTME: Keep-alive and TLS tuned for long-lived bidirectional subscribe streams.

use std::time::Duration;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::error::ClientError;

/// Keep-alive behavior for the bus channel.
///
/// Subscriptions can sit idle for minutes between batches; keep-alive pings
/// are what detect a dead broker or a load balancer that reset the
/// connection.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between HTTP/2 keep-alive pings.
    pub interval: Duration,
    /// How long to wait for a ping response before declaring the peer dead.
    pub timeout: Duration,
    /// Ping even when no RPC is in flight.
    pub while_idle: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(20),
            while_idle: true,
        }
    }
}

/// Configuration for the channel to the bus endpoint.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bus endpoint, e.g. "https://api.bus.example.com:7443".
    pub address: String,
    /// Keep-alive settings; None disables keep-alive entirely.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Timeout for the initial connect.
    pub connect_timeout: Option<Duration>,
    /// Enable TLS. Auto-detected from the address scheme.
    pub use_tls: bool,
}

impl ChannelConfig {
    /// Channel config with defaults suited to a production bus endpoint.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into().trim().to_string();
        let use_tls = address.to_lowercase().starts_with("https://");
        Self {
            address,
            keep_alive: Some(KeepAliveConfig::default()),
            connect_timeout: Some(Duration::from_secs(30)),
            use_tls,
        }
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Open a gRPC channel to the bus endpoint.
pub async fn create_channel(config: &ChannelConfig) -> Result<Channel, ClientError> {
    let mut endpoint = Endpoint::from_shared(config.address.clone())
        .map_err(|e| ClientError::InvalidAddress(e.to_string()))?;

    if config.use_tls {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|e| ClientError::Connection(format!("TLS config error: {e}")))?;
    }

    if let Some(ka) = &config.keep_alive {
        endpoint = endpoint
            .http2_keep_alive_interval(ka.interval)
            .keep_alive_timeout(ka.timeout)
            .keep_alive_while_idle(ka.while_idle);
    }

    if let Some(timeout) = config.connect_timeout {
        endpoint = endpoint.connect_timeout(timeout);
    }

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))?;

    tracing::debug!(
        address = %config.address,
        keep_alive = config.keep_alive.is_some(),
        use_tls = config.use_tls,
        "event bus channel connected"
    );

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_auto_detection() {
        assert!(ChannelConfig::new("https://api.bus.example.com:7443").use_tls);
        assert!(!ChannelConfig::new("http://localhost:7011").use_tls);
        assert!(ChannelConfig::new("HTTPS://api.bus.example.com").use_tls);
    }

    #[test]
    fn test_address_trimmed() {
        let config = ChannelConfig::new("  https://api.bus.example.com:7443  ");
        assert_eq!(config.address, "https://api.bus.example.com:7443");
    }

    #[test]
    fn test_builder_overrides() {
        let config = ChannelConfig::new("http://localhost:7011")
            .with_connect_timeout(Duration::from_secs(5))
            .with_keep_alive(KeepAliveConfig {
                interval: Duration::from_secs(15),
                timeout: Duration::from_secs(5),
                while_idle: false,
            });
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
        let ka = config.keep_alive.unwrap();
        assert_eq!(ka.interval, Duration::from_secs(15));
        assert!(!ka.while_idle);

        let config = ChannelConfig::new("http://localhost:7011").without_keep_alive();
        assert!(config.keep_alive.is_none());
    }

    #[test]
    fn test_default_keep_alive_pings_while_idle() {
        let ka = KeepAliveConfig::default();
        assert!(ka.while_idle);
        assert_eq!(ka.interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_create_channel_invalid_address() {
        let config = ChannelConfig::new("");
        let result = create_channel(&config).await;
        assert!(matches!(
            result.unwrap_err(),
            ClientError::InvalidAddress(_) | ClientError::Connection(_)
        ));
    }

    #[tokio::test]
    async fn test_create_channel_connection_refused() {
        let config = ChannelConfig::new("http://127.0.0.1:1")
            .with_connect_timeout(Duration::from_millis(100));
        let result = create_channel(&config).await;
        assert!(matches!(result.unwrap_err(), ClientError::Connection(_)));
    }
}
