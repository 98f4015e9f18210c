//! Node configuration.
//!
//! Plain structs with sensible defaults. The embedding application builds
//! them however it likes (flags, env, a file it parsed itself); nothing in
//! this crate reads configuration from disk.

use std::time::Duration;

/// Settings for a [`KioskClient`](crate::KioskClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or IP.
    pub host: String,
    pub port: u16,
    /// Sent in `HandShake`; the server uses it for logging only.
    pub client_id: String,
    /// How often to retry a lost connection.
    pub reconnect_interval: Duration,
    /// How often to flush the pending queue.
    pub drain_interval: Duration,
    /// How often to request a full snapshot of every registry.
    pub sync_interval: Duration,
    /// How long the TCP connect plus handshake may take.
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    /// Defaults for everything but the address and identity.
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// `host:port`, as dialed.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            client_id: "kiosk".to_string(),
            reconnect_interval: Duration::from_secs(5),
            drain_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for a [`KioskServer`](crate::KioskServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Peers that have not reached `Encrypted` by then are dropped.
    pub handshake_timeout: Duration,
    /// Log a warning when a peer's outbound queue grows past this many
    /// packets.
    pub outbound_buffer_warn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            handshake_timeout: Duration::from_secs(10),
            outbound_buffer_warn: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::new("10.0.0.2", 7000, "kiosk-3");
        assert_eq!(config.addr(), "10.0.0.2:7000");
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.drain_interval, Duration::from_secs(1));
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(config.outbound_buffer_warn > 0);
    }
}
