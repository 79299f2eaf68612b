use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for the request server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Pause before the single retry when a connection yields no request line
    pub read_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            read_retry_delay: Duration::from_millis(10),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_read_retry_delay(mut self, delay: Duration) -> Self {
        self.read_retry_delay = delay;
        self
    }
}
