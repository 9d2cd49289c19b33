use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::io::ReadPolicy;
use crate::pool::BUFFER_POOL_SIZE;

/// Configuration for an [`Endpoint`](crate::Endpoint).
///
/// All fields have defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use cmm_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .listen_addr("127.0.0.1:0".parse().unwrap())
///     .read_retries(3)
///     .write_timeout(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP listen address for point-to-point frames.
    pub(crate) listen_addr: SocketAddr,
    /// UDP address used for broadcast frames. `None` falls back to TCP fan-out.
    pub(crate) broadcast_addr: Option<SocketAddr>,
    pub(crate) read_retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) pool_size: usize,
    /// Channel buffer size for incoming frames.
    pub(crate) recv_buffer: usize,
    /// Consecutive bad frames tolerated on one connection before it is dropped.
    pub(crate) max_frame_errors: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            broadcast_addr: None,
            read_retries: 5,
            retry_delay: Duration::from_millis(200),
            write_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            pool_size: BUFFER_POOL_SIZE,
            recv_buffer: 256,
            max_frame_errors: 8,
        }
    }

    /// Set the TCP listen address (default: `0.0.0.0:0`).
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Send broadcasts as UDP datagrams to `addr` and listen there too.
    pub fn broadcast_addr(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = Some(addr);
        self
    }

    /// Stalled read attempts tolerated mid-frame (default: 5).
    pub fn read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    /// Wait per read attempt (default: 200 ms).
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Give up a write after this long without progress (default: 2 s).
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Number of frame buffers (default: 16).
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Set the channel buffer size for incoming frames (default: 256).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity.max(1);
        self
    }

    pub fn max_frame_errors(mut self, max: u32) -> Self {
        self.max_frame_errors = max;
        self
    }

    pub fn read_policy(&self) -> ReadPolicy {
        ReadPolicy::new(self.read_retries, self.retry_delay)
    }

    pub fn get_listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn get_broadcast_addr(&self) -> Option<SocketAddr> {
        self.broadcast_addr
    }

    pub fn get_write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn get_pool_size(&self) -> usize {
        self.pool_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransportConfig::new();
        assert_eq!(config.read_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.pool_size, BUFFER_POOL_SIZE);
        assert!(config.broadcast_addr.is_none());
    }

    #[test]
    fn builder_chain() {
        let config = TransportConfig::new()
            .listen_addr("127.0.0.1:7400".parse().unwrap())
            .broadcast_addr("255.255.255.255:7401".parse().unwrap())
            .read_retries(2)
            .pool_size(0);
        assert_eq!(config.listen_addr.port(), 7400);
        assert_eq!(config.broadcast_addr.map(|a| a.port()), Some(7401));
        assert_eq!(config.read_policy().retries, 2);
        // Clamped; an empty pool would deadlock every send.
        assert_eq!(config.pool_size, 1);
    }
}
