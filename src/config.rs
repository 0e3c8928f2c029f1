//! Engine configuration.
//!
//! All tunables live in one explicit struct handed to
//! [`UnicastEngine::new`](crate::engine::UnicastEngine::new); nothing is
//! read from ambient globals. Configuration-file parsing belongs to the
//! embedding daemon, only resolved values enter here.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default HTTP listening port.
pub const DEFAULT_HTTP_PORT: u16 = 4242;
/// Default RTSP listening port.
pub const DEFAULT_RTSP_PORT: u16 = 554;
/// Default bound on a single client's backpressure queue, in bytes.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 1024 * 512;
/// Default delay before a client that only produces write errors is dropped.
pub const DEFAULT_CONSECUTIVE_ERRORS_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for the unicast delivery engine.
#[derive(Debug, Clone)]
pub struct UnicastConfig {
    /// Address the master HTTP socket binds to.
    pub ip: IpAddr,
    /// Port of the master HTTP socket.
    pub port_http: u16,
    /// Port of the master RTSP socket.
    pub port_rtsp: u16,
    /// Maximum number of simultaneous clients. `0` means unlimited.
    pub max_clients: usize,
    /// Bound on a single client's backpressure queue, in bytes.
    pub queue_max_size: usize,
    /// How long a client may produce only write errors before it is
    /// force-disconnected. A zero duration disables the eviction.
    pub consecutive_errors_timeout: Duration,
    /// Debug knob: on `WouldBlock`, drop data (and flush the queue)
    /// instead of queueing it.
    pub flush_on_eagain: bool,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_http: DEFAULT_HTTP_PORT,
            port_rtsp: DEFAULT_RTSP_PORT,
            max_clients: 0,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            consecutive_errors_timeout: DEFAULT_CONSECUTIVE_ERRORS_TIMEOUT,
            flush_on_eagain: false,
        }
    }
}
