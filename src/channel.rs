//! Channel view and request-path resolution.
//!
//! A [`Channel`] is the engine's window on one streamed service: its
//! identity (name, service id, optional dedicated listening port), the
//! data buffers refreshed by the demultiplexer before each fanout round,
//! and the per-channel client list the engine maintains.

use crate::client::ClientId;

/// One streamed service as seen by the delivery engine.
#[derive(Debug, Default)]
pub struct Channel {
    /// Human-readable service name.
    pub name: String,
    /// DVB service id.
    pub service_id: u16,
    /// Dedicated listening port, when the channel has its own socket.
    pub unicast_port: Option<u16>,
    /// Current plain payload, served to HTTP clients.
    pub buf: Vec<u8>,
    /// Current RTP-framed payload, served to RTSP clients.
    pub rtp_buf: Vec<u8>,
    pub(crate) clients_head: Option<ClientId>,
    pub(crate) clients_tail: Option<ClientId>,
    pub(crate) client_count: usize,
}

impl Channel {
    pub fn new(name: &str, service_id: u16) -> Self {
        Self {
            name: name.to_string(),
            service_id,
            ..Self::default()
        }
    }

    /// Number of clients currently attached to this channel.
    pub fn client_count(&self) -> usize {
        self.client_count
    }
}

/// Normalize a channel name for URL comparison: surrounding whitespace
/// stripped, inner whitespace turned into `-`.
pub fn normalize_channel_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}

/// Strip the scheme and authority from an absolute request URI, leaving
/// the path. `rtsp://host:554/bynumber/1` becomes `/bynumber/1`.
fn uri_path(uri: &str) -> &str {
    if let Some(rest) = uri.split_once("://").map(|(_, r)| r) {
        match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "/",
        }
    } else {
        uri
    }
}

/// Resolve a request path to a channel index.
///
/// Three addressing schemes are understood, shared by HTTP `GET` and
/// RTSP `PLAY`/`TEARDOWN`:
///
/// - `/bynumber/<n>` — 1-based position in the channel list
/// - `/bysid/<sid>` — DVB service id
/// - `/byname/<name>` — normalized name, case-insensitive
pub fn resolve_channel_path(uri: &str, channels: &[Channel]) -> Option<usize> {
    let path = uri_path(uri);
    if let Some(arg) = path.strip_prefix("/bynumber/") {
        let number: usize = arg.parse().ok()?;
        if number >= 1 && number <= channels.len() {
            return Some(number - 1);
        }
        tracing::info!(number, "channel number out of range");
        None
    } else if let Some(arg) = path.strip_prefix("/bysid/") {
        let sid: u16 = arg.parse().ok()?;
        channels.iter().position(|c| c.service_id == sid)
    } else if let Some(arg) = path.strip_prefix("/byname/") {
        let wanted = normalize_channel_name(arg);
        channels
            .iter()
            .position(|c| normalize_channel_name(&c.name).eq_ignore_ascii_case(&wanted))
    } else {
        None
    }
}
