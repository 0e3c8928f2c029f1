//! Per-client connection state.
//!
//! A [`Client`] owns its control socket, its receive accumulator, its
//! backpressure queue, and (for RTSP) the negotiated UDP data socket and
//! session token. Clients live in the registry's arena and carry the
//! intrusive links for the global and per-channel lists.

use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use mio::Token;
use mio::net::TcpStream;
use rand::RngExt;

use crate::queue::PacketQueue;

/// Stable key of a client in the registry arena.
pub type ClientId = usize;

/// Bytes read from the control socket per `recv` call.
const RECV_CHUNK: usize = 512;

/// Which protocol drives the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Http,
    Rtsp,
}

/// RTSP session progression.
///
/// `AwaitingRequest` until SETUP succeeds, `SessionReady` once the UDP
/// transport is negotiated, `Streaming` after PLAY attaches a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    AwaitingRequest,
    SessionReady,
    Streaming,
}

/// Result of draining the control socket into the receive accumulator.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A full request (terminated by a blank line) is buffered.
    Complete,
    /// No delimiter yet, keep the connection and wait for more bytes.
    NeedMore,
    /// Peer closed or the socket failed, the connection must go away.
    Closed,
}

#[derive(Debug)]
pub struct Client {
    pub(crate) kind: ClientKind,
    pub(crate) stream: TcpStream,
    pub(crate) peer_addr: SocketAddr,
    /// Poll token of the control socket in the descriptor table.
    pub(crate) token: Token,
    /// Receive accumulator, reset after every complete request.
    pub(crate) recv: Vec<u8>,
    /// Attached channel index, `None` until a GET or PLAY succeeds.
    pub(crate) channel: Option<usize>,
    /// Channel pre-seeded by a per-channel listening socket.
    pub(crate) asked_channel: Option<usize>,
    /// Start of the current run of consecutive write errors.
    pub(crate) erroring_since: Option<Instant>,
    /// Kind of the last write error, to log each distinct failure once.
    pub(crate) last_write_error: Option<io::ErrorKind>,
    pub(crate) queue: PacketQueue,
    // RTSP side, unset for HTTP clients.
    pub(crate) rtsp_state: RtspState,
    pub(crate) session: Option<String>,
    pub(crate) rtp_socket: Option<UdpSocket>,
    pub(crate) rtp_client_port: Option<u16>,
    pub(crate) rtp_server_port: Option<u16>,
    // Intrusive links: global list and per-channel list.
    pub(crate) next: Option<ClientId>,
    pub(crate) prev: Option<ClientId>,
    pub(crate) chan_next: Option<ClientId>,
    pub(crate) chan_prev: Option<ClientId>,
}

impl Client {
    pub(crate) fn new(kind: ClientKind, stream: TcpStream, peer_addr: SocketAddr, token: Token) -> Self {
        Self {
            kind,
            stream,
            peer_addr,
            token,
            recv: Vec::new(),
            channel: None,
            asked_channel: None,
            erroring_since: None,
            last_write_error: None,
            queue: PacketQueue::new(),
            rtsp_state: RtspState::AwaitingRequest,
            session: None,
            rtp_socket: None,
            rtp_client_port: None,
            rtp_server_port: None,
            next: None,
            prev: None,
            chan_next: None,
            chan_prev: None,
        }
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Channel this client is attached to, if any.
    pub fn channel(&self) -> Option<usize> {
        self.channel
    }

    /// RTSP session progression; always `AwaitingRequest` for HTTP.
    pub fn rtsp_state(&self) -> RtspState {
        self.rtsp_state
    }

    /// RTSP session token handed out by SETUP.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Negotiated RTP (client, server) ports, once SETUP succeeded.
    pub fn rtp_ports(&self) -> Option<(u16, u16)> {
        self.rtp_client_port.zip(self.rtp_server_port)
    }

    /// Drain the control socket into the receive accumulator.
    ///
    /// Reads until `WouldBlock` (the poll is edge-triggered) and reports
    /// whether a blank-line-terminated request is now buffered.
    pub(crate) fn read_request(&mut self) -> ReadOutcome {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!(peer_addr = %self.peer_addr, "connection closed by peer");
                    return ReadOutcome::Closed;
                }
                Ok(n) => self.recv.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(peer_addr = %self.peer_addr, error = %e, "recv failed");
                    return ReadOutcome::Closed;
                }
            }
        }
        if self
            .recv
            .windows(4)
            .any(|w| w == b"\r\n\r\n")
        {
            ReadOutcome::Complete
        } else {
            ReadOutcome::NeedMore
        }
    }

    /// Forget the buffered request once it has been handled.
    pub(crate) fn reset_recv(&mut self) {
        self.recv.clear();
    }
}

/// Generate a fresh RTSP session token: 15 lowercase ASCII letters.
pub(crate) fn generate_session_token() -> String {
    let mut rng = rand::rng();
    (0..15)
        .map(|_| rng.random_range(b'a'..=b'z') as char)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn session_token_shape() {
        let token = generate_session_token();
        assert_eq!(token.len(), 15);
        assert!(token.bytes().all(|b| b.is_ascii_lowercase()));
    }

    #[test]
    fn session_tokens_differ() {
        assert_ne!(generate_session_token(), generate_session_token());
    }

    #[test]
    fn read_request_waits_for_blank_line() {
        let (mut client, mut peer) = testutil::connected_client(ClientKind::Http, 1);
        peer.write_all(b"GET /bynumber/1 HTTP/1.0\r\n").unwrap();
        // give the loopback a moment to deliver
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(client.read_request(), ReadOutcome::NeedMore);
        peer.write_all(b"\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(client.read_request(), ReadOutcome::Complete);
        client.reset_recv();
        assert!(client.recv.is_empty());
    }

    #[test]
    fn read_request_reports_peer_close() {
        let (mut client, peer) = testutil::connected_client(ClientKind::Http, 1);
        drop(peer);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(client.read_request(), ReadOutcome::Closed);
    }
}
