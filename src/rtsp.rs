//! RTSP control path (RFC 2326 subset).
//!
//! Supported methods: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN. SETUP
//! negotiates a UDP/RTP data socket, PLAY attaches the session to a
//! channel, TEARDOWN ends it. `CSeq` is mandatory: a request without it
//! is dropped and the connection closed without a reply, as are SETUP
//! requests with an unusable `Transport`. Unknown methods are logged and
//! ignored without ending the session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::channel::{Channel, resolve_channel_path};
use crate::client::{RtspState, generate_session_token};
use crate::engine::{HandlerOutcome, UnicastEngine};
use crate::error::{ParseErrorKind, Result, UnicastError};
use crate::reply::Reply;

pub(crate) const RTSP_503_REPLY: &str = "RTSP/1.0 503 Too many clients\r\n\r\n";

/// MP2T static RTP payload type (RFC 3551 §6).
const PAYLOAD_TYPE_MP2T: u8 = 33;

/// A parsed RTSP request: request line plus headers.
///
/// Header lines without a colon are skipped rather than rejected, some
/// players emit bare continuation lines.
#[derive(Debug)]
struct RtspRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
}

impl RtspRequest {
    fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let request_line = lines.next().filter(|l| !l.is_empty()).ok_or(UnicastError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(UnicastError::Parse {
            kind: ParseErrorKind::InvalidRequestLine,
        })?;
        let uri = parts.next().ok_or(UnicastError::Parse {
            kind: ParseErrorKind::InvalidRequestLine,
        })?;
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Handle one complete buffered RTSP request.
pub(crate) fn handle_request(
    engine: &mut UnicastEngine,
    id: usize,
    channels: &mut [Channel],
) -> HandlerOutcome {
    let (text, peer_addr, local_addr) = {
        let Some(client) = engine.registry.get_mut(id) else {
            return HandlerOutcome::CloseConnection;
        };
        let text = String::from_utf8_lossy(&client.recv).into_owned();
        client.reset_recv();
        (text, client.peer_addr(), client.stream.local_addr().ok())
    };

    let request = match RtspRequest::parse(&text) {
        Ok(request) => request,
        Err(e) => {
            tracing::info!(%peer_addr, error = %e, "unparseable RTSP request, closing");
            return HandlerOutcome::CloseConnection;
        }
    };
    let Some(cseq) = request.header("CSeq").and_then(|v| v.parse::<u64>().ok()) else {
        tracing::info!(%peer_addr, method = %request.method, "RTSP request without CSeq, closing");
        return HandlerOutcome::CloseConnection;
    };
    tracing::debug!(%peer_addr, method = %request.method, cseq, "RTSP request");

    match request.method.as_str() {
        "OPTIONS" => {
            send(engine, id, Reply::new(), 200, cseq, "text/plain");
            HandlerOutcome::KeepOpen
        }
        "DESCRIBE" => {
            send(engine, id, describe_reply(local_addr), 200, cseq, "application/sdp");
            HandlerOutcome::KeepOpen
        }
        "SETUP" => setup(engine, id, &request, &text, cseq, peer_addr),
        "PLAY" => play(engine, id, &request, cseq, channels),
        "TEARDOWN" => {
            let code = if resolve_channel_path(&request.uri, channels).is_some() {
                200
            } else {
                404
            };
            let mut reply = Reply::new();
            if let Some(session) = engine.registry.get(id).and_then(|c| c.session.clone()) {
                reply.append_header(format_args!("Session: {}\r\n", session));
            }
            send(engine, id, reply, code, cseq, "text/plain");
            HandlerOutcome::CloseConnection
        }
        method => {
            tracing::info!(%peer_addr, method, "unhandled RTSP method, ignoring");
            HandlerOutcome::KeepOpen
        }
    }
}

/// Minimal placeholder session description for DESCRIBE.
fn describe_reply(local_addr: Option<SocketAddr>) -> Reply {
    let host = local_addr
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let mut reply = Reply::new();
    reply.append_body(format_args!("v=0\r\n"));
    reply.append_body(format_args!("o=- 0 0 IN IP4 {}\r\n", host));
    reply.append_body(format_args!("s=unknown\r\n"));
    reply.append_body(format_args!("i=unknown\r\n"));
    reply.append_body(format_args!("c=IN IP4 0.0.0.0\r\n"));
    reply.append_body(format_args!("t=0 0\r\n"));
    reply.append_body(format_args!("m=video 0 RTP/AVP {}\r\n", PAYLOAD_TYPE_MP2T));
    reply
}

/// The transport specs we can serve. Order matters, longest prefix first.
fn transport_is_supported(transport: &str) -> bool {
    ["RTP/AVP/TCP", "RTP/AVP/UDP", "RTP/AVP"]
        .iter()
        .any(|spec| transport.starts_with(spec))
}

/// First `client_port=` value anywhere in the request text. Players put
/// it inside the `Transport` header but some send it on its own line.
fn find_client_port(text: &str) -> Option<u16> {
    let at = text.find("client_port=")?;
    let digits: String = text[at + "client_port=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn setup(
    engine: &mut UnicastEngine,
    id: usize,
    request: &RtspRequest,
    raw: &str,
    cseq: u64,
    peer_addr: SocketAddr,
) -> HandlerOutcome {
    let Some(transport) = request.header("Transport") else {
        tracing::info!(%peer_addr, "SETUP without Transport header, closing");
        return HandlerOutcome::CloseConnection;
    };
    if !transport_is_supported(transport) {
        tracing::info!(%peer_addr, transport, "unsupported transport, closing");
        return HandlerOutcome::CloseConnection;
    }
    let Some(client_port) = find_client_port(raw) else {
        tracing::info!(%peer_addr, "SETUP without client_port, closing");
        return HandlerOutcome::CloseConnection;
    };

    let bind_ip: IpAddr = match peer_addr.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = match rtp_data_socket(bind_ip, peer_addr.ip(), client_port) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(%peer_addr, error = %e, "RTP data socket setup failed");
            return HandlerOutcome::CloseConnection;
        }
    };
    let server_port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            tracing::error!(%peer_addr, error = %e, "RTP data socket has no local address");
            return HandlerOutcome::CloseConnection;
        }
    };

    let session = generate_session_token();
    let mut reply = Reply::new();
    reply.append_header(format_args!("Session: {}\r\n", session));
    reply.append_header(format_args!(
        "Transport: RTP/AVP;unicast;mode=play;destination={};client_port={}-{};server_port={}\r\n",
        peer_addr.ip(),
        client_port,
        client_port.wrapping_add(1),
        server_port
    ));

    {
        let Some(client) = engine.registry.get_mut(id) else {
            return HandlerOutcome::CloseConnection;
        };
        client.session = Some(session);
        client.rtp_socket = Some(socket);
        client.rtp_client_port = Some(client_port);
        client.rtp_server_port = Some(server_port);
        client.rtsp_state = RtspState::SessionReady;
    }
    tracing::info!(%peer_addr, client_port, server_port, "RTSP session set up");
    send(engine, id, reply, 200, cseq, "text/plain");
    HandlerOutcome::KeepOpen
}

fn rtp_data_socket(bind_ip: IpAddr, peer_ip: IpAddr, client_port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
    socket.connect(SocketAddr::new(peer_ip, client_port))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn play(
    engine: &mut UnicastEngine,
    id: usize,
    request: &RtspRequest,
    cseq: u64,
    channels: &mut [Channel],
) -> HandlerOutcome {
    let Some(client) = engine.registry.get(id) else {
        return HandlerOutcome::CloseConnection;
    };
    let peer_addr = client.peer_addr();
    let Some(session) = client.session.clone() else {
        tracing::info!(%peer_addr, "PLAY without a session");
        send(engine, id, Reply::new(), 454, cseq, "text/plain");
        return HandlerOutcome::CloseConnection;
    };
    let Some(chan_idx) = resolve_channel_path(&request.uri, channels) else {
        tracing::info!(%peer_addr, uri = %request.uri, "PLAY for an unknown channel");
        send(engine, id, Reply::new(), 404, cseq, "text/plain");
        return HandlerOutcome::CloseConnection;
    };
    let already_attached = client.channel().is_some();

    let mut reply = Reply::new();
    reply.append_header(format_args!("Session: {}\r\n", session));
    send(engine, id, reply, 200, cseq, "text/plain");

    // a repeated PLAY must not append the client to the list again
    if already_attached {
        tracing::debug!(%peer_addr, "PLAY on an already playing session");
        return HandlerOutcome::KeepOpen;
    }
    if let Err(e) = engine.registry.attach(id, chan_idx, channels) {
        tracing::warn!(%peer_addr, error = %e, "attach failed after PLAY");
        return HandlerOutcome::CloseConnection;
    }
    if let Some(client) = engine.registry.get_mut(id) {
        client.rtsp_state = RtspState::Streaming;
    }
    HandlerOutcome::KeepOpen
}

/// Finalize and transmit an RTSP reply on the control socket.
fn send(engine: &mut UnicastEngine, id: usize, reply: Reply, code: u16, cseq: u64, content_type: &str) {
    if let Some(client) = engine.registry.get_mut(id) {
        if let Err(e) = reply.send_rtsp(code, cseq, content_type, &mut client.stream) {
            tracing::debug!(peer_addr = %client.peer_addr(), error = %e, "RTSP reply write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let req = RtspRequest::parse(
            "OPTIONS rtsp://host/bynumber/1 RTSP/1.0\r\nCSeq: 3\r\nUser-Agent: test\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://host/bynumber/1");
        assert_eq!(req.header("cseq"), Some("3"));
        assert_eq!(req.header("User-Agent"), Some("test"));
        assert_eq!(req.header("Transport"), None);
    }

    #[test]
    fn parse_rejects_empty_and_truncated_requests() {
        assert!(RtspRequest::parse("").is_err());
        assert!(RtspRequest::parse("OPTIONS\r\n\r\n").is_err());
    }

    #[test]
    fn parse_skips_bare_lines() {
        let req = RtspRequest::parse(
            "SETUP rtsp://host/bynumber/1 RTSP/1.0\r\nTransport: RTP/AVP/UDP\r\nclient_port=5000\r\nCSeq: 2\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.header("Transport"), Some("RTP/AVP/UDP"));
        assert_eq!(req.header("CSeq"), Some("2"));
    }

    #[test]
    fn transport_prefixes() {
        assert!(transport_is_supported("RTP/AVP"));
        assert!(transport_is_supported("RTP/AVP/UDP;unicast;client_port=5000-5001"));
        assert!(transport_is_supported("RTP/AVP/TCP;interleaved=0-1"));
        assert!(!transport_is_supported("RAW/RAW/UDP"));
        assert!(!transport_is_supported(""));
    }

    #[test]
    fn client_port_found_wherever_it_hides() {
        assert_eq!(
            find_client_port("Transport: RTP/AVP;unicast;client_port=5000-5001\r\n"),
            Some(5000)
        );
        assert_eq!(find_client_port("client_port=6004\r\n"), Some(6004));
        assert_eq!(find_client_port("Transport: RTP/AVP;unicast\r\n"), None);
        assert_eq!(find_client_port("client_port=notanumber"), None);
    }

    #[test]
    fn describe_body_is_mp2t_sdp() {
        let addr: SocketAddr = "192.0.2.1:554".parse().unwrap();
        let reply = describe_reply(Some(addr));
        let text = String::from_utf8(reply.finalize_rtsp(200, 1, "application/sdp")).unwrap();
        assert!(text.contains("Content-type: application/sdp\r\n"));
        assert!(text.contains("v=0\r\n"));
        assert!(text.contains("o=- 0 0 IN IP4 192.0.2.1\r\n"));
        assert!(text.contains("m=video 0 RTP/AVP 33\r\n"));
    }
}
