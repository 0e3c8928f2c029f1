//! Single-threaded poll-driven engine.
//!
//! One `mio::Poll` multiplexes every socket the engine owns: the master
//! HTTP and RTSP sockets, any dedicated per-channel listening sockets,
//! and all connected client control sockets. The embedding daemon drives
//! the engine from its main loop: [`poll_and_dispatch`](UnicastEngine::poll_and_dispatch) between stream
//! reads, [`data_send`](UnicastEngine::data_send) whenever a channel
//! buffer is ready to go out.
//!
//! Event dispatch is by token. A close in the middle of a batch leaves
//! later events of the same batch carrying tokens that no longer resolve;
//! those are re-checked against the descriptor table and skipped.

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::channel::Channel;
use crate::client::{Client, ClientKind, ReadOutcome};
use crate::config::UnicastConfig;
use crate::error::Result;
use crate::fdtable::{FdEntry, FdRole, FdTable};
use crate::registry::ClientRegistry;
use crate::{http, rtsp};

const MAX_EVENTS: usize = 128;

/// Which kind of listening socket to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    /// Master HTTP socket; the request path selects the channel.
    Http,
    /// Master RTSP socket.
    Rtsp,
    /// Dedicated socket for one channel; connecting clients are
    /// pre-attached to it without path interpretation.
    Channel(usize),
}

/// What a request handler decided about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    KeepOpen,
    CloseConnection,
}

pub struct UnicastEngine {
    pub(crate) config: UnicastConfig,
    poll: Poll,
    events: Events,
    pub(crate) fds: FdTable,
    pub(crate) registry: ClientRegistry,
}

impl UnicastEngine {
    pub fn new(config: UnicastConfig) -> Result<Self> {
        Ok(Self {
            config,
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            fds: FdTable::new(),
            registry: ClientRegistry::new(),
        })
    }

    pub fn config(&self) -> &UnicastConfig {
        &self.config
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind a listening socket, register it with the poll, and record it
    /// in the descriptor table. Returns the socket's token.
    pub fn create_listening_socket(
        &mut self,
        role: ListenerRole,
        ip: IpAddr,
        port: u16,
    ) -> Result<Token> {
        let addr = SocketAddr::new(ip, port);
        let mut listener = mio::net::TcpListener::bind(addr)?;
        let token = self.fds.alloc_token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        let bound = listener.local_addr()?;
        let fd_role = match role {
            ListenerRole::Http => FdRole::MasterHttp,
            ListenerRole::Rtsp => FdRole::MasterRtsp,
            ListenerRole::Channel(channel) => FdRole::ChannelListener { channel },
        };
        tracing::info!(addr = %bound, ?role, "listening socket created");
        self.fds.push(FdEntry {
            token,
            role: fd_role,
            listener: Some(listener),
        });
        Ok(token)
    }

    /// Actual bound address of a listening socket, so the embedding
    /// daemon can advertise ports picked by the kernel.
    pub fn local_addr(&self, token: Token) -> Option<SocketAddr> {
        self.fds
            .get(token)
            .and_then(|e| e.listener.as_ref())
            .and_then(|l| l.local_addr().ok())
    }

    /// Wait for socket events and dispatch them.
    ///
    /// Readable listeners accept until drained; hangups and handler
    /// decisions close connections; stale tokens are skipped.
    pub fn poll_and_dispatch(
        &mut self,
        channels: &mut [Channel],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }
        let batch: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let hangup =
                    event.is_error() || (event.is_read_closed() && !event.is_readable());
                (event.token(), event.is_readable(), hangup)
            })
            .collect();
        for (token, readable, hangup) in batch {
            let Some(entry) = self.fds.get(token) else {
                tracing::trace!(token = token.0, "token went stale mid-batch, skipping");
                continue;
            };
            let role = entry.role;
            if role.is_listener() {
                if readable {
                    self.accept_all(token);
                }
                continue;
            }
            if hangup {
                tracing::debug!(token = token.0, "hangup on client socket");
                self.close_connection(token, channels);
                continue;
            }
            if readable {
                self.handle_client_readable(token, role, channels);
            }
        }
        Ok(())
    }

    /// Accept every pending connection on a readable listener.
    fn accept_all(&mut self, listener_token: Token) {
        loop {
            let (stream, peer_addr, role) = {
                let Some(entry) = self.fds.get(listener_token) else {
                    return;
                };
                let role = entry.role;
                let Some(listener) = entry.listener.as_ref() else {
                    tracing::error!(token = listener_token.0, "listener record without a socket");
                    return;
                };
                match listener.accept() {
                    Ok((stream, addr)) => (stream, addr, role),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        return;
                    }
                }
            };
            self.admit(stream, peer_addr, role);
        }
    }

    /// Register a freshly accepted connection, or refuse it when the
    /// client limit is reached.
    fn admit(&mut self, mut stream: TcpStream, peer_addr: SocketAddr, listener_role: FdRole) {
        let kind = match listener_role {
            FdRole::MasterRtsp => ClientKind::Rtsp,
            _ => ClientKind::Http,
        };
        if self.config.max_clients > 0 && self.registry.len() >= self.config.max_clients {
            tracing::warn!(
                %peer_addr,
                max_clients = self.config.max_clients,
                "too many clients, refusing connection"
            );
            let refusal = match kind {
                ClientKind::Http => http::HTTP_503_REPLY,
                ClientKind::Rtsp => rtsp::RTSP_503_REPLY,
            };
            let _ = stream.write(refusal.as_bytes());
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(%peer_addr, error = %e, "TCP_NODELAY failed");
        }
        let token = self.fds.alloc_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            tracing::error!(%peer_addr, error = %e, "poll registration failed");
            return;
        }
        let mut client = Client::new(kind, stream, peer_addr, token);
        if let FdRole::ChannelListener { channel } = listener_role {
            client.asked_channel = Some(channel);
        }
        let id = self.registry.insert(client);
        let role = match kind {
            ClientKind::Http => FdRole::ClientHttp { client: id },
            ClientKind::Rtsp => FdRole::ClientRtsp { client: id },
        };
        self.fds.push(FdEntry {
            token,
            role,
            listener: None,
        });
        tracing::info!(%peer_addr, ?kind, clients = self.registry.len(), "client connected");
    }

    fn handle_client_readable(&mut self, token: Token, role: FdRole, channels: &mut [Channel]) {
        let Some(id) = role.client() else {
            return;
        };
        let Some(client) = self.registry.get_mut(id) else {
            tracing::error!(id, "descriptor referenced a missing client");
            return;
        };
        let kind = client.kind();
        match client.read_request() {
            ReadOutcome::Closed => self.close_connection(token, channels),
            ReadOutcome::NeedMore => {}
            ReadOutcome::Complete => {
                let outcome = match kind {
                    ClientKind::Http => http::handle_request(self, id, channels),
                    ClientKind::Rtsp => rtsp::handle_request(self, id, channels),
                };
                if outcome == HandlerOutcome::CloseConnection {
                    self.close_connection(token, channels);
                }
            }
        }
    }

    /// Tear down a client connection: unlink it from the registry and
    /// the channel lists, drop the descriptor record, deregister and
    /// close the sockets.
    pub(crate) fn close_connection(&mut self, token: Token, channels: &mut [Channel]) {
        let Some(entry) = self.fds.get(token) else {
            tracing::error!(token = token.0, "close requested for an unknown token");
            return;
        };
        let Some(id) = entry.role.client() else {
            tracing::error!(token = token.0, "close requested for a listening socket");
            return;
        };
        self.fds.remove(token);
        match self.registry.remove(id, channels) {
            Some(mut client) => {
                let _ = self.poll.registry().deregister(&mut client.stream);
                tracing::info!(
                    peer_addr = %client.peer_addr,
                    clients = self.registry.len(),
                    "client disconnected"
                );
            }
            None => tracing::error!(id, "descriptor referenced a missing client"),
        }
    }

    /// Connected clients, most recently accepted first.
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.registry.iter()
    }

    /// Close every client and every listening socket.
    pub fn shutdown_all(&mut self, channels: &mut [Channel]) {
        tracing::debug!(
            clients = self.registry.len(),
            descriptors = self.fds.len(),
            "shutting down unicast engine"
        );
        while let Some(id) = self.registry.first() {
            let before = self.registry.len();
            let token = match self.registry.get(id) {
                Some(client) => client.token,
                None => break,
            };
            self.close_connection(token, channels);
            if self.registry.len() == before {
                tracing::error!(id, "client refused to close, aborting shutdown loop");
                break;
            }
        }
        let listener_tokens: Vec<Token> = self
            .fds
            .iter()
            .filter(|e| e.role.is_listener())
            .map(|e| e.token)
            .collect();
        for token in listener_tokens {
            if let Some(mut entry) = self.fds.remove(token) {
                if let Some(mut listener) = entry.listener.take() {
                    let _ = self.poll.registry().deregister(&mut listener);
                }
            }
        }
        tracing::info!("unicast engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream as StdTcpStream;

    fn pump(engine: &mut UnicastEngine, channels: &mut [Channel], times: usize) {
        for _ in 0..times {
            engine
                .poll_and_dispatch(channels, Some(Duration::from_millis(20)))
                .unwrap();
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn accepts_and_counts_clients() {
        let mut engine = UnicastEngine::new(UnicastConfig::default()).unwrap();
        let token = engine
            .create_listening_socket(ListenerRole::Http, localhost(), 0)
            .unwrap();
        let addr = engine.local_addr(token).unwrap();
        let mut channels = vec![Channel::new("one", 1)];

        let _c1 = StdTcpStream::connect(addr).unwrap();
        let _c2 = StdTcpStream::connect(addr).unwrap();
        pump(&mut engine, &mut channels, 5);
        assert_eq!(engine.client_count(), 2);
    }

    #[test]
    fn peer_close_removes_client() {
        let mut engine = UnicastEngine::new(UnicastConfig::default()).unwrap();
        let token = engine
            .create_listening_socket(ListenerRole::Http, localhost(), 0)
            .unwrap();
        let addr = engine.local_addr(token).unwrap();
        let mut channels = vec![Channel::new("one", 1)];

        let c1 = StdTcpStream::connect(addr).unwrap();
        pump(&mut engine, &mut channels, 5);
        assert_eq!(engine.client_count(), 1);
        drop(c1);
        pump(&mut engine, &mut channels, 5);
        assert_eq!(engine.client_count(), 0);
    }

    #[test]
    fn refuses_beyond_max_clients() {
        let config = UnicastConfig {
            max_clients: 1,
            ..UnicastConfig::default()
        };
        let mut engine = UnicastEngine::new(config).unwrap();
        let token = engine
            .create_listening_socket(ListenerRole::Http, localhost(), 0)
            .unwrap();
        let addr = engine.local_addr(token).unwrap();
        let mut channels = vec![Channel::new("one", 1)];

        let _c1 = StdTcpStream::connect(addr).unwrap();
        pump(&mut engine, &mut channels, 5);
        assert_eq!(engine.client_count(), 1);

        let mut c2 = StdTcpStream::connect(addr).unwrap();
        pump(&mut engine, &mut channels, 5);
        assert_eq!(engine.client_count(), 1);
        c2.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = String::new();
        c2.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "HTTP/1.0 503 Too many clients\r\n\r\n");
    }

    #[test]
    fn shutdown_closes_everything() {
        let mut engine = UnicastEngine::new(UnicastConfig::default()).unwrap();
        let token = engine
            .create_listening_socket(ListenerRole::Http, localhost(), 0)
            .unwrap();
        let addr = engine.local_addr(token).unwrap();
        let mut channels = vec![Channel::new("one", 1)];

        let mut c1 = StdTcpStream::connect(addr).unwrap();
        pump(&mut engine, &mut channels, 5);
        assert_eq!(engine.client_count(), 1);

        engine.shutdown_all(&mut channels);
        assert_eq!(engine.client_count(), 0);
        assert!(engine.local_addr(token).is_none());

        c1.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(c1.read(&mut buf).unwrap(), 0);
    }
}
