//! Descriptor bookkeeping for the poll loop.
//!
//! Every registered socket has one record here: its poll token, its role,
//! and (for listening roles) the listener it owns. The table is a dense
//! vector; removal swap-removes so no holes accumulate. Tokens are
//! allocated monotonically and token 0 never resolves, so a token seen in
//! an event batch after its record was removed simply fails the lookup
//! and the event is skipped.

use mio::Token;
use mio::net::TcpListener;

use crate::client::ClientId;

/// What a registered descriptor is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdRole {
    /// Master HTTP socket, paths are interpreted on accept'd connections.
    MasterHttp,
    /// Master RTSP socket.
    MasterRtsp,
    /// Dedicated per-channel listening socket, accepts pre-attach.
    ChannelListener { channel: usize },
    /// Connected HTTP client control socket.
    ClientHttp { client: ClientId },
    /// Connected RTSP client control socket.
    ClientRtsp { client: ClientId },
}

impl FdRole {
    /// The client key, when this descriptor belongs to a client.
    pub(crate) fn client(&self) -> Option<ClientId> {
        match self {
            Self::ClientHttp { client } | Self::ClientRtsp { client } => Some(*client),
            _ => None,
        }
    }

    pub(crate) fn is_listener(&self) -> bool {
        matches!(
            self,
            Self::MasterHttp | Self::MasterRtsp | Self::ChannelListener { .. }
        )
    }
}

#[derive(Debug)]
pub(crate) struct FdEntry {
    pub(crate) token: Token,
    pub(crate) role: FdRole,
    /// Owned socket for listening roles; client sockets live in the
    /// client arena instead.
    pub(crate) listener: Option<TcpListener>,
}

#[derive(Debug)]
pub(crate) struct FdTable {
    entries: Vec<FdEntry>,
    next_token: usize,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        // token 0 is reserved so a zeroed token can never match
        Self {
            entries: Vec::new(),
            next_token: 1,
        }
    }

    pub(crate) fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub(crate) fn push(&mut self, entry: FdEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, token: Token) -> Option<&FdEntry> {
        self.entries.iter().find(|e| e.token == token)
    }

    /// Remove the record for `token`, keeping the vector dense.
    pub(crate) fn remove(&mut self, token: Token) -> Option<FdEntry> {
        let pos = self.entries.iter().position(|e| e.token == token)?;
        Some(self.entries.swap_remove(pos))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FdEntry> {
        self.entries.iter()
    }
}
