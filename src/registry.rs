//! Client arena and list bookkeeping.
//!
//! Clients live in a slab so that every connection has a stable key for
//! the descriptor table. Two intrusive doubly-linked lists thread through
//! the arena: the global list (every connected client) and one list per
//! channel (the fanout targets). Insertions prepend to the global list
//! and append to the channel list, deletions fix both lists in O(1).

use std::io::{self, Write};

use slab::Slab;

use crate::channel::Channel;
use crate::client::{Client, ClientId, ClientKind};
use crate::http::HTTP_OK_PREAMBLE;

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Slab<Client>,
    head: Option<ClientId>,
    tail: Option<ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Head of the global client list (most recently accepted).
    pub(crate) fn first(&self) -> Option<ClientId> {
        self.head
    }

    pub(crate) fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id)
    }

    /// Store a freshly accepted client and prepend it to the global list.
    pub(crate) fn insert(&mut self, client: Client) -> ClientId {
        let old_head = self.head;
        let id = self.clients.insert(client);
        self.clients[id].prev = None;
        self.clients[id].next = old_head;
        match old_head {
            Some(h) => self.clients[h].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        id
    }

    /// Attach a client to a channel's fanout list.
    ///
    /// HTTP clients get the fixed streaming preamble written first; a
    /// failed or short preamble write aborts the attach so the caller
    /// closes the connection. RTSP clients are list-appended only, their
    /// reply is protocol-level and already sent.
    pub(crate) fn attach(
        &mut self,
        id: ClientId,
        chan_idx: usize,
        channels: &mut [Channel],
    ) -> io::Result<()> {
        let channel_tail = channels[chan_idx].clients_tail;
        let client = &mut self.clients[id];
        if client.kind == ClientKind::Http {
            let preamble = HTTP_OK_PREAMBLE.as_bytes();
            let written = client.stream.write(preamble)?;
            if written != preamble.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short write on streaming preamble",
                ));
            }
        }
        client.channel = Some(chan_idx);
        client.chan_prev = channel_tail;
        client.chan_next = None;
        match channel_tail {
            Some(t) => self.clients[t].chan_next = Some(id),
            None => channels[chan_idx].clients_head = Some(id),
        }
        channels[chan_idx].clients_tail = Some(id);
        channels[chan_idx].client_count += 1;
        tracing::info!(
            peer_addr = %self.clients[id].peer_addr,
            channel = %channels[chan_idx].name,
            clients = channels[chan_idx].client_count,
            "client attached to channel"
        );
        Ok(())
    }

    /// Remove a client, fixing the global list and, when attached, the
    /// channel list. Sockets close when the returned value is dropped.
    pub(crate) fn remove(&mut self, id: ClientId, channels: &mut [Channel]) -> Option<Client> {
        let (prev, next, chan_prev, chan_next, channel) = {
            let client = self.clients.get(id)?;
            (
                client.prev,
                client.next,
                client.chan_prev,
                client.chan_next,
                client.channel,
            )
        };
        match prev {
            Some(p) => self.clients[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.clients[n].prev = prev,
            None => self.tail = prev,
        }
        if let Some(chan_idx) = channel {
            if let Some(channel) = channels.get_mut(chan_idx) {
                match chan_prev {
                    Some(p) => self.clients[p].chan_next = chan_next,
                    None => channel.clients_head = chan_next,
                }
                match chan_next {
                    Some(n) => self.clients[n].chan_prev = chan_prev,
                    None => channel.clients_tail = chan_prev,
                }
                channel.client_count -= 1;
            } else {
                tracing::error!(chan_idx, "client attached to a channel that no longer exists");
            }
        }
        let mut client = self.clients.remove(id);
        client.queue.clear();
        Some(client)
    }

    /// Every client, following the global list (most recent first).
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Client> {
        std::iter::successors(self.head, |&id| self.next_of(id)).map(|id| &self.clients[id])
    }

    /// Global-list successor, for iteration that may delete as it goes.
    pub(crate) fn next_of(&self, id: ClientId) -> Option<ClientId> {
        self.clients.get(id).and_then(|c| c.next)
    }

    #[cfg(test)]
    pub(crate) fn channel_list_ids(&self, channel: &Channel) -> Vec<ClientId> {
        let mut ids = Vec::new();
        let mut cursor = channel.clients_head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.clients[id].chan_next;
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::connected_client;

    fn registry_with(n: usize) -> (ClientRegistry, Vec<ClientId>, Vec<std::net::TcpStream>) {
        let mut reg = ClientRegistry::new();
        let mut ids = Vec::new();
        let mut peers = Vec::new();
        for i in 0..n {
            let (client, peer) = connected_client(ClientKind::Rtsp, i + 1);
            ids.push(reg.insert(client));
            peers.push(peer);
        }
        (reg, ids, peers)
    }

    #[test]
    fn global_list_prepends() {
        let (reg, ids, _peers) = registry_with(3);
        assert_eq!(reg.first(), Some(ids[2]));
        assert_eq!(reg.next_of(ids[2]), Some(ids[1]));
        assert_eq!(reg.next_of(ids[1]), Some(ids[0]));
        assert_eq!(reg.next_of(ids[0]), None);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn channel_list_appends() {
        let (mut reg, ids, _peers) = registry_with(3);
        let mut channels = vec![Channel::new("one", 1)];
        for &id in &ids {
            reg.attach(id, 0, &mut channels).unwrap();
        }
        assert_eq!(reg.channel_list_ids(&channels[0]), ids);
        assert_eq!(channels[0].client_count(), 3);
    }

    #[test]
    fn remove_middle_fixes_both_lists() {
        let (mut reg, ids, _peers) = registry_with(3);
        let mut channels = vec![Channel::new("one", 1)];
        for &id in &ids {
            reg.attach(id, 0, &mut channels).unwrap();
        }
        reg.remove(ids[1], &mut channels).unwrap();
        assert_eq!(reg.channel_list_ids(&channels[0]), vec![ids[0], ids[2]]);
        assert_eq!(channels[0].client_count(), 2);
        // global list was [2, 1, 0], now [2, 0]
        assert_eq!(reg.first(), Some(ids[2]));
        assert_eq!(reg.next_of(ids[2]), Some(ids[0]));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_head_and_tail_of_channel_list() {
        let (mut reg, ids, _peers) = registry_with(3);
        let mut channels = vec![Channel::new("one", 1)];
        for &id in &ids {
            reg.attach(id, 0, &mut channels).unwrap();
        }
        reg.remove(ids[0], &mut channels).unwrap();
        assert_eq!(reg.channel_list_ids(&channels[0]), vec![ids[1], ids[2]]);
        reg.remove(ids[2], &mut channels).unwrap();
        assert_eq!(reg.channel_list_ids(&channels[0]), vec![ids[1]]);
        assert_eq!(channels[0].client_count(), 1);
    }

    #[test]
    fn remove_unattached_client_leaves_channels_alone() {
        let (mut reg, ids, _peers) = registry_with(1);
        let mut channels = vec![Channel::new("one", 1)];
        reg.remove(ids[0], &mut channels).unwrap();
        assert_eq!(channels[0].client_count(), 0);
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.first(), None);
    }

    #[test]
    fn http_attach_writes_preamble() {
        use std::io::Read;
        let mut reg = ClientRegistry::new();
        let (client, mut peer) = connected_client(ClientKind::Http, 1);
        let id = reg.insert(client);
        let mut channels = vec![Channel::new("one", 1)];
        reg.attach(id, 0, &mut channels).unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 128];
        let n = peer.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-type: video/mpeg\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
