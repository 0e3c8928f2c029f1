//! Per-channel data fanout.
//!
//! [`UnicastEngine::data_send`] walks a channel's client list and pushes
//! the current buffers out: the plain payload on HTTP control sockets,
//! the RTP-framed payload on RTSP data sockets. A client whose socket
//! cannot keep up gets its data parked in its queue; queued data always
//! goes out before new data, at most [`MULTIPLE_QUEUE_SEND`] packets per
//! round so one congested client cannot stall the channel. Clients that
//! produce only write errors for longer than the configured timeout are
//! force-disconnected.

use std::io::{self, Write};
use std::time::Instant;

use crate::channel::Channel;
use crate::client::{Client, ClientKind};
use crate::config::UnicastConfig;
use crate::engine::UnicastEngine;
use crate::queue::MULTIPLE_QUEUE_SEND;

#[derive(Debug, PartialEq, Eq)]
enum PumpOutcome {
    Keep,
    Evict,
}

impl UnicastEngine {
    /// Send the channel's current buffers to every attached client.
    ///
    /// Evictions are collected during the walk and applied afterwards so
    /// the list stays stable while the buffers are borrowed.
    pub fn data_send(&mut self, channels: &mut [Channel], chan_idx: usize) {
        let mut evicted: Vec<mio::Token> = Vec::new();
        {
            let Some(channel) = channels.get(chan_idx) else {
                tracing::error!(chan_idx, "data_send for an unknown channel");
                return;
            };
            let mut cursor = channel.clients_head;
            while let Some(id) = cursor {
                let Some(client) = self.registry.get_mut(id) else {
                    tracing::error!(id, "channel list references a missing client");
                    break;
                };
                let next = client.chan_next;
                let fresh = match client.kind {
                    ClientKind::Http => channel.buf.as_slice(),
                    ClientKind::Rtsp => channel.rtp_buf.as_slice(),
                };
                if pump(client, fresh, &self.config) == PumpOutcome::Evict {
                    evicted.push(client.token);
                }
                cursor = next;
            }
        }
        for token in evicted {
            self.close_connection(token, channels);
        }
    }
}

/// Push one round of data to a single client.
///
/// With an empty queue the fresh buffer is written directly and any
/// unsent part parked. With a backlog the fresh buffer is appended
/// (bounded) and up to [`MULTIPLE_QUEUE_SEND`] queued packets drained,
/// oldest first.
fn pump(client: &mut Client, fresh: &[u8], config: &UnicastConfig) -> PumpOutcome {
    if fresh.is_empty() {
        return PumpOutcome::Keep;
    }
    let mut from_queue = false;
    let mut packets_left = 1usize;
    if !client.queue.is_empty() {
        from_queue = true;
        packets_left = MULTIPLE_QUEUE_SEND;
        park(client, fresh, config);
    }

    while packets_left > 0 {
        let (result, attempted) = {
            let buf: &[u8] = if from_queue {
                match client.queue.head() {
                    Some(head) => head,
                    None => break,
                }
            } else {
                fresh
            };
            let result = match client.kind {
                ClientKind::Http => client.stream.write(buf),
                ClientKind::Rtsp => match client.rtp_socket.as_ref() {
                    Some(socket) => socket.send(buf),
                    None => Err(io::Error::from(io::ErrorKind::NotConnected)),
                },
            };
            (result, buf.len())
        };
        packets_left -= 1;
        match result {
            Ok(n) if n == attempted => {
                client.erroring_since = None;
                client.last_write_error = None;
                if !from_queue {
                    break;
                }
                client.queue.pop();
                if client.queue.is_empty() {
                    break;
                }
            }
            Ok(n) => {
                tracing::debug!(
                    peer_addr = %client.peer_addr,
                    sent = n,
                    attempted,
                    "partial write, parking the remainder"
                );
                if from_queue {
                    let rest = client.queue.head().map(|head| head[n..].to_vec());
                    if let Some(rest) = rest {
                        client.queue.requeue_head(&rest);
                    }
                } else {
                    park(client, &fresh[n..], config);
                }
                return error_tick(client, None, config);
            }
            Err(e) => {
                let kind = e.kind();
                if kind == io::ErrorKind::WouldBlock && config.flush_on_eagain {
                    tracing::debug!(peer_addr = %client.peer_addr, "EAGAIN, flushing the queue");
                    client.queue.clear();
                    return error_tick(client, Some(kind), config);
                }
                if !from_queue {
                    park(client, fresh, config);
                }
                // a queued packet stays at the head for the next round
                return error_tick(client, Some(kind), config);
            }
        }
    }
    PumpOutcome::Keep
}

/// Append data to the client's queue, bounded, logging each transition.
fn park(client: &mut Client, data: &[u8], config: &UnicastConfig) {
    if client.queue.is_empty() {
        tracing::info!(peer_addr = %client.peer_addr, "client not ready, queuing packets");
    }
    let was_full = client.queue.is_full();
    if !client.queue.push(config.queue_max_size, data) && !was_full {
        tracing::info!(
            peer_addr = %client.peer_addr,
            queued_bytes = client.queue.bytes(),
            "client queue full, dropping new packets"
        );
    }
}

/// Record a failed round and decide whether the client has been failing
/// long enough to be dropped.
fn error_tick(
    client: &mut Client,
    kind: Option<io::ErrorKind>,
    config: &UnicastConfig,
) -> PumpOutcome {
    if let Some(kind) = kind {
        if client.last_write_error != Some(kind) {
            tracing::debug!(peer_addr = %client.peer_addr, error = ?kind, "client write error");
            client.last_write_error = Some(kind);
        }
    }
    match client.erroring_since {
        None => {
            client.erroring_since = Some(Instant::now());
            PumpOutcome::Keep
        }
        Some(since) => {
            if !config.consecutive_errors_timeout.is_zero()
                && since.elapsed() >= config.consecutive_errors_timeout
            {
                tracing::warn!(
                    peer_addr = %client.peer_addr,
                    elapsed_secs = since.elapsed().as_secs(),
                    "only write errors since too long, disconnecting client"
                );
                PumpOutcome::Evict
            } else {
                PumpOutcome::Keep
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientId;
    use crate::config::UnicastConfig;
    use crate::engine::ListenerRole;
    use std::io::Read;
    use std::net::{IpAddr, TcpStream as StdTcpStream};
    use std::time::Duration;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn pump_engine(engine: &mut UnicastEngine, channels: &mut [Channel]) {
        for _ in 0..5 {
            engine
                .poll_and_dispatch(channels, Some(Duration::from_millis(20)))
                .unwrap();
        }
    }

    /// Accept `n` connections and attach them all to channel 0.
    fn attached_clients(
        engine: &mut UnicastEngine,
        channels: &mut [Channel],
        role: ListenerRole,
        n: usize,
    ) -> (Vec<ClientId>, Vec<StdTcpStream>) {
        let token = engine.create_listening_socket(role, localhost(), 0).unwrap();
        let addr = engine.local_addr(token).unwrap();
        let mut peers = Vec::new();
        for _ in 0..n {
            peers.push(StdTcpStream::connect(addr).unwrap());
        }
        pump_engine(engine, channels);
        assert_eq!(engine.client_count(), n);
        let mut ids = Vec::new();
        let mut cursor = engine.registry.first();
        while let Some(id) = cursor {
            ids.push(id);
            cursor = engine.registry.next_of(id);
        }
        for &id in &ids {
            engine.registry.attach(id, 0, channels).unwrap();
        }
        (ids, peers)
    }

    fn read_available(peer: &mut StdTcpStream) -> Vec<u8> {
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn delivers_to_every_http_client() {
        let mut engine = UnicastEngine::new(UnicastConfig::default()).unwrap();
        let mut channels = vec![Channel::new("one", 1)];
        let (_ids, mut peers) =
            attached_clients(&mut engine, &mut channels, ListenerRole::Http, 2);

        channels[0].buf = b"payload".to_vec();
        engine.data_send(&mut channels, 0);
        for peer in peers.iter_mut() {
            let got = read_available(peer);
            let text = String::from_utf8_lossy(&got);
            assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
            assert!(text.ends_with("payload"));
        }
    }

    #[test]
    fn queued_data_goes_out_before_fresh_data() {
        let mut engine = UnicastEngine::new(UnicastConfig::default()).unwrap();
        let mut channels = vec![Channel::new("one", 1)];
        let (ids, mut peers) =
            attached_clients(&mut engine, &mut channels, ListenerRole::Http, 1);

        let bound = engine.config().queue_max_size;
        engine
            .registry
            .get_mut(ids[0])
            .unwrap()
            .queue
            .push(bound, b"older ");
        channels[0].buf = b"newer".to_vec();
        engine.data_send(&mut channels, 0);

        let got = read_available(&mut peers[0]);
        let text = String::from_utf8_lossy(&got);
        assert!(text.ends_with("older newer"));
        assert!(engine.registry.get(ids[0]).unwrap().queue.is_empty());
    }

    #[test]
    fn failing_client_does_not_affect_the_others() {
        // an RTSP client that never completed SETUP has no data socket,
        // every send on it fails
        let mut engine = UnicastEngine::new(UnicastConfig::default()).unwrap();
        let mut channels = vec![Channel::new("one", 1)];
        let (http_ids, mut http_peers) =
            attached_clients(&mut engine, &mut channels, ListenerRole::Http, 1);

        let rtsp_token = engine
            .create_listening_socket(ListenerRole::Rtsp, localhost(), 0)
            .unwrap();
        let rtsp_addr = engine.local_addr(rtsp_token).unwrap();
        let _rtsp_peer = StdTcpStream::connect(rtsp_addr).unwrap();
        pump_engine(&mut engine, &mut channels);
        assert_eq!(engine.client_count(), 2);
        let mut rtsp_id = engine.registry.first();
        while let Some(id) = rtsp_id {
            if engine.registry.get(id).unwrap().kind() == ClientKind::Rtsp {
                break;
            }
            rtsp_id = engine.registry.next_of(id);
        }
        let rtsp_id = rtsp_id.unwrap();
        assert!(!http_ids.contains(&rtsp_id));
        engine.registry.attach(rtsp_id, 0, &mut channels).unwrap();

        channels[0].buf = b"plain".to_vec();
        channels[0].rtp_buf = b"framed".to_vec();
        engine.data_send(&mut channels, 0);

        // healthy client got its data
        let text = String::from_utf8_lossy(&read_available(&mut http_peers[0])).to_string();
        assert!(text.ends_with("plain"));
        // failing client is still connected, its data went to the queue
        assert_eq!(engine.client_count(), 2);
        let failing = engine.registry.get(rtsp_id).unwrap();
        assert_eq!(failing.queue.len(), 1);
        assert!(failing.erroring_since.is_some());
    }

    #[test]
    fn erroring_client_evicted_after_timeout() {
        let config = UnicastConfig {
            consecutive_errors_timeout: Duration::from_millis(5),
            ..UnicastConfig::default()
        };
        let mut engine = UnicastEngine::new(config).unwrap();
        let mut channels = vec![Channel::new("one", 1)];

        let token = engine
            .create_listening_socket(ListenerRole::Rtsp, localhost(), 0)
            .unwrap();
        let addr = engine.local_addr(token).unwrap();
        let _peer = StdTcpStream::connect(addr).unwrap();
        pump_engine(&mut engine, &mut channels);
        let id = engine.registry.first().unwrap();
        engine.registry.attach(id, 0, &mut channels).unwrap();

        channels[0].rtp_buf = b"framed".to_vec();
        engine.data_send(&mut channels, 0);
        assert_eq!(engine.client_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        engine.data_send(&mut channels, 0);
        assert_eq!(engine.client_count(), 0);
        assert_eq!(channels[0].client_count(), 0);
    }

    #[test]
    fn full_queue_drops_new_packets_only() {
        let config = UnicastConfig {
            queue_max_size: 32,
            ..UnicastConfig::default()
        };
        let mut engine = UnicastEngine::new(config).unwrap();
        let mut channels = vec![Channel::new("one", 1)];

        let token = engine
            .create_listening_socket(ListenerRole::Rtsp, localhost(), 0)
            .unwrap();
        let addr = engine.local_addr(token).unwrap();
        let _peer = StdTcpStream::connect(addr).unwrap();
        pump_engine(&mut engine, &mut channels);
        let id = engine.registry.first().unwrap();
        engine.registry.attach(id, 0, &mut channels).unwrap();

        channels[0].rtp_buf = vec![0xAA; 20];
        engine.data_send(&mut channels, 0);
        assert_eq!(engine.registry.get(id).unwrap().queue.bytes(), 20);

        // 20 + 20 >= 32, the second round's fresh data is dropped
        engine.data_send(&mut channels, 0);
        let client = engine.registry.get(id).unwrap();
        assert_eq!(client.queue.bytes(), 20);
        assert!(client.queue.is_full());
    }
}
