//! UDP broadcast transport.
//!
//! Each datagram carries one framed [`RelayMessage`]. Frames we sent
//! ourselves and hear again (broadcast loopback) are dropped by id.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::UdpTransportConfig;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::peer::{EndpointInfo, PeerInfo};
use crate::transport::{Transport, TransportCore, TransportKind};
use crate::wire::{RelayMessage, FRAME_HEADER_LEN};

pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    core: TransportCore,
    config: UdpTransportConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    sent_ids: Mutex<LruCache<String, ()>>,
    /// Most recently heard neighbours, capped at `peer_cache` entries.
    peers: Mutex<LruCache<SocketAddr, PeerInfo>>,
}

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> Self {
        let echo_cap = NonZeroUsize::new(config.echo_cache).unwrap_or(NonZeroUsize::MIN);
        let peer_cap = NonZeroUsize::new(config.peer_cache).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(UdpInner {
                core: TransportCore::new(config.id.clone(), TransportKind::Udp),
                config,
                socket: Mutex::new(None),
                recv_task: Mutex::new(None),
                sent_ids: Mutex::new(LruCache::new(echo_cap)),
                peers: Mutex::new(LruCache::new(peer_cap)),
            }),
        }
    }

    /// Bound address while active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket().and_then(|s| s.local_addr().ok())
    }
}

impl UdpInner {
    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn remember_sent(&self, id: &str) {
        self.sent_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(id.to_owned(), ());
    }

    fn is_own_echo(&self, id: &str) -> bool {
        self.sent_ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    /// Record the sender of `msg` as a neighbour. The previous relay is the
    /// last history entry; a first-hop message names its origin node in `from`.
    fn learn_peer(&self, src: SocketAddr, msg: &RelayMessage) {
        let node = msg
            .visited()
            .last()
            .map(str::to_owned)
            .or_else(|| msg.from.split_once('@').map(|(_, node)| node.to_owned()));
        let Some(node) = node else { return };

        let mut peers = self.peers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(known) = peers.get_mut(&src) {
            known.last_seen = crate::now_secs();
            known.node_id = node;
            return;
        }
        let peer = PeerInfo::new(node, EndpointInfo::Ip(src), TransportKind::Udp);
        if let Some((evicted, old)) = peers.push(src, peer.clone()) {
            trace!(transport_id = %self.core.id(), %evicted, node = %old.node_id, "peer evicted");
        }
        drop(peers);
        debug!(transport_id = %self.core.id(), %src, node = %peer.node_id, "new udp peer");
        self.core.announce_peer(peer);
    }

    async fn handle_datagram(&self, packet: &[u8], src: SocketAddr) {
        let max_payload = self.config.max_packet_size.saturating_sub(FRAME_HEADER_LEN);
        let msg = match RelayMessage::decode_frame(packet, max_payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.core.metrics().record_error();
                debug!(transport_id = %self.core.id(), %src, "dropping datagram: {e}");
                return;
            }
        };
        if self.is_own_echo(&msg.id) {
            trace!(transport_id = %self.core.id(), message_id = %msg.id, "own echo");
            return;
        }
        self.learn_peer(src, &msg);
        self.core.deliver(msg.to_envelope(), packet.len()).await;
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.config.max_packet_size];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, src)) => tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.handle_datagram(&buf[..n], src) => {}
                    },
                    Err(e) => {
                        self.core.metrics().record_error();
                        warn!(transport_id = %self.core.id(), "udp receive failed: {e}");
                    }
                },
            }
        }
        debug!(transport_id = %self.core.id(), "udp receive loop finished");
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn core(&self) -> &TransportCore {
        &self.inner.core
    }

    async fn on_start(&self, cancel: CancellationToken) -> Result<(), TransportError> {
        let inner = &self.inner;
        let id = inner.core.id().to_owned();
        let start_err = |reason: String| TransportError::Start {
            transport_id: id.clone(),
            reason,
        };

        inner.config.resolved_target()?;
        let socket = UdpSocket::bind(inner.config.bind_addr())
            .await
            .map_err(|e| start_err(format!("bind {}: {e}", inner.config.bind_addr())))?;
        socket
            .set_broadcast(inner.config.broadcast)
            .map_err(|e| start_err(format!("set_broadcast: {e}")))?;
        let socket = Arc::new(socket);
        let local = socket.local_addr()?;

        *inner.socket.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&socket));
        let task = tokio::spawn(Arc::clone(inner).recv_loop(socket, cancel));
        *inner.recv_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);

        info!(
            transport_id = %id,
            %local,
            broadcast = inner.config.broadcast,
            "udp transport bound"
        );
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), TransportError> {
        let task = self.inner.recv_task.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.inner.socket.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.await.map_err(|e| TransportError::Stop {
                transport_id: self.inner.core.id().to_owned(),
                reason: format!("receive task: {e}"),
            })?;
        }
        Ok(())
    }

    async fn transmit(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let inner = &self.inner;
        let socket = inner
            .socket()
            .ok_or_else(|| TransportError::NotActive(inner.core.id().to_owned()))?;
        let msg = RelayMessage::from_envelope(envelope)?;
        let frame = msg.encode_frame()?;
        if frame.len() > inner.config.max_packet_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max: inner.config.max_packet_size,
            });
        }

        let target = inner.config.resolved_target()?;
        inner.remember_sent(&msg.id);
        let written = socket.send_to(&frame, target).await?;
        if written != frame.len() {
            return Err(TransportError::Send {
                message_id: msg.id,
                reason: format!("short write: {written} of {} bytes", frame.len()),
            });
        }
        trace!(
            transport_id = %inner.core.id(),
            message_id = %msg.id,
            %target,
            bytes = written,
            "udp frame sent"
        );
        Ok(written)
    }

    async fn discover_peers(&self) -> Result<Vec<PeerInfo>, TransportError> {
        let peers = self.inner.peers.lock().unwrap_or_else(|p| p.into_inner());
        Ok(peers.iter().map(|(_, peer)| peer.clone()).collect())
    }
}
