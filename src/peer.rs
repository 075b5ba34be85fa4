use std::net::SocketAddr;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use service::{channel::Tx, now_ms};

use crate::useragent::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Client,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    Closing,
}

/// One connected duplex channel.
///
/// Created on accept, destroyed when the channel closes or the peer is
/// evicted. The `session_id` pointer mirrors the authoritative membership in
/// the session registry.
#[derive(Clone)]
pub struct Peer {
    pub id: String,
    pub sender: Tx,
    pub session_id: Option<String>,
    pub role: Role,
    pub status: PeerStatus,
    pub connected_at: u64,
    pub last_seen: u64,
    pub last_ping: u64,
    pub remote_addr: SocketAddr,
    pub fingerprint: Fingerprint,
    pub locale: Option<String>,
    pub app_version: Option<String>,
    /// Opaque identity markers, used only for same identity peer discovery.
    pub wallet: Option<String>,
    pub machine_id: Option<String>,
    /// Subdomain prefix from the upgrade request's Host header; hosts may
    /// use it to auto select their link id.
    pub subdomain_hint: Option<String>,
}

impl Peer {
    pub fn new(
        id: String,
        sender: Tx,
        remote_addr: SocketAddr,
        fingerprint: Fingerprint,
        subdomain_hint: Option<String>,
    ) -> Self {
        let now = now_ms();

        Self {
            id,
            sender,
            session_id: None,
            role: Role::Unknown,
            status: PeerStatus::Connected,
            connected_at: now,
            last_seen: now,
            last_ping: now,
            remote_addr,
            fingerprint,
            locale: None,
            app_version: None,
            wallet: None,
            machine_id: None,
            subdomain_hint,
        }
    }
}

/// All currently connected peers, keyed by connection id.
#[derive(Default)]
pub struct PeerTable(RwLock<AHashMap<String, Peer>>);

impl PeerTable {
    pub fn insert(&self, peer: Peer) {
        self.0.write().insert(peer.id.clone(), peer);
    }

    pub fn remove(&self, id: &str) -> Option<Peer> {
        self.0.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.0.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn list(&self) -> Vec<Peer> {
        self.0.read().values().cloned().collect()
    }

    pub fn with<R>(&self, id: &str, handle: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.0.write().get_mut(id).map(handle)
    }

    /// queue a frame onto the peer's writer, false when the peer is gone.
    pub fn send_to(&self, id: &str, body: String) -> bool {
        match self.0.read().get(id) {
            Some(peer) => peer.sender.send(body),
            None => false,
        }
    }

    /// ask the peer's writer to close the socket.
    pub fn close(&self, id: &str) -> bool {
        match self.0.write().get_mut(id) {
            Some(peer) => {
                peer.status = PeerStatus::Closing;
                peer.sender.close()
            }
            None => false,
        }
    }

    /// peers silent for longer than `timeout_ms`, candidates for eviction.
    pub fn idle(&self, timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        self.0
            .read()
            .values()
            .filter(|it| now.saturating_sub(it.last_seen) > timeout_ms)
            .map(|it| it.id.clone())
            .collect()
    }
}
