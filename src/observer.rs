use std::sync::Arc;

use service::session::{Session, SessionHandler};
use tokio::sync::mpsc::UnboundedSender;

use crate::peer::{PeerTable, Role};

/// Receives registry callbacks and performs the I/O the registry must not:
/// closing evicted peers' channels and queueing attached domains for
/// release. Domain release reaches the exec channel, so it is handed to an
/// async worker instead of being done on the reaper thread.
pub struct Observer {
    peers: Arc<PeerTable>,
    domain_gc: UnboundedSender<String>,
}

impl Observer {
    pub fn new(peers: Arc<PeerTable>, domain_gc: UnboundedSender<String>) -> Self {
        Self { peers, domain_gc }
    }
}

impl SessionHandler for Observer {
    fn session_destroyed(&self, session: Session) {
        for peer_id in session.peers() {
            self.peers.with(peer_id, |peer| {
                peer.session_id = None;
                peer.role = Role::Unknown;
            });
            self.peers.close(peer_id);
        }

        for domain_id in session.domains {
            if self.domain_gc.send(domain_id).is_err() {
                log::warn!("domain release worker is gone");
            }
        }
    }
}
