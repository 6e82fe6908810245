//! Connection registry: pending negotiations and established peers
//!
//! One instance owns both maps exclusively; the negotiation engine and the
//! media gate act on entries through it and never duplicate state. Pending
//! entries carry an expiry timer armed here at insert time and disarmed by
//! exactly one of take or timeout, never both.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::transport::{InboundTrack, OutboundTrack, SessionHandle};
use super::types::{PeerState, Position, SessionRole};

/// A negotiation awaiting its answer
pub struct PendingNegotiation {
    pub connection_token: String,
    pub session: Arc<dyn SessionHandle>,
    pub role: SessionRole,
    pub created_at: Instant,
    pub expires_at: Instant,
    expiry: Option<JoinHandle<()>>,
}

/// Outbound media state for one peer
#[derive(Default)]
pub struct LocalMedia {
    pub is_sharing: bool,
    pub active_track: Option<Arc<dyn OutboundTrack>>,
}

/// Inbound media state for one peer
#[derive(Default)]
pub struct RemoteMedia {
    pub is_muted: bool,
    pub incoming_track: Option<Arc<dyn InboundTrack>>,
}

/// Descriptive metadata for an established peer
#[derive(Debug, Clone)]
pub struct PeerMetadata {
    pub nickname: String,
    pub position: Option<Position>,
    pub joined_at: Instant,
    pub connection_token: String,
}

/// An established (or establishing) connection to a remote peer
pub struct PeerConnection {
    pub peer_id: String,
    pub session: Arc<dyn SessionHandle>,
    pub state: PeerState,
    pub local_media: LocalMedia,
    pub remote_media: RemoteMedia,
    pub metadata: PeerMetadata,
}

/// Point-in-time view of a peer, for status displays
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: String,
    pub nickname: String,
    pub state: PeerState,
    pub is_sharing: bool,
    pub remote_muted: bool,
    pub joined_at: Instant,
}

pub struct ConnectionRegistry {
    // Arc'd so each pending entry's expiry timer can reach the map on its
    // own; whoever removes an entry owns closing its session.
    pending: Arc<Mutex<HashMap<String, PendingNegotiation>>>,
    peers: RwLock<HashMap<String, PeerConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a pending negotiation and arm its expiry timer.
    ///
    /// Reusing a live token is a programming error (tokens are generated
    /// fresh per offer), so it is rejected rather than silently replaced.
    pub async fn add_pending(
        &self,
        connection_token: &str,
        session: Arc<dyn SessionHandle>,
        role: SessionRole,
        timeout: Duration,
    ) -> Result<()> {
        let now = Instant::now();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(connection_token) {
                return Err(Error::Collision(connection_token.to_string()));
            }
            pending.insert(
                connection_token.to_string(),
                PendingNegotiation {
                    connection_token: connection_token.to_string(),
                    session,
                    role,
                    created_at: now,
                    expires_at: now + timeout,
                    expiry: None,
                },
            );
        }

        // Arm the timer only after the entry is visible, so expiry can
        // never race an insert it cannot see.
        let map = Arc::clone(&self.pending);
        let token = connection_token.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = map.lock().await.remove(&token);
            if let Some(entry) = entry {
                info!("pending negotiation {} expired after {:?}", token, timeout);
                if let Err(e) = entry.session.close().await {
                    warn!("closing expired session: {}", e);
                }
            }
        });
        if let Some(entry) = self.pending.lock().await.get_mut(connection_token) {
            entry.expiry = Some(handle);
        } else {
            // Taken between the two locks; the timer will find nothing.
            handle.abort();
        }
        Ok(())
    }

    /// Atomically remove a pending negotiation and disarm its timer.
    ///
    /// Unknown or already-expired tokens yield `None`: the negotiation is
    /// no longer valid, which callers must not treat as retryable.
    pub async fn take_pending(&self, connection_token: &str) -> Option<PendingNegotiation> {
        let mut entry = self.pending.lock().await.remove(connection_token)?;
        if let Some(handle) = entry.expiry.take() {
            handle.abort();
        }
        debug!("took pending negotiation {}", connection_token);
        Some(entry)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Promote a session into an established peer connection.
    ///
    /// A connection is created only by successful negotiation completion;
    /// re-negotiating with a peer that is still registered is rejected.
    pub async fn add_established(
        &self,
        peer_id: &str,
        session: Arc<dyn SessionHandle>,
        metadata: PeerMetadata,
    ) -> Result<()> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(peer_id) {
            return Err(Error::Collision(peer_id.to_string()));
        }
        info!("peer {} established ({})", peer_id, metadata.nickname);
        peers.insert(
            peer_id.to_string(),
            PeerConnection {
                peer_id: peer_id.to_string(),
                session,
                state: PeerState::Connecting,
                local_media: LocalMedia::default(),
                remote_media: RemoteMedia::default(),
                metadata,
            },
        );
        Ok(())
    }

    /// Remove a peer, closing its transport session and dropping all
    /// associated media state.
    pub async fn remove(&self, peer_id: &str) -> Result<()> {
        let entry = self.peers.write().await.remove(peer_id);
        match entry {
            Some(peer) => {
                info!("removing peer {}", peer_id);
                if let Err(e) = peer.session.close().await {
                    warn!("closing session for {}: {}", peer_id, e);
                }
                Ok(())
            }
            None => Err(Error::NoSuchPeer(peer_id.to_string())),
        }
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> BTreeSet<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.read().await.get(peer_id).map(|p| p.state)
    }

    pub async fn statuses(&self) -> Vec<PeerStatus> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| PeerStatus {
                peer_id: p.peer_id.clone(),
                nickname: p.metadata.nickname.clone(),
                state: p.state,
                is_sharing: p.local_media.is_sharing,
                remote_muted: p.remote_media.is_muted,
                joined_at: p.metadata.joined_at,
            })
            .collect()
    }

    pub(crate) async fn session_of(&self, peer_id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.peers.read().await.get(peer_id).map(|p| p.session.clone())
    }

    /// Record a transport-reported liveness transition. Late events for
    /// peers already removed or closed are silently ignored.
    pub(crate) async fn set_peer_state(&self, peer_id: &str, state: PeerState) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(peer) if peer.state.is_terminal() => {
                debug!("peer {}: ignoring {} after close", peer_id, state);
            }
            Some(peer) => {
                if peer.state != state {
                    info!("peer {}: {} -> {}", peer_id, peer.state, state);
                    peer.state = state;
                }
            }
            None => debug!("state change for unknown peer {} ignored", peer_id),
        }
    }

    pub(crate) async fn set_remote_track(&self, peer_id: &str, track: Arc<dyn InboundTrack>) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(peer) => {
                // A mute requested before the track arrived still applies.
                if peer.remote_media.is_muted {
                    track.set_muted(true);
                }
                debug!("peer {}: inbound track {}", peer_id, track.id());
                peer.remote_media.incoming_track = Some(track);
            }
            None => debug!("inbound track for unknown peer {} ignored", peer_id),
        }
    }

    pub(crate) async fn set_sharing(
        &self,
        peer_id: &str,
        track: Option<Arc<dyn OutboundTrack>>,
    ) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::NoSuchPeer(peer_id.to_string()))?;
        peer.local_media.is_sharing = track.is_some();
        peer.local_media.active_track = track;
        Ok(())
    }

    pub(crate) async fn is_sharing(&self, peer_id: &str) -> Result<bool> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|p| p.local_media.is_sharing)
            .ok_or_else(|| Error::NoSuchPeer(peer_id.to_string()))
    }

    pub(crate) async fn set_remote_muted(&self, peer_id: &str, muted: bool) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::NoSuchPeer(peer_id.to_string()))?;
        peer.remote_media.is_muted = muted;
        if let Some(track) = &peer.remote_media.incoming_track {
            track.set_muted(muted);
        }
        Ok(())
    }

    /// Tear everything down: pending timers, pending sessions, peers.
    pub async fn close_all(&self) {
        let pending: Vec<PendingNegotiation> = {
            let mut map = self.pending.lock().await;
            map.drain().map(|(_, v)| v).collect()
        };
        for mut entry in pending {
            if let Some(handle) = entry.expiry.take() {
                handle.abort();
            }
            let _ = entry.session.close().await;
        }
        let peers: Vec<PeerConnection> = {
            let mut map = self.peers.write().await;
            map.drain().map(|(_, v)| v).collect()
        };
        for peer in peers {
            let _ = peer.session.close().await;
        }
    }
}
