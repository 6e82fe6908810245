//! Media gate: per-peer, per-direction control of audio flow
//!
//! Sharing and muting act on established connections only and are
//! independent of the underlying connection's liveness. The capture source
//! is acquired lazily on the first share and stays shared across peers;
//! stopping one peer never releases the device for the others.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::{Error, Result};
use super::registry::ConnectionRegistry;
use super::transport::{AudioCapture, OutboundTrack};

pub struct MediaGate {
    registry: Arc<ConnectionRegistry>,
    capture: Arc<dyn AudioCapture>,
    // Serializes acquisition so concurrent first shares cannot
    // double-acquire the device.
    shared_track: Mutex<Option<Arc<dyn OutboundTrack>>>,
}

impl MediaGate {
    pub fn new(registry: Arc<ConnectionRegistry>, capture: Arc<dyn AudioCapture>) -> Self {
        Self {
            registry,
            capture,
            shared_track: Mutex::new(None),
        }
    }

    /// Start sending local audio to a peer. Idempotent: sharing with a
    /// peer we already share with is a no-op.
    pub async fn start_sharing(&self, peer_id: &str) -> Result<()> {
        let session = self
            .registry
            .session_of(peer_id)
            .await
            .ok_or_else(|| Error::NoSuchPeer(peer_id.to_string()))?;
        if self.registry.is_sharing(peer_id).await? {
            debug!("already sharing with {}", peer_id);
            return Ok(());
        }

        let track = {
            let mut shared = self.shared_track.lock().await;
            match shared.as_ref() {
                Some(track) => track.clone(),
                None => {
                    let track = self.capture.acquire().await?;
                    *shared = Some(track.clone());
                    track
                }
            }
        };

        session.attach_outbound(track.clone()).await?;
        self.registry.set_sharing(peer_id, Some(track)).await?;
        debug!("sharing audio with {}", peer_id);
        Ok(())
    }

    /// Stop sending local audio to a peer; no-op when not sharing. The
    /// capture source itself stays acquired for the other peers.
    pub async fn stop_sharing(&self, peer_id: &str) -> Result<()> {
        let session = self
            .registry
            .session_of(peer_id)
            .await
            .ok_or_else(|| Error::NoSuchPeer(peer_id.to_string()))?;
        if !self.registry.is_sharing(peer_id).await? {
            return Ok(());
        }
        session.detach_outbound().await?;
        self.registry.set_sharing(peer_id, None).await?;
        debug!("stopped sharing audio with {}", peer_id);
        Ok(())
    }

    /// Toggle whether inbound audio from a peer is audible. Applies to the
    /// incoming track when present and is remembered for one that arrives
    /// later.
    pub async fn set_remote_muted(&self, peer_id: &str, muted: bool) -> Result<()> {
        self.registry.set_remote_muted(peer_id, muted).await
    }
}
