//! Capability interface to the platform's real-time transport and media stack
//!
//! The core never touches the transport directly; it consumes this narrow
//! surface. Notifications arrive as a fixed, enumerated event set over a
//! broadcast channel so the engine's reaction to each one is a plain state
//! transition rather than an ad hoc callback closure.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::error::Result;
use super::types::{Candidate, PeerState, SessionDescription, SessionRole};

/// Everything the transport can tell us about a session, after the fact
#[derive(Clone)]
pub enum TransportEvent {
    /// A locally-reachable network path was discovered
    CandidateDiscovered(Candidate),
    /// The transport will surface no further local candidates
    GatheringComplete,
    /// Connection liveness changed; observed, never commanded
    StateChanged(PeerState),
    /// The remote side started delivering an inbound audio track
    TrackArrived(Arc<dyn InboundTrack>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::CandidateDiscovered(c) => {
                f.debug_tuple("CandidateDiscovered").field(&c.candidate).finish()
            }
            TransportEvent::GatheringComplete => write!(f, "GatheringComplete"),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::TrackArrived(t) => f.debug_tuple("TrackArrived").field(&t.id()).finish(),
        }
    }
}

/// An open negotiable session with one remote peer
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()>;

    /// Subscribe to session notifications. Events are only buffered for
    /// receivers that already exist, so subscribe before committing a local
    /// description if candidate events matter.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Attach the shared capture source to this session's outbound path
    async fn attach_outbound(&self, track: Arc<dyn OutboundTrack>) -> Result<()>;
    /// Detach the outbound path; no-op when nothing is attached
    async fn detach_outbound(&self) -> Result<()>;

    /// Close the session. Idempotent: closing an already-closed session is
    /// a no-op, not an error.
    async fn close(&self) -> Result<()>;
}

/// Opens negotiable sessions; one per remote peer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(&self, role: SessionRole) -> Result<Arc<dyn SessionHandle>>;
}

/// A local audio source that can be attached to a session's outbound path
pub trait OutboundTrack: Send + Sync {
    fn id(&self) -> &str;
    /// Escape hatch for a backend to recover its own concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// An inbound audio stream delivered by the remote peer
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> &str;
    /// Gate local audibility, independent of whether the transport is
    /// still delivering the stream
    fn set_muted(&self, muted: bool);
    fn is_muted(&self) -> bool;
}

/// The local capture device. Acquisition is idempotent and shared: every
/// caller gets the same underlying source, released only on full cleanup.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn OutboundTrack>>;
}
