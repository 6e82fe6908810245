//! Pairwise audio connections without a signaling server
//!
//! One peer packages an offer into a shareable link, the other decodes it
//! and produces an answer token, and the first ingests that token to
//! complete the handshake. The humans are the signaling channel:
//! - Offerer: `create_offer` -> link, later `complete_connection`
//! - Answerer: `parse_shareable_link` + `process_offer` -> answer token

mod engine;
mod error;
mod media;
mod payload;
mod registry;
mod rtc;
mod transport;
mod types;


pub use engine::NegotiationEngine;
pub use error::{Error, Result};
pub use media::MediaGate;
pub use payload::{
    build_shareable_link, decode, encode, parse_shareable_link, PayloadKind, SignalingPayload,
};
pub use registry::{ConnectionRegistry, PeerMetadata, PeerStatus, PendingNegotiation};
pub use rtc::{RtcTransport, ToneCapture};
pub use transport::{
    AudioCapture, InboundTrack, OutboundTrack, SessionHandle, Transport, TransportEvent,
};
pub use types::{
    generate_id, generate_peer_id, generate_token, Candidate, DescriptionKind, LocalIdentity,
    PayloadMeta, PeerState, Position, SessionConfig, SessionDescription, SessionRole,
    PAYLOAD_VERSION,
};
