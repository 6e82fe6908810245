pub mod config;
pub mod session;

pub use config::Config;
pub use session::{
    ConnectionRegistry, Error, MediaGate, NegotiationEngine, PeerState, Result, RtcTransport,
    SessionConfig, SignalingPayload, ToneCapture,
};
