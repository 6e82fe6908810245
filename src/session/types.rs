//! Identities, descriptions, candidates and shared configuration

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current signaling payload schema revision
pub const PAYLOAD_VERSION: u32 = 1;

/// Generate a random identifier for peers and connection tokens
pub fn generate_id(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap())
        .collect()
}

/// Stable random identifier for the local peer (one per process lifetime)
pub fn generate_peer_id() -> String {
    generate_id(30)
}

/// Short correlation token for a single offer/answer exchange
pub fn generate_token() -> String {
    generate_id(12)
}

/// Which half of the exchange a session description carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Opaque negotiated-capabilities blob produced by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

/// Opaque descriptor of a network path the local endpoint may be reachable on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub username_fragment: Option<String>,
}

/// Role a session was opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Offerer,
    Answerer,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Offerer => write!(f, "offerer"),
            SessionRole::Answerer => write!(f, "answerer"),
        }
    }
}

/// Lifecycle state of a peer connection, driven by transport notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Closed is terminal; no transition leaves it
    pub fn is_terminal(self) -> bool {
        self == PeerState::Closed
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Position of a peer in the shared room, carried as opaque metadata
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Extensible metadata attached to every signaling payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PayloadMeta {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub capabilities: BTreeSet<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PayloadMeta {
    pub fn audio() -> Self {
        Self {
            position: None,
            capabilities: BTreeSet::from(["audio".to_string()]),
            extra: BTreeMap::new(),
        }
    }
}

/// Who the local side is, as advertised in outgoing payloads
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub nickname: String,
    pub metadata: PayloadMeta,
}

impl LocalIdentity {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            peer_id: generate_peer_id(),
            nickname: nickname.into(),
            metadata: PayloadMeta::audio(),
        }
    }
}

/// Tunables for negotiation and link encoding
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL the shareable link is built on
    pub link_base: String,
    /// Hard budget for the full shareable link (and answer tokens)
    pub max_link_len: usize,
    /// How long an un-answered offer stays pending, in milliseconds
    pub pending_timeout_ms: u64,
    /// Bounded wait for local reachability candidates, in milliseconds
    pub gather_timeout_ms: u64,
    /// How long an established entry may sit in Connecting before it is dropped
    pub connecting_timeout_ms: u64,
    /// STUN servers handed to the transport for NAT traversal
    pub stun_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link_base: "https://earshot.chat".to_string(),
            max_link_len: 2000,
            pending_timeout_ms: 60_000,
            gather_timeout_ms: 3_000,
            connecting_timeout_ms: 60_000,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.cloudflare.com:3478".to_string(),
            ],
        }
    }
}
