//! Signaling payload codec
//!
//! Payloads travel out-of-band, relayed by the users themselves: offers
//! inside a shareable link fragment, answers as a bare token pasted back
//! through any side channel. The wire form is canonical JSON, DEFLATE
//! compressed, base64url without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{Error, Result};
use super::types::{Candidate, PayloadMeta, SessionDescription, PAYLOAD_VERSION};

/// Marker prefix of the link fragment carrying an offer
const FRAGMENT_KEY: &str = "offer=";

/// What a payload is: one side of the two-step exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Offer,
    Answer,
}

/// The envelope exchanged out-of-band to perform one negotiation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingPayload {
    pub version: u32,
    pub kind: PayloadKind,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub nickname: String,
    pub timestamp: u64,
    #[serde(rename = "sessionDescription")]
    pub session_description: SessionDescription,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Correlates an answer with the offer's pending entry; answers only
    #[serde(
        rename = "connectionToken",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub metadata: PayloadMeta,
}

impl SignalingPayload {
    pub fn offer(
        peer_id: &str,
        nickname: &str,
        description: SessionDescription,
        candidates: Vec<Candidate>,
        metadata: PayloadMeta,
    ) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            kind: PayloadKind::Offer,
            peer_id: peer_id.to_string(),
            nickname: nickname.to_string(),
            timestamp: unix_now(),
            session_description: description,
            candidates,
            connection_token: None,
            metadata,
        }
    }

    pub fn answer(
        peer_id: &str,
        nickname: &str,
        connection_token: &str,
        description: SessionDescription,
        candidates: Vec<Candidate>,
        metadata: PayloadMeta,
    ) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            kind: PayloadKind::Answer,
            peer_id: peer_id.to_string(),
            nickname: nickname.to_string(),
            timestamp: unix_now(),
            session_description: description,
            candidates,
            connection_token: Some(connection_token.to_string()),
            metadata,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serialize, compress and base64url-encode a payload.
///
/// `max_len` bounds the resulting token; exceeding it is a hard contract
/// failure the caller must surface before handing anything to the user.
pub fn encode(payload: &SignalingPayload, max_len: usize) -> Result<String> {
    let token = encode_unchecked(payload)?;
    if token.len() > max_len {
        return Err(Error::Encoding(format!(
            "token is {} chars, limit is {}",
            token.len(),
            max_len
        )));
    }
    Ok(token)
}

fn encode_unchecked(payload: &SignalingPayload) -> Result<String> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| Error::Encoding(format!("serialize: {}", e)))?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&json)
        .map_err(|e| Error::Encoding(format!("compress: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Encoding(format!("compress: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(compressed))
}

/// Decode and structurally validate a payload token.
///
/// Staleness (expired offers) is not checked here; that is the negotiation
/// engine's concern.
pub fn decode(token: &str) -> Result<SignalingPayload> {
    let compressed = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| Error::Decoding(format!("base64: {}", e)))?;
    let mut json = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| Error::Decoding(format!("inflate: {}", e)))?;

    // Version gate first, so a schema bump reports as such rather than as
    // an unknown-field parse failure.
    let value: serde_json::Value =
        serde_json::from_slice(&json).map_err(|e| Error::Decoding(format!("json: {}", e)))?;
    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Decoding("missing version".to_string()))?;
    if version != u64::from(PAYLOAD_VERSION) {
        return Err(Error::Version(version as u32));
    }

    let payload: SignalingPayload = serde_json::from_value(value)
        .map_err(|e| Error::Decoding(format!("structure: {}", e)))?;

    match (payload.kind, payload.connection_token.as_deref()) {
        (PayloadKind::Answer, None) => {
            return Err(Error::Decoding(
                "answer payload without connectionToken".to_string(),
            ))
        }
        (PayloadKind::Answer, Some("")) => {
            return Err(Error::Decoding(
                "answer payload with empty connectionToken".to_string(),
            ))
        }
        (PayloadKind::Offer, Some(_)) => {
            return Err(Error::Decoding(
                "offer payload must not carry connectionToken".to_string(),
            ))
        }
        _ => {}
    }

    Ok(payload)
}

/// Compose the full shareable link: `<base>#offer=<token>:<encodedPayload>`.
///
/// The length budget applies to the whole link, not just the payload part.
pub fn build_shareable_link(
    base: &str,
    connection_token: &str,
    payload: &SignalingPayload,
    max_len: usize,
) -> Result<String> {
    let encoded = encode_unchecked(payload)?;
    let link = format!("{}#{}{}:{}", base, FRAGMENT_KEY, connection_token, encoded);
    if link.len() > max_len {
        return Err(Error::Encoding(format!(
            "link is {} chars, limit is {}",
            link.len(),
            max_len
        )));
    }
    Ok(link)
}

/// Best-effort inverse of [`build_shareable_link`].
///
/// Used at page-load time where absence of an offer fragment is normal, so
/// any input not matching the expected shape yields `None`, never an error.
pub fn parse_shareable_link(link: &str) -> Option<(String, SignalingPayload)> {
    let fragment = link.split_once('#').map(|(_, f)| f).unwrap_or(link);
    let rest = fragment.strip_prefix(FRAGMENT_KEY)?;
    let (token, encoded) = rest.split_once(':')?;
    if token.is_empty() {
        return None;
    }
    let payload = decode(encoded).ok()?;
    Some((token.to_string(), payload))
}
