//! Error types for the session core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Payload encoding failed: {0}")]
    Encoding(String),

    #[error("Malformed payload: {0}")]
    Decoding(String),

    #[error("Unsupported payload version: {0}")]
    Version(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown or expired connection token: {0}")]
    UnknownConnection(String),

    #[error("No such peer: {0}")]
    NoSuchPeer(String),

    #[error("Peer already connected: {0}")]
    Collision(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
