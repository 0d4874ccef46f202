use std::array::TryFromSliceError;
use thiserror::Error;

use crate::NoteId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("message is empty")]
    Empty,

    #[error("decoding failed: {0}")]
    DecodeFailed(String),

    #[error("hex decoding failed")]
    HexDecodeFailed,

    #[error("invalid byte size")]
    InvalidByteSize,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("subscription already opened")]
    SubscriptionAlreadyOpened,

    #[error("subscription is closed")]
    SubscriptionClosed,

    #[error("relay is not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("component error: {0}")]
    Component(String),

    #[error("duplicate event {0}")]
    DuplicateEvent(NoteId),

    #[error("publish failed: {}", .0.join("; "))]
    Publish(Vec<String>),

    #[error("relay worker has shut down")]
    RelayShutdown,

    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_e: TryFromSliceError) -> Self {
        Error::InvalidByteSize
    }
}

impl From<hex::FromHexError> for Error {
    fn from(_e: hex::FromHexError) -> Self {
        Error::HexDecodeFailed
    }
}

impl From<nostr::secp256k1::Error> for Error {
    fn from(e: nostr::secp256k1::Error) -> Self {
        match e {
            nostr::secp256k1::Error::InvalidSignature => Error::InvalidSignature,
            nostr::secp256k1::Error::InvalidPublicKey => Error::InvalidPublicKey,
            other => Error::Generic(other.to_string()),
        }
    }
}
