//! Relay connection and subscription engine for nostr clients.
//!
//! A [`Relay`] owns one connection and serializes everything that happens
//! to it on a worker task. A [`RelayPool`] fans subscriptions and
//! publishes out to many relays and folds their per-relay EOSE, CLOSED and
//! OK signals back into one answer per subscription or event.

mod backoff;
mod client;
mod error;
mod filter;
mod keypair;
mod note;
mod pubkey;
mod relay;
mod signer;
mod subid;
mod sync;
pub mod tracker;

pub use backoff::{BackoffOptions, ExponentialBackoff};
pub use client::ClientMessage;
pub use error::Error;
pub use ewebsock;
pub use filter::Filter;
pub use keypair::FullKeypair;
pub use nostr::SecretKey;
pub use note::{Note, NoteId, UnsignedNote};
pub use pubkey::Pubkey;
pub use relay::message::{CommandResult, RelayMessage};
pub use relay::{
    Ack, AckHandle, AckPolicy, FetchOptions, FetchPolicy, ListenerId, PoolOptions, PoolRelay,
    Relay, RelayComponent, RelayLifecycleManager, RelayOptions, RelayPool, RelayStatus,
    RelaySubscriptionTracker, SubState, Subscription, Transport, TransportEvent,
    TransportFactory, TransportSink, Verdict, WebsocketTransport,
};
pub use signer::{SchnorrVerifier, Signer, Verifier};
pub use subid::{SubId, SubIdGenerator};
pub use tracker::{EventTracker, TrackerKind};

pub type Result<T> = std::result::Result<T, error::Error>;
