use tokio::time::Instant;

use super::message::RelayMessage;
use super::session::Relay;
use crate::{ClientMessage, Error, Result};

/// Outcome of a lifecycle hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// Stop this step here. Later components are not consulted.
    Veto,
}

/// A pluggable observer of a relay session.
///
/// Hooks run on the relay's worker, one step at a time, in registration
/// order. The first `Veto` or `Err` ends the chain for that step. Hooks must
/// not block; use the non-blocking [`Relay::request_connect`] and
/// [`Relay::request_disconnect`] to act on the relay.
#[allow(unused_variables)]
pub trait RelayComponent: Send + Sync {
    /// A connection attempt is about to start. A veto cancels it.
    fn on_connect_request(&self, relay: &Relay) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    fn on_connect(&self, relay: &Relay) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    /// The client asked to disconnect. A veto keeps the connection.
    fn on_disconnect_request(&self, relay: &Relay, reason: &str) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    fn on_disconnect(&self, relay: &Relay, reason: &str, by_client: bool) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    /// Runs for every outbound message, connected or not. Advisory only.
    fn on_before_send(&self, relay: &Relay, msg: &ClientMessage) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    /// Runs right before a message goes on the wire. A veto resolves the ack
    /// as ignored, an error fails it.
    fn on_send(&self, relay: &Relay, msg: &ClientMessage) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    /// Inbound frames other than `OK`. A veto hides the frame from later
    /// components.
    fn on_message(&self, relay: &Relay, msg: &RelayMessage) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    /// Housekeeping tick. A veto stops future ticks until the next connect.
    fn on_tick(&self, relay: &Relay, now: Instant) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }

    fn on_error(&self, relay: &Relay, error: &Error) -> Result<Verdict> {
        Ok(Verdict::Proceed)
    }
}
