use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use super::session::Command;
use crate::Result;

/// Something the connection reported about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    ClosedByServer(String),
    ClosedByClient(String),
    Error(String),
}

/// Where a transport reports [`TransportEvent`]s for the connection it was
/// given in [`Transport::connect`].
///
/// Each sink is bound to one connection attempt. Events arriving through a
/// sink from an earlier attempt are discarded by the relay.
#[derive(Clone)]
pub struct TransportSink {
    generation: u64,
    commands: UnboundedSender<Command>,
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink")
            .field("generation", &self.generation)
            .finish()
    }
}

impl TransportSink {
    pub(crate) fn new(generation: u64, commands: UnboundedSender<Command>) -> Self {
        Self {
            generation,
            commands,
        }
    }

    /// Returns false once the relay is gone and nobody is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.commands
            .send(Command::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A text-frame connection to one relay.
///
/// `connect` only has to start the attempt. Completion, incoming frames and
/// closure are reported through the sink.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str, sink: TransportSink) -> Result<()>;

    async fn send(&self, text: String) -> Result<()>;

    async fn close(&self, reason: &str) -> Result<()>;
}

/// Builds the transport for a relay url.
pub type TransportFactory = Arc<dyn Fn(&str) -> Arc<dyn Transport> + Send + Sync>;
