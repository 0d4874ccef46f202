use hashbrown::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::sync::lock;
use crate::NoteId;

pub(crate) const ACK_TIMEOUT_MESSAGE: &str = "Event status timeout";

/// Delivery receipt for one message sent to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Event id for published events, `None` for other messages
    pub id: Option<NoteId>,
    pub relay: String,
    pub sent_at: Instant,
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub(crate) fn new(
        id: Option<NoteId>,
        relay: &str,
        sent_at: Instant,
        success: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            relay: relay.to_owned(),
            sent_at,
            success,
            message: message.into(),
        }
    }
}

/// One-shot resolver for an [`Ack`]. Consumed on use, so an ack can only be
/// settled once.
#[derive(Debug)]
pub(crate) struct AckSender {
    id: Option<NoteId>,
    relay: String,
    tx: oneshot::Sender<Ack>,
}

impl AckSender {
    pub fn id(&self) -> Option<NoteId> {
        self.id
    }

    pub fn succeed(self, sent_at: Instant, message: impl Into<String>) {
        self.settle(sent_at, true, message.into());
    }

    pub fn fail(self, sent_at: Instant, message: impl Into<String>) {
        self.settle(sent_at, false, message.into());
    }

    fn settle(self, sent_at: Instant, success: bool, message: String) {
        trace!(
            "ack {:?} from {}: {} {}",
            self.id,
            self.relay,
            success,
            message
        );
        let ack = Ack::new(self.id, &self.relay, sent_at, success, message);
        // the caller may have stopped waiting
        let _ = self.tx.send(ack);
    }
}

/// Caller side of an [`Ack`]. Resolves once the relay accepted or rejected
/// the message, or it timed out.
#[derive(Debug)]
pub struct AckHandle {
    id: Option<NoteId>,
    relay: String,
    created_at: Instant,
    rx: oneshot::Receiver<Ack>,
}

impl AckHandle {
    pub(crate) fn channel(id: Option<NoteId>, relay: &str) -> (AckSender, AckHandle) {
        let (tx, rx) = oneshot::channel();
        (
            AckSender {
                id,
                relay: relay.to_owned(),
                tx,
            },
            AckHandle {
                id,
                relay: relay.to_owned(),
                created_at: Instant::now(),
                rx,
            },
        )
    }

    pub fn id(&self) -> Option<NoteId> {
        self.id
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }
}

impl Future for AckHandle {
    type Output = Ack;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(ack)) => Poll::Ready(ack),
            Poll::Ready(Err(_)) => Poll::Ready(Ack::new(
                self.id,
                &self.relay,
                self.created_at,
                false,
                "acknowledgement dropped",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingAck {
    sent_at: Instant,
    sender: AckSender,
}

/// Acks waiting for an `OK` frame, keyed by event id.
#[derive(Default)]
pub(crate) struct PendingAcks {
    entries: Mutex<HashMap<NoteId, PendingAck>>,
}

impl PendingAcks {
    pub fn insert(&self, id: NoteId, sent_at: Instant, sender: AckSender) {
        let previous = lock(&self.entries).insert(id, PendingAck { sent_at, sender });
        if let Some(previous) = previous {
            previous
                .sender
                .fail(previous.sent_at, "superseded by a resend of the same event");
        }
    }

    pub fn take(&self, id: &NoteId) -> Option<(Instant, AckSender)> {
        lock(&self.entries)
            .remove(id)
            .map(|p| (p.sent_at, p.sender))
    }

    /// Settle the ack for `id` from an `OK` frame. Returns false when nothing
    /// was waiting, e.g. because it already timed out.
    pub fn resolve(&self, id: &NoteId, success: bool, message: &str) -> bool {
        let Some((sent_at, sender)) = self.take(id) else {
            return false;
        };
        if success {
            sender.succeed(sent_at, message);
        } else {
            sender.fail(sent_at, message);
        }
        true
    }

    /// Fail every ack sent at least `timeout` before `now`.
    pub fn expire(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<PendingAck> = {
            let mut entries = lock(&self.entries);
            let ids: Vec<NoteId> = entries
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = expired.len();
        for pending in expired {
            debug!("ack timeout for {:?}", pending.sender.id());
            pending.sender.fail(pending.sent_at, ACK_TIMEOUT_MESSAGE);
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}
