use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, warn};

use super::ack::AckHandle;
use crate::sync::{lock, read, write};
use crate::tracker::EventTracker;
use crate::{Error, Filter, Note, Result, SubId};

pub type ListenerId = u64;

type EventListener = Arc<dyn Fn(&Note, bool) + Send + Sync>;
type EoseListener = Arc<dyn Fn(&str, bool) + Send + Sync>;
type CloseListener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// The owner a subscription reports open and close to. Held weakly.
pub(crate) trait SubscriptionHost: Send + Sync {
    fn open_subscription(&self, sub: &Subscription) -> Vec<AckHandle>;
    fn close_subscription(&self, sub: &Subscription) -> Vec<AckHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Open,
    Closed,
}

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    events: Vec<(ListenerId, EventListener)>,
    eose: Vec<(ListenerId, EoseListener)>,
    close: Vec<(ListenerId, CloseListener)>,
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    id: SubId,
    filters: Vec<Filter>,
    tracker: Box<dyn EventTracker>,
    phase: Mutex<Phase>,
    close_reasons: Mutex<Vec<String>>,
    listeners: RwLock<Listeners>,
    eose_everywhere: AtomicBool,
    host: Option<Weak<dyn SubscriptionHost>>,
}

/// A filter set with its own duplicate tracker and listeners.
///
/// Created unopened by [`RelayPool::subscribe`](crate::RelayPool::subscribe).
/// A subscription opens at most once and cannot be reopened after it
/// closed.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("phase", &*lock(&self.inner.phase))
            .field("filters", &self.inner.filters)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: SubId,
        filters: Vec<Filter>,
        mut tracker: Box<dyn EventTracker>,
        host: Option<Weak<dyn SubscriptionHost>>,
    ) -> Self {
        tracker.tune_for(&filters);
        Self {
            inner: Arc::new(Inner {
                id,
                filters,
                tracker,
                phase: Mutex::new(Phase::New),
                close_reasons: Mutex::new(Vec::new()),
                listeners: RwLock::new(Listeners::default()),
                eose_everywhere: AtomicBool::new(false),
                host,
            }),
        }
    }

    /// A subscription that is not attached to any pool. Opening and closing
    /// only change its state.
    pub fn detached(id: SubId, filters: Vec<Filter>, tracker: Box<dyn EventTracker>) -> Self {
        Self::new(id, filters, tracker, None)
    }

    pub fn id(&self) -> &SubId {
        &self.inner.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.inner.filters
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.inner.phase) == Phase::Open
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.inner.phase) == Phase::Closed
    }

    /// Reasons collected from relays that closed this subscription, and
    /// from the client if it closed it.
    pub fn close_reasons(&self) -> Vec<String> {
        lock(&self.inner.close_reasons).clone()
    }

    /// Whether every relay has finished replaying stored events at least once.
    pub fn eose_everywhere(&self) -> bool {
        self.inner.eose_everywhere.load(Ordering::Acquire)
    }

    /// Called with each new event and whether it was replayed from storage
    /// (`true`) or arrived live.
    pub fn on_event(&self, listener: impl Fn(&Note, bool) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = write(&self.inner.listeners);
        let id = listeners.next_id();
        listeners.events.push((id, Arc::new(listener)));
        id
    }

    /// Called with the relay url on each EOSE and whether every relay is now
    /// done replaying. The flag is `true` at most once per subscription.
    pub fn on_eose(&self, listener: impl Fn(&str, bool) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = write(&self.inner.listeners);
        let id = listeners.next_id();
        listeners.eose.push((id, Arc::new(listener)));
        id
    }

    /// Called once when the subscription closes.
    pub fn on_close(&self, listener: impl Fn(&[String]) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = write(&self.inner.listeners);
        let id = listeners.next_id();
        listeners.close.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.inner.listeners);
        let before = listeners.events.len() + listeners.eose.len() + listeners.close.len();
        listeners.events.retain(|(i, _)| *i != id);
        listeners.eose.retain(|(i, _)| *i != id);
        listeners.close.retain(|(i, _)| *i != id);
        before != listeners.events.len() + listeners.eose.len() + listeners.close.len()
    }

    /// Send the subscription to every relay.
    pub fn open(&self) -> Result<Vec<AckHandle>> {
        {
            let mut phase = lock(&self.inner.phase);
            match *phase {
                Phase::New => *phase = Phase::Open,
                Phase::Open => return Err(Error::SubscriptionAlreadyOpened),
                Phase::Closed => return Err(Error::SubscriptionClosed),
            }
        }
        debug!("opening {}", self.inner.id);

        Ok(self
            .host()
            .map(|host| host.open_subscription(self))
            .unwrap_or_default())
    }

    /// Close on every relay. Does nothing unless the subscription is open.
    pub fn close(&self) -> Vec<AckHandle> {
        if !self.transition_closed() {
            return Vec::new();
        }
        debug!("closing {}", self.inner.id);
        lock(&self.inner.close_reasons).push("closed by client".to_owned());

        let acks = self
            .host()
            .map(|host| host.close_subscription(self))
            .unwrap_or_default();
        self.fire_close();
        acks
    }

    fn host(&self) -> Option<Arc<dyn SubscriptionHost>> {
        self.inner.host.as_ref().and_then(Weak::upgrade)
    }

    fn transition_closed(&self) -> bool {
        let mut phase = lock(&self.inner.phase);
        if *phase != Phase::Open {
            return false;
        }
        *phase = Phase::Closed;
        true
    }

    fn fire_close(&self) {
        let listeners: Vec<CloseListener> = read(&self.inner.listeners)
            .close
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        let reasons = self.close_reasons();
        for listener in listeners {
            listener(&reasons);
        }
    }

    /// Hand `note` to the event listeners unless the tracker saw it already.
    #[profiling::function]
    pub(crate) fn deliver_event(&self, note: &Note, stored: bool) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.inner.tracker.seen(note) {
            Ok(false) => {}
            Ok(true) => return false,
            Err(err) => {
                warn!("{}: {err}", self.inner.id);
                return false;
            }
        }

        let listeners: Vec<EventListener> = read(&self.inner.listeners)
            .events
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(note, stored);
        }
        true
    }

    pub(crate) fn dispatch_eose(&self, relay: &str, everywhere: bool) {
        // only the first transition is reported as everywhere
        let everywhere = everywhere && !self.inner.eose_everywhere.swap(true, Ordering::AcqRel);
        let listeners: Vec<EoseListener> = read(&self.inner.listeners)
            .eose
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(relay, everywhere);
        }
    }

    pub(crate) fn add_close_reason(&self, reason: impl Into<String>) {
        lock(&self.inner.close_reasons).push(reason.into());
    }

    /// Every relay closed this subscription.
    pub(crate) fn closed_by_relays(&self) {
        if self.transition_closed() {
            debug!("{} closed by every relay", self.inner.id);
            self.fire_close();
        }
    }
}
