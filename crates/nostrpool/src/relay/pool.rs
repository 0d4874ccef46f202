use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::ack::{Ack, AckHandle};
use super::component::{RelayComponent, Verdict};
use super::lifecycle::RelayLifecycleManager;
use super::message::RelayMessage;
use super::session::{Relay, RelayOptions};
use super::sub_tracker::RelaySubscriptionTracker;
use super::subscription::{ListenerId, Subscription, SubscriptionHost};
use super::transport::{Transport, TransportFactory};
use super::websocket::WebsocketTransport;
use crate::subid::SubIdGenerator;
use crate::sync::{read, write};
use crate::tracker::TrackerKind;
use crate::{ClientMessage, Error, Filter, Note, Result, SubId};

type NoticeListener = Arc<dyn Fn(&str, &str, Option<&Error>) + Send + Sync>;

/// When a publish counts as done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// One relay accepted.
    #[default]
    Any,
    /// Every relay accepted.
    All,
    /// More than half of the relays accepted.
    Quorum,
}

impl AckPolicy {
    /// `Some(accepted)` once the outcome can no longer change.
    fn decide(self, total: usize, accepted: usize, rejected: usize) -> Option<bool> {
        match self {
            Self::Any if accepted > 0 => Some(true),
            Self::Any if rejected == total => Some(false),
            Self::All if rejected > 0 => Some(false),
            Self::All if accepted == total => Some(true),
            Self::Quorum if accepted * 2 > total => Some(true),
            Self::Quorum if rejected * 2 >= total => Some(false),
            _ if accepted + rejected == total => Some(false),
            _ => None,
        }
    }
}

/// When a fetch stops collecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Every relay finished replaying stored events.
    #[default]
    AllEose,
    /// `count` events arrived, or optionally every relay sent EOSE.
    WaitForEvents { count: usize, end_on_eose: bool },
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub policy: FetchPolicy,
    pub tracker: TrackerKind,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            policy: FetchPolicy::default(),
            tracker: TrackerKind::Naive,
        }
    }
}

impl FetchOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn tracker(mut self, tracker: TrackerKind) -> Self {
        self.tracker = tracker;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub relay: RelayOptions,
    /// Idle time before a relay without subscriptions is disconnected.
    pub keep_alive: Duration,
    pub tracker: TrackerKind,
    pub fetch_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            relay: RelayOptions::default(),
            keep_alive: Duration::from_secs(120),
            tracker: TrackerKind::default(),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// A relay together with the components the pool attached to it.
#[derive(Clone)]
pub struct PoolRelay {
    pub relay: Relay,
    pub tracker: Arc<RelaySubscriptionTracker>,
    pub lifecycle: Arc<RelayLifecycleManager>,
    components: Vec<Arc<dyn RelayComponent>>,
}

impl fmt::Debug for PoolRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRelay")
            .field("relay", &self.relay)
            .field("active_subs", &self.tracker.active_count())
            .finish()
    }
}

impl PoolRelay {
    fn attach(relay: Relay, pool: Weak<PoolInner>, keep_alive: Duration) -> Self {
        let tracker = Arc::new(RelaySubscriptionTracker::new());
        let lifecycle = Arc::new(RelayLifecycleManager::new(keep_alive));
        let hook = Arc::new(PoolRelayHook {
            pool,
            tracker: tracker.clone(),
        });

        // tracker first, so the pool sees up to date relay state
        let components: Vec<Arc<dyn RelayComponent>> = vec![
            tracker.clone() as Arc<dyn RelayComponent>,
            lifecycle.clone() as Arc<dyn RelayComponent>,
            hook as Arc<dyn RelayComponent>,
        ];
        for component in &components {
            relay.add_component(component.clone());
        }

        Self {
            relay,
            tracker,
            lifecycle,
            components,
        }
    }

    fn detach(&self) {
        for component in &self.components {
            self.relay.remove_component(component);
        }
    }
}

struct PoolInner {
    relays: RwLock<Vec<PoolRelay>>,
    subscriptions: RwLock<HashMap<SubId, Subscription>>,
    notice_listeners: RwLock<Vec<(ListenerId, NoticeListener)>>,
    next_listener: AtomicU64,
    ids: SubIdGenerator,
    options: PoolOptions,
    transport: TransportFactory,
}

impl PoolInner {
    fn relay_snapshot(&self) -> Vec<PoolRelay> {
        read(&self.relays).clone()
    }

    fn subscription(&self, id: &SubId) -> Option<Subscription> {
        read(&self.subscriptions).get(id).cloned()
    }

    fn broadcast(&self, msg: &ClientMessage) -> Vec<AckHandle> {
        self.relay_snapshot()
            .iter()
            .map(|r| r.relay.send(msg.clone()))
            .collect()
    }

    /// No relay is still replaying stored events for `id`.
    fn eose_everywhere(&self, id: &SubId) -> bool {
        self.relay_snapshot()
            .iter()
            .all(|r| !r.tracker.is_awaiting_eose(id))
    }

    fn closed_everywhere(&self, id: &SubId) -> bool {
        self.relay_snapshot().iter().all(|r| !r.tracker.is_active(id))
    }

    fn notify(&self, relay: &str, message: &str, error: Option<&Error>) {
        let listeners: Vec<NoticeListener> = read(&self.notice_listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(relay, message, error);
        }
    }

    fn resubscribe(&self, relay: &Relay) {
        let open: Vec<Subscription> = read(&self.subscriptions)
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect();
        if !open.is_empty() {
            debug!("resubscribing {} subscriptions on {}", open.len(), relay.url());
        }
        for sub in open {
            // an already active REQ is vetoed by the relay's tracker
            let _ = relay.send(ClientMessage::req(sub.id().clone(), sub.filters().to_vec()));
        }
    }

    fn relay_dropped(&self, relay: &Relay) {
        let open: Vec<Subscription> = read(&self.subscriptions)
            .values()
            .filter(|s| s.is_open() && !s.eose_everywhere())
            .cloned()
            .collect();
        let relays = self.relay_snapshot();
        for sub in open {
            let id = sub.id();
            let tracked = relays.iter().any(|r| r.tracker.is_active(id));
            if tracked && self.eose_everywhere(id) {
                sub.dispatch_eose(relay.url(), true);
            }
        }
    }

    #[profiling::function]
    fn route(&self, relay: &Relay, tracker: &RelaySubscriptionTracker, msg: &RelayMessage) {
        match msg {
            RelayMessage::Event(id, note) => {
                let Some(sub) = self.subscription(id) else {
                    debug!("event for unknown subscription {} from {}", id, relay.url());
                    return;
                };
                let stored = tracker.is_awaiting_eose(id);
                sub.deliver_event(note, stored);
            }
            RelayMessage::Eose(id) => {
                let Some(sub) = self.subscription(id) else {
                    return;
                };
                sub.dispatch_eose(relay.url(), self.eose_everywhere(id));
            }
            RelayMessage::Closed(id, reason) => {
                let Some(sub) = self.subscription(id) else {
                    return;
                };
                info!("{} closed {}: {}", relay.url(), id, reason);
                sub.add_close_reason(format!("{}: {}", relay.url(), reason));
                if self.closed_everywhere(id)
                    && write(&self.subscriptions).remove(id).is_some()
                {
                    sub.closed_by_relays();
                }
            }
            RelayMessage::Notice(notice) => {
                info!("notice from {}: {}", relay.url(), notice);
                self.notify(relay.url(), notice, None);
            }
            RelayMessage::OK(_) => {}
        }
    }
}

impl SubscriptionHost for PoolInner {
    fn open_subscription(&self, sub: &Subscription) -> Vec<AckHandle> {
        self.broadcast(&ClientMessage::req(sub.id().clone(), sub.filters().to_vec()))
    }

    fn close_subscription(&self, sub: &Subscription) -> Vec<AckHandle> {
        write(&self.subscriptions).remove(sub.id());
        self.broadcast(&ClientMessage::close(sub.id().clone()))
    }
}

/// Routes one relay's traffic into the pool.
struct PoolRelayHook {
    pool: Weak<PoolInner>,
    tracker: Arc<RelaySubscriptionTracker>,
}

impl RelayComponent for PoolRelayHook {
    fn on_connect(&self, relay: &Relay) -> Result<Verdict> {
        if let Some(pool) = self.pool.upgrade() {
            pool.resubscribe(relay);
        }
        Ok(Verdict::Proceed)
    }

    fn on_disconnect(&self, relay: &Relay, _reason: &str, _by_client: bool) -> Result<Verdict> {
        if let Some(pool) = self.pool.upgrade() {
            pool.relay_dropped(relay);
        }
        Ok(Verdict::Proceed)
    }

    fn on_message(&self, relay: &Relay, msg: &RelayMessage) -> Result<Verdict> {
        if let Some(pool) = self.pool.upgrade() {
            pool.route(relay, &self.tracker, msg);
        }
        Ok(Verdict::Proceed)
    }

    fn on_error(&self, relay: &Relay, error: &Error) -> Result<Verdict> {
        if let Some(pool) = self.pool.upgrade() {
            pool.notify(relay.url(), &error.to_string(), Some(error));
        }
        Ok(Verdict::Proceed)
    }
}

enum FetchSignal {
    Event(Note),
    Eose,
    Closed,
}

/// A set of relays sharing one subscription registry.
///
/// Cloning is cheap. Subscriptions are sent to every relay in the pool and
/// relays added later receive the open ones when they connect.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.urls())
            .field("subscriptions", &read(&self.inner.subscriptions).len())
            .finish()
    }
}

impl RelayPool {
    pub fn new() -> Self {
        Self::with_options(PoolOptions::default())
    }

    pub fn with_options(options: PoolOptions) -> Self {
        Self::with_transport(
            options,
            Arc::new(|_: &str| Arc::new(WebsocketTransport::default()) as Arc<dyn Transport>),
        )
    }

    /// A pool whose relays connect through transports built by `transport`.
    pub fn with_transport(options: PoolOptions, transport: TransportFactory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                relays: RwLock::new(Vec::new()),
                subscriptions: RwLock::new(HashMap::new()),
                notice_listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                ids: SubIdGenerator::default(),
                options,
                transport,
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn has(&self, url: &str) -> bool {
        let url = Self::canonicalize_url(url);
        read(&self.inner.relays).iter().any(|r| r.relay.url() == url)
    }

    pub fn urls(&self) -> BTreeSet<String> {
        read(&self.inner.relays)
            .iter()
            .map(|r| r.relay.url().to_owned())
            .collect()
    }

    pub fn relays(&self) -> Vec<Relay> {
        read(&self.inner.relays)
            .iter()
            .map(|r| r.relay.clone())
            .collect()
    }

    pub fn relay(&self, url: &str) -> Option<PoolRelay> {
        let url = Self::canonicalize_url(url);
        read(&self.inner.relays)
            .iter()
            .find(|r| r.relay.url() == url)
            .cloned()
    }

    /// Add a relay by url without connecting. Returns the existing relay if
    /// the url is already in the pool.
    pub fn add_url(&self, url: &str) -> Result<Relay> {
        let url = Self::canonicalize_url(url);
        if let Some(existing) = self.relay(&url) {
            return Ok(existing.relay);
        }
        let transport = (self.inner.transport)(&url);
        let relay = Relay::new(url, transport, self.inner.options.relay.clone())?;
        self.add_relay(relay.clone())?;
        Ok(relay)
    }

    pub fn add_relay(&self, relay: Relay) -> Result<()> {
        let mut relays = write(&self.inner.relays);
        if relays.iter().any(|r| r.relay == relay) {
            return Err(Error::Config(format!("{} is already in the pool", relay.url())));
        }
        let pool_relay = PoolRelay::attach(
            relay,
            Arc::downgrade(&self.inner),
            self.inner.options.keep_alive,
        );
        relays.push(pool_relay);
        Ok(())
    }

    /// Add `url` if needed and wait for it to connect.
    pub async fn connect_relay(&self, url: &str) -> Result<Relay> {
        let relay = self.add_url(url)?;
        relay.connect().await?;
        Ok(relay)
    }

    /// Take a relay out of the pool. The relay stays connected; its pool
    /// components are removed.
    pub fn remove_relay(&self, url: &str) -> Option<Relay> {
        let url = Self::canonicalize_url(url);
        let removed = {
            let mut relays = write(&self.inner.relays);
            let index = relays.iter().position(|r| r.relay.url() == url)?;
            relays.remove(index)
        };
        removed.detach();
        Some(removed.relay)
    }

    /// Called with the relay url and text of every NOTICE, and of relay
    /// errors together with the error.
    pub fn add_notice_listener(
        &self,
        listener: impl Fn(&str, &str, Option<&Error>) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        write(&self.inner.notice_listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false if no listener had this id.
    pub fn remove_notice_listener(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.inner.notice_listeners);
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }

    pub fn subscribe(&self, filters: Vec<Filter>) -> Subscription {
        let kind = self.inner.options.tracker.clone();
        self.subscribe_with(filters, &kind)
    }

    /// Register a new unopened subscription using the given tracker.
    pub fn subscribe_with(&self, filters: Vec<Filter>, tracker: &TrackerKind) -> Subscription {
        let id = self.inner.ids.next("subscription");
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let host: Weak<dyn SubscriptionHost> = pool;
        let sub = Subscription::new(id.clone(), filters, tracker.build(), Some(host));
        write(&self.inner.subscriptions).insert(id, sub.clone());
        sub
    }

    pub fn subscription(&self, id: &SubId) -> Option<Subscription> {
        self.inner.subscription(id)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        read(&self.inner.subscriptions).values().cloned().collect()
    }

    /// Publish to every relay. Succeeds once any relay accepts.
    pub async fn send(&self, note: Note) -> Result<Vec<Ack>> {
        self.publish_with(note, AckPolicy::Any).await
    }

    pub async fn publish(&self, note: Note) -> Result<Vec<Ack>> {
        self.publish_with(note, AckPolicy::Any).await
    }

    /// Publish to every relay and wait until `policy` is decided. Returns
    /// the acks collected so far, or every relay's failure message.
    pub async fn publish_with(&self, note: Note, policy: AckPolicy) -> Result<Vec<Ack>> {
        let handles = self.inner.broadcast(&ClientMessage::event(note));
        let total = handles.len();
        if total == 0 {
            return Err(Error::Publish(vec!["no relays to publish to".to_owned()]));
        }

        let mut pending = JoinSet::new();
        for handle in handles {
            pending.spawn(handle);
        }

        let mut acks = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut accepted = 0;
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(ack) if ack.success => {
                    accepted += 1;
                    acks.push(ack);
                }
                Ok(ack) => {
                    errors.push(format!("{}: {}", ack.relay, ack.message));
                    acks.push(ack);
                }
                Err(err) => errors.push(err.to_string()),
            }

            match policy.decide(total, accepted, errors.len()) {
                Some(true) => return Ok(acks),
                Some(false) => {
                    warn!("publish failed ({:?}): {}", policy, errors.join("; "));
                    return Err(Error::Publish(errors));
                }
                None => {}
            }
        }

        Err(Error::Publish(errors))
    }

    pub async fn fetch(&self, filters: Vec<Filter>) -> Result<Vec<Note>> {
        let timeout = self.inner.options.fetch_timeout;
        self.fetch_timeout(filters, timeout).await
    }

    pub async fn fetch_timeout(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Note>> {
        self.fetch_with(filters, FetchOptions::default().timeout(timeout))
            .await
    }

    /// Open a temporary subscription, collect its events, then close it.
    ///
    /// Ends when `options.policy` is satisfied or every relay closed the
    /// subscription, and fails with [`Error::Timeout`] if that takes longer
    /// than `options.timeout`. Events come back newest first.
    pub async fn fetch_with(&self, filters: Vec<Filter>, options: FetchOptions) -> Result<Vec<Note>> {
        let sub = self.subscribe_with(filters, &options.tracker);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let events = tx.clone();
        sub.on_event(move |note, _stored| {
            let _ = events.send(FetchSignal::Event(note.clone()));
        });
        let eose = tx.clone();
        sub.on_eose(move |_relay, everywhere| {
            if everywhere {
                let _ = eose.send(FetchSignal::Eose);
            }
        });
        sub.on_close(move |_reasons| {
            let _ = tx.send(FetchSignal::Closed);
        });

        sub.open()?;

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        let mut notes = Vec::new();
        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => {
                    break Err(Error::Timeout(format!(
                        "fetch {} timed out after {:?}",
                        sub.id(),
                        options.timeout
                    )));
                }
                signal = rx.recv() => match (signal, options.policy) {
                    (Some(FetchSignal::Event(note)), policy) => {
                        notes.push(note);
                        if let FetchPolicy::WaitForEvents { count, .. } = policy {
                            if notes.len() >= count {
                                break Ok(());
                            }
                        }
                    }
                    (Some(FetchSignal::Eose), FetchPolicy::AllEose)
                    | (Some(FetchSignal::Eose), FetchPolicy::WaitForEvents { end_on_eose: true, .. }) => {
                        break Ok(());
                    }
                    (Some(FetchSignal::Eose), _) => {}
                    (Some(FetchSignal::Closed), _) | (None, _) => break Ok(()),
                }
            }
        };

        sub.close();
        outcome?;

        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notes)
    }

    /// Close every open subscription.
    pub fn unsubscribe_all(&self) -> Vec<AckHandle> {
        self.subscriptions()
            .iter()
            .flat_map(|sub| sub.close())
            .collect()
    }

    /// Close every subscription, then detach and return the relays. They
    /// are not disconnected.
    pub fn close(&self) -> Vec<Relay> {
        self.unsubscribe_all();
        write(&self.inner.subscriptions).clear();

        let relays = std::mem::take(&mut *write(&self.inner.relays));
        relays
            .into_iter()
            .map(|r| {
                r.detach();
                r.relay
            })
            .collect()
    }

    // standardize the format (ie, trailing slashes)
    fn canonicalize_url(url: &str) -> String {
        match Url::parse(url) {
            Ok(parsed_url) => parsed_url.to_string(),
            Err(_) => url.to_owned(), // If parsing fails, return the original URL.
        }
    }
}
