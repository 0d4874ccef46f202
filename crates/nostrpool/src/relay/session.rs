use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::ack::{AckHandle, AckSender, PendingAcks};
use super::component::{RelayComponent, Verdict};
use super::message::RelayMessage;
use super::transport::{Transport, TransportEvent, TransportSink};
use super::websocket::WebsocketTransport;
use crate::backoff::{BackoffOptions, ExponentialBackoff};
use crate::signer::{SchnorrVerifier, Verifier};
use crate::sync::{lock, read, write};
use crate::{ClientMessage, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
}

#[derive(Clone)]
pub struct RelayOptions {
    /// Published events without an `OK` after this long fail.
    pub ack_timeout: Duration,
    pub tick_interval: Duration,
    pub auto_reconnect: bool,
    pub verify_events: bool,
    pub verifier: Arc<dyn Verifier>,
    pub backoff: BackoffOptions,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(21 * 60),
            tick_interval: Duration::from_secs(10),
            auto_reconnect: true,
            verify_events: true,
            verifier: Arc::new(SchnorrVerifier),
            backoff: BackoffOptions::default(),
        }
    }
}

impl fmt::Debug for RelayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayOptions")
            .field("ack_timeout", &self.ack_timeout)
            .field("tick_interval", &self.tick_interval)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("verify_events", &self.verify_events)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RelayOptions {
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn verify_events(mut self, enabled: bool) -> Self {
        self.verify_events = enabled;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }
}

pub(crate) enum Command {
    Connect(Option<oneshot::Sender<Result<RelayStatus>>>),
    Reconnect,
    Disconnect {
        reason: String,
        reply: Option<oneshot::Sender<RelayStatus>>,
    },
    Send {
        msg: ClientMessage,
        ack: AckSender,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Tick,
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

struct RelayShared {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    transport: Arc<dyn Transport>,
    components: RwLock<Vec<Arc<dyn RelayComponent>>>,
    pending: PendingAcks,
    backoff: ExponentialBackoff,
    options: RelayOptions,
    status: Mutex<RelayStatus>,
    has_connected: AtomicBool,
    queued: AtomicUsize,
}

/// Handle to one relay connection.
///
/// Cloning is cheap and every clone drives the same session. All state
/// changes run on a dedicated worker task, one command at a time, in the
/// order they were submitted. The worker stops after [`Relay::shutdown`] or
/// once every handle is dropped.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<RelayShared>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .finish()
    }
}

impl Hash for Relay {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hashes the Relay by hashing the URL
        self.shared.url.hash(state);
    }
}

impl PartialEq for Relay {
    fn eq(&self, other: &Self) -> bool {
        self.shared.url == other.shared.url
    }
}

impl Eq for Relay {}

impl Relay {
    /// Create a session and spawn its worker. Must be called from within a
    /// Tokio runtime. Nothing is dialed until [`Relay::connect`] or a send.
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: RelayOptions,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("relays must be created inside a tokio runtime".into()))?;
        let backoff = ExponentialBackoff::new(options.backoff)?;
        let (commands, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(RelayShared {
            url: url.into(),
            commands,
            transport,
            components: RwLock::new(Vec::new()),
            pending: PendingAcks::default(),
            backoff,
            options,
            status: Mutex::new(RelayStatus::Disconnected),
            has_connected: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
        });

        let worker = Worker {
            shared: Arc::downgrade(&shared),
            commands: rx,
            state: SessionState::default(),
        };
        runtime.spawn(worker.run());

        Ok(Self { shared })
    }

    pub fn websocket(url: impl Into<String>, options: RelayOptions) -> Result<Self> {
        Self::new(url, Arc::new(WebsocketTransport::default()), options)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn status(&self) -> RelayStatus {
        *lock(&self.shared.status)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    /// Whether this session ever completed a connection.
    pub fn has_connected(&self) -> bool {
        self.shared.has_connected.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &RelayOptions {
        &self.shared.options
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.shared.backoff
    }

    /// Events sent but not yet acknowledged.
    pub fn pending_acks(&self) -> usize {
        self.shared.pending.len()
    }

    /// Messages waiting for a connection.
    pub fn queued_messages(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn add_component(&self, component: Arc<dyn RelayComponent>) {
        write(&self.shared.components).push(component);
    }

    pub fn remove_component(&self, component: &Arc<dyn RelayComponent>) -> bool {
        let mut components = write(&self.shared.components);
        let before = components.len();
        components.retain(|c| !Arc::ptr_eq(c, component));
        components.len() != before
    }

    fn command(&self, command: Command) -> Result<()> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| Error::RelayShutdown)
    }

    /// Connect, or join an attempt already in flight. Resolves once the
    /// transport is open, with `Disconnected` if a component vetoed.
    pub async fn connect(&self) -> Result<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(Some(tx)))?;
        rx.await.map_err(|_| Error::RelayShutdown)?
    }

    /// Fire-and-forget [`Relay::connect`], safe to call from components.
    pub fn request_connect(&self) {
        if self.command(Command::Connect(None)).is_err() {
            debug!("connect requested on stopped relay {}", self.url());
        }
    }

    /// Close the connection without scheduling a reconnect. Pending acks
    /// are left to time out.
    pub async fn disconnect(&self, reason: &str) -> Result<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Disconnect {
            reason: reason.to_owned(),
            reply: Some(tx),
        })?;
        rx.await.map_err(|_| Error::RelayShutdown)
    }

    pub fn request_disconnect(&self, reason: &str) {
        let command = Command::Disconnect {
            reason: reason.to_owned(),
            reply: None,
        };
        if self.command(command).is_err() {
            debug!("disconnect requested on stopped relay {}", self.url());
        }
    }

    /// Submit a message. It goes out now if connected, otherwise when the
    /// connection opens. The handle resolves with the relay's verdict.
    pub fn send(&self, msg: ClientMessage) -> AckHandle {
        let (ack, handle) = AckHandle::channel(msg.event_id(), self.url());
        if let Err(mpsc::error::SendError(Command::Send { ack, .. })) =
            self.shared.commands.send(Command::Send { msg, ack })
        {
            ack.fail(Instant::now(), Error::RelayShutdown.to_string());
        }
        handle
    }

    /// Wait until every command submitted before this call was processed.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Barrier(tx))?;
        rx.await.map_err(|_| Error::RelayShutdown)
    }

    /// Stop the worker. The handle is unusable afterwards.
    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }

    fn set_status(&self, status: RelayStatus) {
        *lock(&self.shared.status) = status;
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let commands = self.shared.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        });
    }

    pub(crate) fn run_hooks(
        &self,
        step: &str,
        mut hook: impl FnMut(&dyn RelayComponent) -> Result<Verdict>,
    ) -> Result<Verdict> {
        let components = read(&self.shared.components).clone();
        for component in components {
            match hook(component.as_ref()) {
                Ok(Verdict::Proceed) => {}
                Ok(Verdict::Veto) => {
                    trace!("{step} vetoed by component on {}", self.url());
                    return Ok(Verdict::Veto);
                }
                Err(err) => {
                    warn!("{step} cancelled by component on {}: {err}", self.url());
                    return Err(err);
                }
            }
        }
        Ok(Verdict::Proceed)
    }
}

#[derive(Default)]
struct SessionState {
    connected: bool,
    connecting: bool,
    disconnected_by_client: bool,
    first_connection: bool,
    /// bumped on every dial and teardown, stale transport events are dropped
    generation: u64,
    outbound: VecDeque<(ClientMessage, AckSender)>,
    connect_waiters: Vec<oneshot::Sender<Result<RelayStatus>>>,
    reconnect_scheduled: bool,
    ticking: bool,
}

struct Worker {
    shared: Weak<RelayShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: SessionState,
}

impl Worker {
    async fn run(mut self) {
        let mut url = String::new();
        while let Some(command) = self.commands.recv().await {
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            let relay = Relay { shared };
            if url.is_empty() {
                url = relay.url().to_owned();
            }
            if !self.handle(&relay, command).await {
                break;
            }
        }

        for (_, ack) in self.state.outbound.drain(..) {
            ack.fail(Instant::now(), Error::RelayShutdown.to_string());
        }
        for waiter in self.state.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::RelayShutdown));
        }
        debug!("relay worker for {url} stopped");
    }

    async fn handle(&mut self, relay: &Relay, command: Command) -> bool {
        match command {
            Command::Connect(reply) => self.connect(relay, reply).await,
            Command::Reconnect => {
                self.state.reconnect_scheduled = false;
                let st = &self.state;
                if !(st.connected || st.connecting || st.disconnected_by_client) {
                    self.connect(relay, None).await;
                }
            }
            Command::Disconnect { reason, reply } => {
                let status = self.disconnect(relay, &reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(status);
                }
            }
            Command::Send { msg, ack } => self.send(relay, msg, ack).await,
            Command::Transport { generation, event } => {
                if generation != self.state.generation {
                    trace!("stale transport event from {}: {:?}", relay.url(), event);
                } else {
                    self.transport_event(relay, event).await;
                }
            }
            Command::Tick => self.tick(relay),
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown => {
                if self.state.connected || self.state.connecting {
                    if let Err(err) = relay.shared.transport.close("shutdown").await {
                        warn!("error closing {}: {err}", relay.url());
                    }
                }
                relay.set_status(RelayStatus::Disconnected);
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, relay: &Relay, reply: Option<oneshot::Sender<Result<RelayStatus>>>) {
        if self.state.connected {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(RelayStatus::Connected));
            }
            return;
        }
        if self.state.connecting {
            self.state.connect_waiters.extend(reply);
            return;
        }

        self.state.disconnected_by_client = false;
        match relay.run_hooks("connect request", |c| c.on_connect_request(relay)) {
            Ok(Verdict::Proceed) => {}
            Ok(Verdict::Veto) => {
                debug!("connection to {} vetoed", relay.url());
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(RelayStatus::Disconnected));
                }
                return;
            }
            Err(err) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return;
            }
        }

        self.state.connect_waiters.extend(reply);
        self.state.connecting = true;
        relay.set_status(RelayStatus::Connecting);
        self.ensure_ticking(relay);
        self.dial(relay).await;
    }

    async fn dial(&mut self, relay: &Relay) {
        self.state.generation += 1;
        let sink = TransportSink::new(self.state.generation, relay.shared.commands.clone());
        info!("connecting to {}", relay.url());

        if let Err(err) = relay.shared.transport.connect(relay.url(), sink).await {
            error!("error connecting to relay {}: {err}", relay.url());
            let _ = relay.run_hooks("error", |c| c.on_error(relay, &err));
            self.connection_lost(relay, &err.to_string());
        }
    }

    async fn transport_event(&mut self, relay: &Relay, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.opened(relay).await,
            TransportEvent::Message(text) => self.message(relay, &text),
            TransportEvent::ClosedByServer(reason) => {
                info!("{} closed the connection: {reason}", relay.url());
                self.connection_lost(relay, &reason);
            }
            TransportEvent::ClosedByClient(reason) => {
                self.state.disconnected_by_client = true;
                self.closed_by_client(relay, &reason);
            }
            TransportEvent::Error(msg) => {
                error!("transport error on {}: {msg}", relay.url());
                let err = Error::Transport(msg.clone());
                let _ = relay.run_hooks("error", |c| c.on_error(relay, &err));
                self.connection_lost(relay, &msg);
            }
        }
    }

    async fn opened(&mut self, relay: &Relay) {
        self.state.connecting = false;
        self.state.connected = true;
        self.state.first_connection = true;
        relay.shared.has_connected.store(true, Ordering::Release);
        relay.set_status(RelayStatus::Connected);
        relay.backoff().register_success();
        info!("connected to {}", relay.url());

        let _ = relay.run_hooks("connect", |c| c.on_connect(relay));

        while let Some((msg, ack)) = self.state.outbound.pop_front() {
            relay
                .shared
                .queued
                .store(self.state.outbound.len(), Ordering::Release);
            trace!("flushing queued {} to {}", msg.kind(), relay.url());
            self.transmit(relay, msg, ack).await;
        }

        for waiter in self.state.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(RelayStatus::Connected));
        }
    }

    fn connection_lost(&mut self, relay: &Relay, reason: &str) {
        let was_connected = self.state.connected;
        self.state.connected = false;
        self.state.connecting = false;
        self.state.generation += 1;
        relay.set_status(RelayStatus::Disconnected);

        for waiter in self.state.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Transport(reason.to_owned())));
        }

        if was_connected {
            let _ = relay.run_hooks("disconnect", |c| c.on_disconnect(relay, reason, false));
        }

        if relay.options().auto_reconnect && !self.state.disconnected_by_client {
            self.schedule_reconnect(relay);
        }
    }

    fn closed_by_client(&mut self, relay: &Relay, reason: &str) {
        self.state.connected = false;
        self.state.connecting = false;
        self.state.generation += 1;
        relay.set_status(RelayStatus::Disconnected);
        info!("disconnected from {}: {reason}", relay.url());

        for waiter in self.state.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Transport(format!("disconnected: {reason}"))));
        }

        let _ = relay.run_hooks("disconnect", |c| c.on_disconnect(relay, reason, true));
    }

    fn schedule_reconnect(&mut self, relay: &Relay) {
        if self.state.reconnect_scheduled {
            return;
        }
        let backoff = relay.backoff();
        backoff.register_failure();
        let delay = backoff.next_attempt_delay(Instant::now());
        self.state.reconnect_scheduled = true;
        debug!(
            "reconnecting to {} in {:?} (attempt {})",
            relay.url(),
            delay,
            backoff.failures()
        );
        relay.schedule(delay, Command::Reconnect);
    }

    async fn disconnect(&mut self, relay: &Relay, reason: &str) -> RelayStatus {
        if !self.state.connected && !self.state.connecting {
            // also cancels a pending reconnect
            self.state.disconnected_by_client = true;
            return RelayStatus::Disconnected;
        }

        match relay.run_hooks("disconnect request", |c| c.on_disconnect_request(relay, reason)) {
            Ok(Verdict::Proceed) => {}
            _ => return relay.status(),
        }

        self.state.disconnected_by_client = true;
        if let Err(err) = relay.shared.transport.close(reason).await {
            warn!("error disconnecting from {}: {err}", relay.url());
        }
        self.closed_by_client(relay, reason);
        RelayStatus::Disconnected
    }

    async fn send(&mut self, relay: &Relay, msg: ClientMessage, ack: AckSender) {
        let _ = relay.run_hooks("before send", |c| c.on_before_send(relay, &msg));

        if !self.state.connected {
            trace!("{} not connected, queueing {}", relay.url(), msg.kind());
            self.state.outbound.push_back((msg, ack));
            relay
                .shared
                .queued
                .store(self.state.outbound.len(), Ordering::Release);
            return;
        }

        self.transmit(relay, msg, ack).await;
    }

    async fn transmit(&mut self, relay: &Relay, msg: ClientMessage, ack: AckSender) {
        let sent_at = Instant::now();
        match relay.run_hooks("send", |c| c.on_send(relay, &msg)) {
            Ok(Verdict::Proceed) => {}
            Ok(Verdict::Veto) => {
                ack.succeed(sent_at, "message ignored by component");
                return;
            }
            Err(err) => {
                ack.fail(sent_at, format!("message cancelled by component: {err}"));
                return;
            }
        }

        let json = match msg.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!("error serializing {} for {}: {err}", msg.kind(), relay.url());
                ack.fail(sent_at, err.to_string());
                return;
            }
        };

        // events wait for an OK frame, everything else succeeds on write
        let event_id = msg.event_id();
        let immediate = match event_id {
            Some(id) => {
                relay.shared.pending.insert(id, sent_at, ack);
                self.ensure_ticking(relay);
                None
            }
            None => Some(ack),
        };

        trace!("sending {} to {}", json, relay.url());
        match relay.shared.transport.send(json).await {
            Ok(()) => {
                if let Some(ack) = immediate {
                    ack.succeed(sent_at, "ok");
                }
            }
            Err(err) => {
                warn!("error sending to {}: {err}", relay.url());
                let ack = immediate.or_else(|| {
                    event_id
                        .and_then(|id| relay.shared.pending.take(&id))
                        .map(|(_, sender)| sender)
                });
                if let Some(ack) = ack {
                    ack.fail(sent_at, err.to_string());
                }
            }
        }
    }

    #[profiling::function]
    fn message(&mut self, relay: &Relay, text: &str) {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("dropping frame from {}: {err}", relay.url());
                return;
            }
        };

        match &msg {
            RelayMessage::OK(result) => {
                if !relay
                    .shared
                    .pending
                    .resolve(&result.event_id, result.status, &result.message)
                {
                    debug!(
                        "received ack for unknown event {} from {}",
                        result.event_id,
                        relay.url()
                    );
                }
                return;
            }
            RelayMessage::Event(_, note) if relay.options().verify_events => {
                match relay.options().verifier.verify(note) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("dropping event {} from {}: bad signature", note.id, relay.url());
                        return;
                    }
                    Err(err) => {
                        warn!("dropping event {} from {}: {err}", note.id, relay.url());
                        return;
                    }
                }
            }
            _ => {}
        }

        let _ = relay.run_hooks("message", |c| c.on_message(relay, &msg));
    }

    fn ensure_ticking(&mut self, relay: &Relay) {
        if !self.state.ticking {
            self.state.ticking = true;
            relay.schedule(relay.options().tick_interval, Command::Tick);
        }
    }

    fn tick(&mut self, relay: &Relay) {
        let now = Instant::now();
        let expired = relay.shared.pending.expire(now, relay.options().ack_timeout);
        if expired > 0 {
            debug!("{expired} acks timed out on {}", relay.url());
        }

        let halted = matches!(
            relay.run_hooks("tick", |c| c.on_tick(relay, now)),
            Ok(Verdict::Veto)
        );

        // a veto only stops the component hooks; acks still have to expire
        if halted && relay.shared.pending.is_empty() {
            trace!("housekeeping halted on {}", relay.url());
            self.state.ticking = false;
        } else {
            relay.schedule(relay.options().tick_interval, Command::Tick);
        }
    }
}
