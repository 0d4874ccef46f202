use hashbrown::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::component::{RelayComponent, Verdict};
use super::message::RelayMessage;
use super::session::Relay;
use crate::sync::lock;
use crate::{ClientMessage, Result, SubId};

struct LifecycleState {
    last_activity: Instant,
    subs: HashSet<SubId>,
    halted: bool,
}

/// Connects relays on demand and drops them once idle.
///
/// Any outbound message triggers a connect. A connected relay with no open
/// subscriptions and no traffic for `keep_alive` is disconnected on the
/// next tick. After a client-initiated disconnect ticks are halted until the
/// next connect request.
pub struct RelayLifecycleManager {
    keep_alive: Duration,
    state: Mutex<LifecycleState>,
}

impl Default for RelayLifecycleManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl RelayLifecycleManager {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            state: Mutex::new(LifecycleState {
                last_activity: Instant::now(),
                subs: HashSet::new(),
                halted: false,
            }),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn open_subscriptions(&self) -> usize {
        lock(&self.state).subs.len()
    }

    fn touch(&self) {
        lock(&self.state).last_activity = Instant::now();
    }
}

impl RelayComponent for RelayLifecycleManager {
    fn on_connect_request(&self, _relay: &Relay) -> Result<Verdict> {
        let mut state = lock(&self.state);
        state.halted = false;
        state.last_activity = Instant::now();
        Ok(Verdict::Proceed)
    }

    fn on_connect(&self, _relay: &Relay) -> Result<Verdict> {
        self.touch();
        Ok(Verdict::Proceed)
    }

    fn on_disconnect_request(&self, _relay: &Relay, _reason: &str) -> Result<Verdict> {
        self.touch();
        Ok(Verdict::Proceed)
    }

    fn on_disconnect(&self, _relay: &Relay, _reason: &str, by_client: bool) -> Result<Verdict> {
        let mut state = lock(&self.state);
        state.subs.clear();
        if by_client {
            state.halted = true;
        }
        Ok(Verdict::Proceed)
    }

    fn on_before_send(&self, relay: &Relay, msg: &ClientMessage) -> Result<Verdict> {
        {
            let mut state = lock(&self.state);
            state.last_activity = Instant::now();
            match msg {
                ClientMessage::Req { sub_id, .. } => {
                    state.subs.insert(sub_id.clone());
                }
                ClientMessage::Close { sub_id } => {
                    state.subs.remove(sub_id);
                }
                _ => {}
            }
        }

        if !relay.is_connected() {
            relay.request_connect();
        }
        Ok(Verdict::Proceed)
    }

    fn on_message(&self, _relay: &Relay, msg: &RelayMessage) -> Result<Verdict> {
        match msg {
            RelayMessage::Event(..) => self.touch(),
            RelayMessage::Closed(sub_id, _) => {
                lock(&self.state).subs.remove(sub_id);
            }
            _ => {}
        }
        Ok(Verdict::Proceed)
    }

    fn on_tick(&self, relay: &Relay, now: Instant) -> Result<Verdict> {
        let state = lock(&self.state);
        if state.halted {
            return Ok(Verdict::Veto);
        }

        let idle = now.saturating_duration_since(state.last_activity);
        if state.subs.is_empty() && relay.is_connected() && idle > self.keep_alive {
            debug!("{} idle for {:?}, disconnecting", relay.url(), idle);
            relay.request_disconnect("idle");
        }
        Ok(Verdict::Proceed)
    }
}
