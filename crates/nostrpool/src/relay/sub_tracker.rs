use hashbrown::HashMap;
use std::sync::Mutex;
use tracing::{debug, trace};

use super::component::{RelayComponent, Verdict};
use super::message::RelayMessage;
use super::session::Relay;
use crate::sync::lock;
use crate::{ClientMessage, Result, SubId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubState {
    pub active: bool,
    pub eose: bool,
}

/// Tracks which subscriptions are open on one relay and whether each has
/// finished replaying stored events.
///
/// A `REQ` for a subscription that is already active is vetoed, so the
/// relay never sees the same subscription twice.
#[derive(Debug, Default)]
pub struct RelaySubscriptionTracker {
    subs: Mutex<HashMap<SubId, SubState>>,
}

impl RelaySubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: &SubId) -> Option<SubState> {
        lock(&self.subs).get(id).copied()
    }

    pub fn is_active(&self, id: &SubId) -> bool {
        self.state(id).is_some_and(|s| s.active)
    }

    pub fn is_eose(&self, id: &SubId) -> bool {
        self.state(id).is_some_and(|s| s.eose)
    }

    /// Active here and still replaying stored events.
    pub fn is_awaiting_eose(&self, id: &SubId) -> bool {
        self.state(id).is_some_and(|s| s.active && !s.eose)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.subs).values().filter(|s| s.active).count()
    }
}

impl RelayComponent for RelaySubscriptionTracker {
    fn on_send(&self, relay: &Relay, msg: &ClientMessage) -> Result<Verdict> {
        match msg {
            ClientMessage::Req { sub_id, .. } => {
                let mut subs = lock(&self.subs);
                if subs.get(sub_id).is_some_and(|s| s.active) {
                    debug!("{} already open on {}, skipping REQ", sub_id, relay.url());
                    return Ok(Verdict::Veto);
                }
                subs.insert(
                    sub_id.clone(),
                    SubState {
                        active: true,
                        eose: false,
                    },
                );
            }
            ClientMessage::Close { sub_id } => {
                lock(&self.subs).remove(sub_id);
            }
            _ => {}
        }
        Ok(Verdict::Proceed)
    }

    fn on_message(&self, relay: &Relay, msg: &RelayMessage) -> Result<Verdict> {
        match msg {
            RelayMessage::Eose(sub_id) => {
                if let Some(state) = lock(&self.subs).get_mut(sub_id) {
                    state.eose = true;
                }
            }
            RelayMessage::Closed(sub_id, reason) => {
                trace!("{} closed {}: {}", relay.url(), sub_id, reason);
                lock(&self.subs).remove(sub_id);
            }
            _ => {}
        }
        Ok(Verdict::Proceed)
    }

    fn on_disconnect(&self, _relay: &Relay, _reason: &str, _by_client: bool) -> Result<Verdict> {
        lock(&self.subs).clear();
        Ok(Verdict::Proceed)
    }
}
