mod ack;
mod component;
mod lifecycle;
pub mod message;
mod pool;
mod session;
mod sub_tracker;
mod subscription;
mod transport;
mod websocket;

#[cfg(test)]
pub(crate) mod test_utils;

pub use ack::{Ack, AckHandle};
pub use component::{RelayComponent, Verdict};
pub use lifecycle::RelayLifecycleManager;
pub use pool::{AckPolicy, FetchOptions, FetchPolicy, PoolOptions, PoolRelay, RelayPool};
pub use session::{Relay, RelayOptions, RelayStatus};
pub use sub_tracker::{RelaySubscriptionTracker, SubState};
pub use subscription::{ListenerId, Subscription};
pub use transport::{Transport, TransportEvent, TransportFactory, TransportSink};
pub use websocket::WebsocketTransport;
