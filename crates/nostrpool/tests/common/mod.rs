//! A scripted in-memory relay for driving the pool end to end.
#![allow(dead_code)]

use async_trait::async_trait;
use nostrpool::{
    ClientMessage, Error, FullKeypair, Note, PoolOptions, RelayMessage, RelayPool, Result,
    SecretKey, Signer, SubId, Transport, TransportEvent, TransportFactory, TransportSink,
    UnsignedNote,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn keypair() -> FullKeypair {
    FullKeypair::from_secret(SecretKey::from_slice(&[7u8; 32]).expect("secret key"))
}

pub async fn note(content: &str, created_at: u64) -> Note {
    let kp = keypair();
    kp.sign(UnsignedNote::new(kp.pubkey, 1, content).created_at(created_at))
        .await
        .expect("sign")
}

/// Plays the server side of one relay.
///
/// Unless silent it answers every REQ with its stored events and an EOSE,
/// and every EVENT with an OK.
pub struct ScriptedRelay {
    url: String,
    sink: Mutex<Option<TransportSink>>,
    sent: Mutex<Vec<ClientMessage>>,
    connects: AtomicUsize,
    stored: Mutex<Vec<Note>>,
    reply_delay: Mutex<Duration>,
    silent: AtomicBool,
    reject: Mutex<Option<String>>,
}

impl ScriptedRelay {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_owned(),
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
            reply_delay: Mutex::new(Duration::ZERO),
            silent: AtomicBool::new(false),
            reject: Mutex::new(None),
        })
    }

    /// Never answers on its own.
    pub fn silent(url: &str) -> Arc<Self> {
        let relay = Self::new(url);
        relay.silent.store(true, Ordering::SeqCst);
        relay
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn store(&self, notes: Vec<Note>) {
        self.stored.lock().unwrap().extend(notes);
    }

    pub fn reply_after(&self, delay: Duration) {
        *self.reply_delay.lock().unwrap() = delay;
    }

    /// Answer EVENTs with a failed OK carrying `message`.
    pub fn reject_events(&self, message: &str) {
        *self.reject.lock().unwrap() = Some(message.to_owned());
    }

    pub fn push(&self, msg: &RelayMessage) {
        self.emit(TransportEvent::Message(msg.to_json().expect("frame")));
    }

    pub fn drop_connection(&self, reason: &str) {
        self.emit(TransportEvent::ClosedByServer(reason.to_owned()));
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reqs_for(&self, id: &SubId) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Req { sub_id, .. } if sub_id == id))
            .count()
    }

    pub fn closes_for(&self, id: &SubId) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Close { sub_id } if sub_id == id))
            .count()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.emit(event);
        }
    }

    fn answer(&self, frames: Vec<RelayMessage>) {
        let Some(sink) = self.sink.lock().unwrap().clone() else {
            return;
        };
        let delay = *self.reply_delay.lock().unwrap();
        let emit = move || {
            for frame in frames {
                sink.emit(TransportEvent::Message(frame.to_json().expect("frame")));
            }
        };
        if delay.is_zero() {
            emit();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                emit();
            });
        }
    }
}

#[async_trait]
impl Transport for ScriptedRelay {
    async fn connect(&self, _url: &str, sink: TransportSink) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        sink.emit(TransportEvent::Opened);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        let msg = ClientMessage::from_json(&text)?;
        self.sent.lock().unwrap().push(msg.clone());
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }

        match msg {
            ClientMessage::Req { sub_id, .. } => {
                let mut frames: Vec<RelayMessage> = self
                    .stored
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|n| RelayMessage::event(sub_id.clone(), n.clone()))
                    .collect();
                frames.push(RelayMessage::Eose(sub_id));
                self.answer(frames);
            }
            ClientMessage::Event(note) => {
                let frame = match self.reject.lock().unwrap().clone() {
                    Some(reason) => RelayMessage::ok(note.id, false, reason),
                    None => RelayMessage::ok(note.id, true, ""),
                };
                self.answer(vec![frame]);
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&self, _reason: &str) -> Result<()> {
        self.sink.lock().unwrap().take();
        Ok(())
    }
}

/// A pool whose relays are the given scripted relays.
pub fn pool_with(relays: &[Arc<ScriptedRelay>]) -> RelayPool {
    pool_with_options(relays, PoolOptions::default())
}

pub fn pool_with_options(relays: &[Arc<ScriptedRelay>], options: PoolOptions) -> RelayPool {
    let scripted = relays.to_vec();
    let factory: TransportFactory = Arc::new(move |url: &str| {
        let relay = scripted
            .iter()
            .find(|r| r.url() == url)
            .cloned()
            .unwrap_or_else(|| ScriptedRelay::silent(url));
        relay as Arc<dyn Transport>
    });

    let pool = RelayPool::with_transport(options, factory);
    for relay in relays {
        pool.add_url(relay.url()).expect("add relay");
    }
    pool
}

/// Same as [`pool_with`], with every relay connected.
pub async fn connected_pool(relays: &[Arc<ScriptedRelay>]) -> RelayPool {
    let pool = pool_with(relays);
    for relay in relays {
        pool.connect_relay(relay.url()).await.expect("connect");
    }
    pool
}

/// Let every relay work through its queue, including frames the scripted
/// relays emitted in reply while the previous round was processed.
pub async fn flush(pool: &RelayPool) {
    for _ in 0..3 {
        for relay in pool.relays() {
            relay.flush().await.expect("flush");
        }
    }
}

pub fn is_timeout(err: &Error) -> bool {
    matches!(err, Error::Timeout(_))
}
