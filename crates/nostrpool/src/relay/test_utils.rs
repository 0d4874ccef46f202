#![cfg(test)]
//! Test utilities for relay testing
//!
//! An in-memory transport that records what the relay sends and lets the
//! test play the server side.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::message::RelayMessage;
use super::transport::{Transport, TransportEvent, TransportSink};
use crate::signer::Signer;
use crate::sync::lock;
use crate::{ClientMessage, Error, FullKeypair, Note, Result, UnsignedNote};

#[derive(Default)]
pub struct MockTransport {
    sink: Mutex<Option<TransportSink>>,
    sent: Mutex<Vec<String>>,
    closes: Mutex<Vec<String>>,
    connects: AtomicUsize,
    manual_open: AtomicBool,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
}

impl MockTransport {
    /// Opens as soon as the relay dials.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stays connecting until [`MockTransport::open`] is called.
    pub fn manual() -> Arc<Self> {
        let transport = Self::default();
        transport.manual_open.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        lock(&self.sink)
            .as_ref()
            .is_some_and(|sink| sink.emit(event))
    }

    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Opened)
    }

    /// Deliver a raw frame as if the relay sent it.
    pub fn reply(&self, frame: impl Into<String>) -> bool {
        self.emit(TransportEvent::Message(frame.into()))
    }

    pub fn relay_says(&self, msg: &RelayMessage) -> bool {
        self.reply(msg.to_json().expect("relay frame"))
    }

    pub fn drop_connection(&self, reason: &str) -> bool {
        self.emit(TransportEvent::ClosedByServer(reason.to_owned()))
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.sent()
            .iter()
            .map(|frame| ClientMessage::from_json(frame).expect("client frame"))
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> Vec<String> {
        lock(&self.closes).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &str, sink: TransportSink) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_owned()));
        }
        if !self.manual_open.load(Ordering::SeqCst) {
            sink.emit(TransportEvent::Opened);
        }
        *lock(&self.sink) = Some(sink);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::Transport("broken pipe".to_owned()));
        }
        lock(&self.sent).push(text);
        Ok(())
    }

    async fn close(&self, reason: &str) -> Result<()> {
        lock(&self.closes).push(reason.to_owned());
        lock(&self.sink).take();
        Ok(())
    }
}

pub fn keypair() -> FullKeypair {
    let secret = nostr::SecretKey::from_slice(&[7u8; 32]).expect("secret key");
    FullKeypair::from_secret(secret)
}

pub async fn signed_note(content: &str, created_at: u64) -> Note {
    let kp = keypair();
    let draft = UnsignedNote::new(kp.pubkey, 1, content).created_at(created_at);
    kp.sign(draft).await.expect("sign")
}
