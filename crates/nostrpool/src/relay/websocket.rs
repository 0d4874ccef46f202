use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ewebsock::{Options, WsEvent, WsMessage, WsSender};
use tracing::{debug, trace};

use super::transport::{Transport, TransportEvent, TransportSink};
use crate::sync::lock;
use crate::{Error, Result};

/// [`Transport`] over a websocket, backed by `ewebsock`.
#[derive(Default)]
pub struct WebsocketTransport {
    options: Options,
    sender: Arc<Mutex<Option<WsSender>>>,
}

impl WebsocketTransport {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            sender: Arc::default(),
        }
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn connect(&self, url: &str, sink: TransportSink) -> Result<()> {
        // drop whatever is left of an earlier connection
        if let Some(mut old) = lock(&self.sender).take() {
            old.close();
        }

        let pong = self.sender.clone();
        let relay = url.to_owned();
        let on_event = Box::new(move |event: WsEvent| {
            let event = match event {
                WsEvent::Opened => TransportEvent::Opened,
                WsEvent::Message(WsMessage::Text(text)) => TransportEvent::Message(text),
                WsEvent::Message(WsMessage::Ping(bs)) => {
                    trace!("pong {}", relay);
                    if let Some(sender) = lock(&pong).as_mut() {
                        sender.send(WsMessage::Pong(bs));
                    }
                    return ControlFlow::Continue(());
                }
                WsEvent::Message(other) => {
                    trace!("ignoring non-text frame from {}: {:?}", relay, other);
                    return ControlFlow::Continue(());
                }
                WsEvent::Error(err) => TransportEvent::Error(err),
                WsEvent::Closed => TransportEvent::ClosedByServer("connection closed".to_owned()),
            };

            if sink.emit(event) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        });

        let sender = ewebsock::ws_connect(url.to_owned(), self.options.clone(), on_event)?;
        *lock(&self.sender) = Some(sender);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<()> {
        let mut sender = lock(&self.sender);
        let sender = sender.as_mut().ok_or(Error::NotConnected)?;
        sender.send(WsMessage::Text(text));
        Ok(())
    }

    async fn close(&self, reason: &str) -> Result<()> {
        if let Some(mut sender) = lock(&self.sender).take() {
            debug!("closing websocket: {reason}");
            sender.close();
        }
        Ok(())
    }
}
