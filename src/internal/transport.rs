use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::events::TransportEvent;

/// A persistent channel to the relay. Delivers whole frames and reports when it opens or
/// goes away; reliability and retries are its own business.
#[async_trait]
pub trait SignalTransport: Send {
    /// `Opened`, `Closed`, `Error` and `Message` events are reported on `events`
    async fn connect(
        &mut self,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()>;
    /// queues one frame
    fn send(&self, frame: Bytes) -> Result<()>;
    async fn close(&mut self);
}

/// relay connection over WebSocket text frames
#[derive(Default)]
pub struct WebSocketTransport {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    task_handle: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalTransport for WebSocketTransport {
    async fn connect(
        &mut self,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let connected = self.outgoing.as_ref().map_or(false, |tx| !tx.is_closed());
        if connected {
            log::debug!("already connected to the relay");
            let _ = events.send(TransportEvent::Opened);
            return Ok(());
        }

        log::info!("connecting to {}", endpoint);
        let (ws_stream, _) = connect_async(endpoint).await?;
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        self.outgoing = Some(tx);

        let _ = events.send(TransportEvent::Opened);
        self.task_handle = Some(tokio::spawn(async move {
            handle_websocket(ws_stream, rx, events).await;
        }));
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        let Some(tx) = &self.outgoing else {
            bail!("not connected to the relay");
        };
        let text = String::from_utf8(frame.to_vec())?;
        if tx.send(Message::Text(text)).is_err() {
            bail!("relay connection closed");
        }
        Ok(())
    }

    async fn close(&mut self) {
        // dropping the sender ends the socket task
        self.outgoing = None;
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = ws_stream.split();
    let mut last_event = TransportEvent::Closed;

    loop {
        tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        log::error!("failed to send to relay: {}", e);
                        last_event = TransportEvent::Error(e.to_string());
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(Bytes::from(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Message(Bytes::from(data)));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("relay connection failed: {}", e);
                    last_event = TransportEvent::Error(e.to_string());
                    break;
                }
            },
        }
    }

    if events.send(last_event).is_err() {
        log::debug!("relay closed after the controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_before_connect_fails() {
        let transport = WebSocketTransport::new();
        assert!(transport.send(Bytes::from_static(b"{}")).is_err());
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        let mut transport = WebSocketTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(transport.connect("ws://127.0.0.1:1/abcde", tx).await.is_err());
        assert!(rx.try_recv().is_err());
    }
}
