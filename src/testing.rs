// scripted collaborators, so the state machine and controller can be exercised without a relay
// or a media stack

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::internal::data_types::{MediaKind, SessionDescription};
use crate::internal::events::{SessionEvent, SessionEventKind, TransportEvent};
use crate::internal::session::{PeerSession, PeerSessionFactory, SessionGeneration};
use crate::internal::signal::SignalMessage;
use crate::internal::transport::SignalTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Created(SessionGeneration),
    Offer(SessionGeneration),
    Answer(SessionGeneration),
    ApplyRemote(SessionGeneration, SessionDescription),
    AddIce(SessionGeneration, String),
    SetMedia(SessionGeneration, MediaKind, bool),
    Destroy(SessionGeneration),
}

/// every PeerSession operation, in call order
#[derive(Clone, Default)]
pub struct SessionLog(Arc<Mutex<Vec<SessionCall>>>);

impl SessionLog {
    pub fn calls(&self) -> Vec<SessionCall> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// sessions created and not yet destroyed
    pub fn live(&self) -> usize {
        let calls = self.calls();
        let created = calls
            .iter()
            .filter(|c| matches!(c, SessionCall::Created(_)))
            .count();
        let destroyed = calls
            .iter()
            .filter(|c| matches!(c, SessionCall::Destroy(_)))
            .count();
        created - destroyed
    }

    fn push(&self, call: SessionCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }
}

pub struct RecordingFactory {
    log: SessionLog,
    fail: bool,
}

impl RecordingFactory {
    pub fn new(log: SessionLog) -> Self {
        Self { log, fail: false }
    }

    pub fn failing(log: SessionLog) -> Self {
        Self { log, fail: true }
    }
}

impl PeerSessionFactory for RecordingFactory {
    fn create(
        &mut self,
        generation: SessionGeneration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn PeerSession>> {
        if self.fail {
            bail!("no media engine");
        }
        self.log.push(SessionCall::Created(generation));
        Ok(Box::new(RecordingSession {
            generation,
            log: self.log.clone(),
            events,
        }))
    }
}

/// answers offer()/answer() with a canned local description, delivered through the channel
struct RecordingSession {
    generation: SessionGeneration,
    log: SessionLog,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl RecordingSession {
    fn complete(&self, description: SessionDescription) {
        let _ = self.events.send(SessionEvent {
            generation: self.generation,
            kind: SessionEventKind::LocalSdp(description),
        });
    }
}

impl PeerSession for RecordingSession {
    fn offer(&mut self) {
        self.log.push(SessionCall::Offer(self.generation));
        self.complete(SessionDescription::offer(format!(
            "local-offer-{}",
            self.generation
        )));
    }

    fn answer(&mut self) {
        self.log.push(SessionCall::Answer(self.generation));
        self.complete(SessionDescription::answer(format!(
            "local-answer-{}",
            self.generation
        )));
    }

    fn apply_remote(&mut self, description: SessionDescription) {
        self.log
            .push(SessionCall::ApplyRemote(self.generation, description));
    }

    fn add_ice_candidate(&mut self, candidate: String) {
        self.log.push(SessionCall::AddIce(self.generation, candidate));
    }

    fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        self.log
            .push(SessionCall::SetMedia(self.generation, kind, enabled));
    }

    fn destroy(&mut self) {
        self.log.push(SessionCall::Destroy(self.generation));
    }
}

#[derive(Default)]
struct RelayInner {
    endpoint: Option<String>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    sent: Vec<Bytes>,
    closed: bool,
}

/// the test's side of a `MemoryTransport`
#[derive(Clone, Default)]
pub struct MemoryRelay(Arc<Mutex<RelayInner>>);

impl MemoryRelay {
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
            refuse: false,
        }
    }

    pub fn refusing_transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
            refuse: true,
        }
    }

    pub fn endpoint(&self) -> Option<String> {
        self.0.lock().ok().and_then(|r| r.endpoint.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().map(|r| r.closed).unwrap_or(false)
    }

    /// everything the client sent, decoded
    pub fn sent(&self) -> Vec<SignalMessage> {
        let frames = self.0.lock().map(|r| r.sent.clone()).unwrap_or_default();
        frames
            .iter()
            .filter_map(|f| SignalMessage::decode(f).ok())
            .collect()
    }

    pub fn deliver(&self, msg: &SignalMessage) {
        self.raw(TransportEvent::Message(msg.encode()));
    }

    pub fn raw(&self, event: TransportEvent) {
        let tx = self.0.lock().ok().and_then(|r| r.events.clone());
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }
}

pub struct MemoryTransport {
    relay: MemoryRelay,
    refuse: bool,
}

#[async_trait]
impl SignalTransport for MemoryTransport {
    async fn connect(
        &mut self,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        if self.refuse {
            bail!("connection refused");
        }
        let mut relay = match self.relay.0.lock() {
            Ok(r) => r,
            Err(_) => bail!("relay poisoned"),
        };
        relay.endpoint = Some(endpoint.to_string());
        let _ = events.send(TransportEvent::Opened);
        relay.events = Some(events);
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        let mut relay = match self.relay.0.lock() {
            Ok(r) => r,
            Err(_) => bail!("relay poisoned"),
        };
        if relay.events.is_none() {
            bail!("not connected");
        }
        relay.sent.push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        if let Ok(mut relay) = self.relay.0.lock() {
            relay.closed = true;
            relay.events = None;
        }
    }
}
