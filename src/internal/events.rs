use bytes::Bytes;

use super::data_types::{ConnectionState, SessionDescription, TransientEvent};
use super::errors::NegotiationError;
use super::session::SessionGeneration;
use super::signal::SignalMessage;

/// reported by a `SignalTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed,
    Error(String),
    /// one undecoded frame
    Message(Bytes),
}

/// reported by a `PeerSession`. tagged with the generation of the session that produced it;
/// events from a destroyed session are discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub generation: SessionGeneration,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// a local offer or answer was created and applied
    LocalSdp(SessionDescription),
    /// a local ICE candidate was gathered, already serialized
    LocalIce(String),
    /// ICE connectivity failed
    Disconnected,
    /// non-fatal
    Failed(NegotiationError),
}

/// emitted by the `CallStateMachine`, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmittedEvents {
    /// must be forwarded to the relay
    Signal(SignalMessage),
    StateChanged(ConnectionState),
    Transient(TransientEvent),
}
