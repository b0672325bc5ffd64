use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// identifies a participant. opaque to the state machine
pub type PeerId = String;

/// creates a short random identity, assigned once per process.
/// collisions are improbable, not impossible
pub fn generate_peer_id() -> PeerId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(5);
    id
}

/// exactly one is active at a time. owned by the `CallStateMachine`, observed by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ConnectionState {
    /// the transport has not opened yet
    #[display(fmt = "new")]
    New,
    /// idle: transport is open and there is no active call
    #[display(fmt = "waiting for call")]
    WaitingForCall,
    /// the last lookup failed. superseded by the next action
    #[display(fmt = "{} is offline", _0)]
    UserOffline(PeerId),
    /// outbound call placed, waiting for accept/reject
    #[display(fmt = "calling {}", _0)]
    CallingTarget(PeerId),
    /// inbound call waiting for a local accept/reject
    #[display(fmt = "incoming call from {}", _0)]
    ReceivedCall(PeerId),
    /// negotiating or connected
    #[display(fmt = "on call with {}", _0)]
    OnCall(PeerId),
}

impl ConnectionState {
    /// the remote identity this state is bound to, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            ConnectionState::New | ConnectionState::WaitingForCall => None,
            ConnectionState::UserOffline(p)
            | ConnectionState::CallingTarget(p)
            | ConnectionState::ReceivedCall(p)
            | ConnectionState::OnCall(p) => Some(p),
        }
    }
}

/// one-shot notifications for the UI. never replayed to late subscribers
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum TransientEvent {
    #[display(fmt = "Call rejected")]
    Rejected,
    #[display(fmt = "{} is offline", _0)]
    UserOffline(PeerId),
    #[display(fmt = "Call timed out")]
    TimedOut,
    #[display(fmt = "You cannot call yourself")]
    SelfCall,
    #[display(fmt = "Enter someone to call")]
    EmptyTarget,
    #[display(fmt = "Connection to {} lost", _0)]
    ConnectionLost(PeerId),
    #[display(fmt = "Connection to the relay closed")]
    TransportClosed,
    #[display(fmt = "Relay error: {}", _0)]
    TransportError(String),
}

impl TransientEvent {
    /// the toast text
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// the local media that can be switched on and off during a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MediaKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

/// which half of the offer/answer handshake a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SdpKind {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
}

/// a session description, as exchanged in `Offer`/`Answer` payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}
