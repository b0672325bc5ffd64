use thiserror::Error;

/// a signal that could not be decoded. the message is dropped, never fatal
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

/// rejected user actions. no state is changed when one of these is returned
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("cannot call yourself")]
    SelfCallRejected,
    #[error("no target given")]
    EmptyTarget,
    #[error("no incoming call from {0}")]
    NoIncomingCall(String),
    #[error("not in a call")]
    NotInCall,
    #[error("not connected to the relay")]
    NotConnected,
    #[error("controller stopped")]
    Stopped,
}

/// a PeerSession operation failed. logged; the session continues
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("session description failure: {0}")]
    Sdp(String),
    #[error("media failure: {0}")]
    Media(String),
    #[error("peer connection failure: {0}")]
    PeerConnection(String),
}
