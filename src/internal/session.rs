use anyhow::Result;
use tokio::sync::mpsc;

use super::data_types::{MediaKind, SessionDescription};
use super::events::SessionEvent;

/// distinguishes successive sessions, so late events from a destroyed one can be dropped
pub type SessionGeneration = u64;

/// One peer-connection negotiation, scoped to a single call.
///
/// Every method only starts the work. Results (local descriptions, local candidates,
/// failures) come back as `SessionEvent`s on the channel given to the factory, never inline.
pub trait PeerSession: Send {
    /// create a local offer. results in `SessionEventKind::LocalSdp`
    fn offer(&mut self);
    /// create a local answer. results in `SessionEventKind::LocalSdp`
    fn answer(&mut self);
    fn apply_remote(&mut self, description: SessionDescription);
    /// a bad or stale candidate results in `NegotiationError::InvalidCandidate`
    fn add_ice_candidate(&mut self, candidate: String);
    fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool);
    /// after this, pending work may still report events; they carry a stale generation
    fn destroy(&mut self);
}

pub trait PeerSessionFactory: Send {
    fn create(
        &mut self,
        generation: SessionGeneration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn PeerSession>>;
}
