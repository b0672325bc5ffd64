use std::collections::HashMap;
use tokio::sync::mpsc;

use super::config::RingTimeouts;
use super::data_types::*;
use super::errors::CallError;
use super::events::{EmittedEvents, SessionEvent, SessionEventKind};
use super::session::{PeerSession, PeerSessionFactory, SessionGeneration};
use super::signal::{MessageType, SignalMessage};
use super::timeout::{TimeoutScheduler, TimerId};

/// a PeerSession plus the generation its events are tagged with.
/// dropping it destroys the session, so it is destroyed exactly once
struct LiveSession {
    generation: SessionGeneration,
    session: Box<dyn PeerSession>,
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        log::debug!("destroying peer session {}", self.generation);
        self.session.destroy();
    }
}

// the owned form of ConnectionState. the ringing variants carry the timer they armed and
// OnCall carries the session, so leaving a state releases what it held
enum Phase {
    New,
    WaitingForCall,
    UserOffline(PeerId),
    CallingTarget { target: PeerId, timer: TimerId },
    ReceivedCall { sender: PeerId, timer: TimerId },
    OnCall {
        peer: PeerId,
        session: Option<LiveSession>,
    },
}

impl Phase {
    fn view(&self) -> ConnectionState {
        match self {
            Phase::New => ConnectionState::New,
            Phase::WaitingForCall => ConnectionState::WaitingForCall,
            Phase::UserOffline(t) => ConnectionState::UserOffline(t.clone()),
            Phase::CallingTarget { target, .. } => ConnectionState::CallingTarget(target.clone()),
            Phase::ReceivedCall { sender, .. } => ConnectionState::ReceivedCall(sender.clone()),
            Phase::OnCall { peer, .. } => ConnectionState::OnCall(peer.clone()),
        }
    }
}

pub struct MachineArgs {
    pub id: PeerId,
    pub timeouts: RingTimeouts,
    pub sessions: Box<dyn PeerSessionFactory>,
    /// handed to every PeerSession the machine creates
    pub session_event_chan: mpsc::UnboundedSender<SessionEvent>,
    /// receives timer fires, which must be passed back to `on_timeout`
    pub timer_chan: mpsc::UnboundedSender<TimerId>,
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
}

/// Owns the call lifecycle.
///
/// Not thread safe by design: every entry point must be called from one serialized context.
/// Outbound signals, state changes and toasts are emitted on `emitted_event_chan` in order.
/// Inbound messages that don't fit the current state are discarded, since the remote side
/// may race with a local action.
pub struct CallStateMachine {
    id: PeerId,
    phase: Phase,
    timeouts: RingTimeouts,
    timer: TimeoutScheduler,
    sessions: Box<dyn PeerSessionFactory>,
    session_event_chan: mpsc::UnboundedSender<SessionEvent>,
    next_generation: SessionGeneration,
    /// media switched off by the user. applied to sessions created later too
    media: HashMap<MediaKind, bool>,
    emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
}

impl CallStateMachine {
    pub fn new(args: MachineArgs) -> Self {
        Self {
            id: args.id,
            phase: Phase::New,
            timeouts: args.timeouts,
            timer: TimeoutScheduler::new(args.timer_chan),
            sessions: args.sessions,
            session_event_chan: args.session_event_chan,
            next_generation: 0,
            media: HashMap::new(),
            emitted_event_chan: args.emitted_event_chan,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.phase.view()
    }

    pub fn has_session(&self) -> bool {
        matches!(self.phase, Phase::OnCall { session: Some(_), .. })
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn on_transport_opened(&mut self) {
        if matches!(self.phase, Phase::New) {
            self.enter(Phase::WaitingForCall);
        }
    }

    /// the relay went away. any call is released
    pub fn on_transport_fault(&mut self, event: TransientEvent) {
        log::error!("transport fault: {}", event);
        if !matches!(self.phase, Phase::New | Phase::WaitingForCall) {
            self.enter(Phase::WaitingForCall);
        }
        self.notify(event);
    }

    pub fn on_message_received(&mut self, msg: SignalMessage) {
        if matches!(self.phase, Phase::New) {
            log::debug!("dropping {} received before the transport opened", msg.message_type);
            return;
        }
        // lookup replies are addressed by the identity that was looked up
        let lookup_reply = matches!(
            msg.message_type,
            MessageType::UserOnline | MessageType::UserOffline
        );
        if !lookup_reply && msg.target != self.id {
            log::debug!("dropping {} addressed to {}", msg.message_type, msg.target);
            return;
        }

        match msg.message_type {
            MessageType::FindUser => {
                log::debug!("dropping FindUser from {}", msg.sender);
            }
            MessageType::UserOnline => {
                let timer = self.timer.arm(self.timeouts.outgoing);
                self.set_phase(Phase::CallingTarget {
                    target: msg.target.clone(),
                    timer,
                });
                self.signal(MessageType::StartCall, &msg.target, None);
            }
            MessageType::UserOffline => {
                self.enter(Phase::UserOffline(msg.target.clone()));
                self.notify(TransientEvent::UserOffline(msg.target));
            }
            MessageType::StartCall => {
                if matches!(self.phase, Phase::OnCall { .. }) {
                    log::info!("busy, rejecting call from {}", msg.sender);
                    self.signal(MessageType::RejectCall, &msg.sender, None);
                } else {
                    let timer = self.timer.arm(self.timeouts.incoming);
                    self.set_phase(Phase::ReceivedCall {
                        sender: msg.sender,
                        timer,
                    });
                }
            }
            MessageType::AcceptCall => match &self.phase {
                Phase::CallingTarget { target, .. } if *target == msg.sender => {
                    self.enter(Phase::OnCall {
                        peer: msg.sender,
                        session: None,
                    });
                    if let Some(live) = self.start_session() {
                        live.session.offer();
                    }
                }
                _ => self.discard(&msg),
            },
            MessageType::RejectCall => {
                self.enter(Phase::WaitingForCall);
                self.notify(TransientEvent::Rejected);
            }
            MessageType::Offer => {
                let Some(sdp) = msg.payload else {
                    log::warn!("dropping Offer from {} without a description", msg.sender);
                    return;
                };
                if matches!(&self.phase, Phase::OnCall { peer, .. } if *peer != msg.sender) {
                    log::info!("busy, rejecting offer from {}", msg.sender);
                    self.signal(MessageType::RejectCall, &msg.sender, None);
                    return;
                }
                let live = if self.live_session(&msg.sender).is_some() {
                    // renegotiation with the current peer
                    self.live_session(&msg.sender)
                } else {
                    if !matches!(self.phase, Phase::OnCall { .. }) {
                        self.enter(Phase::OnCall {
                            peer: msg.sender.clone(),
                            session: None,
                        });
                    }
                    self.start_session()
                };
                if let Some(live) = live {
                    live.session.apply_remote(SessionDescription::offer(sdp));
                    live.session.answer();
                }
            }
            MessageType::Answer => {
                let Some(sdp) = msg.payload else {
                    log::warn!("dropping Answer from {} without a description", msg.sender);
                    return;
                };
                match self.live_session(&msg.sender) {
                    Some(live) => live.session.apply_remote(SessionDescription::answer(sdp)),
                    None => log::debug!("dropping Answer from {}: no session", msg.sender),
                }
            }
            MessageType::ICE => {
                let Some(candidate) = msg.payload else {
                    log::warn!("dropping ICE from {} without a candidate", msg.sender);
                    return;
                };
                match self.live_session(&msg.sender) {
                    Some(live) => live.session.add_ice_candidate(candidate),
                    None => log::debug!("dropping ICE from {}: no session", msg.sender),
                }
            }
            MessageType::EndCall => {
                self.enter(Phase::WaitingForCall);
            }
        }
    }

    /// looks `target` up on the relay. a `UserOnline` reply starts the call
    pub fn place_call(&mut self, target: &str) -> Result<(), CallError> {
        let target = target.trim();
        if target.is_empty() {
            self.notify(TransientEvent::EmptyTarget);
            return Err(CallError::EmptyTarget);
        }
        if target == self.id {
            self.notify(TransientEvent::SelfCall);
            return Err(CallError::SelfCallRejected);
        }
        if matches!(self.phase, Phase::New) {
            return Err(CallError::NotConnected);
        }
        self.enter(Phase::WaitingForCall);
        self.signal(MessageType::FindUser, target, None);
        Ok(())
    }

    pub fn accept_incoming_call(&mut self, sender: &str) -> Result<(), CallError> {
        match &self.phase {
            Phase::ReceivedCall { sender: s, .. } if s == sender => {
                self.enter(Phase::OnCall {
                    peer: sender.to_string(),
                    session: None,
                });
                // the caller's Offer is applied to this session
                self.start_session();
                self.signal(MessageType::AcceptCall, sender, None);
                Ok(())
            }
            _ => Err(CallError::NoIncomingCall(sender.to_string())),
        }
    }

    pub fn reject_incoming_call(&mut self, sender: &str) -> Result<(), CallError> {
        match &self.phase {
            Phase::ReceivedCall { sender: s, .. } if s == sender => {
                self.enter(Phase::WaitingForCall);
                self.signal(MessageType::RejectCall, sender, None);
                Ok(())
            }
            _ => Err(CallError::NoIncomingCall(sender.to_string())),
        }
    }

    /// the incoming-call prompt went away without an answer
    pub fn dismiss_incoming_call(&mut self) {
        if !matches!(self.phase, Phase::New) {
            self.enter(Phase::WaitingForCall);
        }
    }

    pub fn hang_up(&mut self) -> Result<(), CallError> {
        let peer = match &self.phase {
            Phase::CallingTarget { target, .. } => target.clone(),
            Phase::OnCall { peer, .. } => peer.clone(),
            _ => return Err(CallError::NotInCall),
        };
        self.signal(MessageType::EndCall, &peer, None);
        self.enter(Phase::WaitingForCall);
        Ok(())
    }

    /// no state change. remembered for sessions created later
    pub fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        self.media.insert(kind, enabled);
        if let Phase::OnCall {
            session: Some(live),
            ..
        } = &mut self.phase
        {
            live.session.set_media_enabled(kind, enabled);
        }
    }

    pub fn on_timeout(&mut self, id: TimerId) {
        if !self.timer.fired(id) {
            log::debug!("ignoring stale timeout");
            return;
        }
        match self.phase {
            Phase::CallingTarget { .. } | Phase::ReceivedCall { .. } => {
                log::info!("call timed out in state {}", self.phase.view());
                self.enter(Phase::WaitingForCall);
                self.notify(TransientEvent::TimedOut);
            }
            _ => log::warn!("timeout fired outside of a ringing state"),
        }
    }

    pub fn on_session_event(&mut self, event: SessionEvent) {
        let peer = match &self.phase {
            Phase::OnCall {
                peer,
                session: Some(live),
            } if live.generation == event.generation => peer.clone(),
            _ => {
                log::debug!("dropping event from stale session {}", event.generation);
                return;
            }
        };
        match event.kind {
            SessionEventKind::LocalSdp(description) => {
                let message_type = match description.kind {
                    SdpKind::Offer => MessageType::Offer,
                    SdpKind::Answer => MessageType::Answer,
                };
                self.signal(message_type, &peer, Some(description.sdp));
            }
            SessionEventKind::LocalIce(candidate) => {
                self.signal(MessageType::ICE, &peer, Some(candidate));
            }
            SessionEventKind::Disconnected => {
                self.notify(TransientEvent::ConnectionLost(peer));
            }
            SessionEventKind::Failed(e) => {
                log::warn!("negotiation with {} failed: {}", peer, e);
            }
        }
    }

    // creates a session for the current OnCall phase, superseding any existing one
    fn start_session(&mut self) -> Option<&mut LiveSession> {
        let Phase::OnCall { peer, session } = &mut self.phase else {
            return None;
        };
        // the old session must be gone before the new one exists
        *session = None;
        self.next_generation += 1;
        let generation = self.next_generation;
        let mut created = match self
            .sessions
            .create(generation, self.session_event_chan.clone())
        {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to create peer session for {}: {}", peer, e);
                return None;
            }
        };
        for (kind, enabled) in &self.media {
            created.set_media_enabled(*kind, *enabled);
        }
        log::debug!("created peer session {} for {}", generation, peer);
        Some(session.insert(LiveSession {
            generation,
            session: created,
        }))
    }

    fn live_session(&mut self, peer: &str) -> Option<&mut LiveSession> {
        match &mut self.phase {
            Phase::OnCall {
                peer: p,
                session: Some(live),
            } if p == peer => Some(live),
            _ => None,
        }
    }

    // cancels the running timer, then moves on
    fn enter(&mut self, next: Phase) {
        self.timer.cancel();
        self.set_phase(next);
    }

    fn set_phase(&mut self, next: Phase) {
        let before = self.phase.view();
        // the previous phase is dropped here, releasing its session
        self.phase = next;
        let after = self.phase.view();
        if before != after {
            log::info!("{} -> {}", before, after);
            self.emit(EmittedEvents::StateChanged(after));
        }
    }

    fn signal(&self, message_type: MessageType, target: &str, payload: Option<String>) {
        let msg = SignalMessage {
            message_type,
            sender: self.id.clone(),
            target: target.to_string(),
            payload,
        };
        self.emit(EmittedEvents::Signal(msg));
    }

    fn notify(&self, event: TransientEvent) {
        self.emit(EmittedEvents::Transient(event));
    }

    fn emit(&self, event: EmittedEvents) {
        if let Err(e) = self.emitted_event_chan.send(event) {
            log::error!("failed to emit event: {}", e);
        }
    }

    fn discard(&self, msg: &SignalMessage) {
        log::debug!(
            "dropping {} from {} in state {}",
            msg.message_type,
            msg.sender,
            self.phase.view()
        );
    }
}
