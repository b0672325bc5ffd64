use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

mod internal;

// public exports
pub use internal::config::{Config, RingTimeouts};
pub use internal::data_types::*;
pub use internal::errors::*;
pub use internal::events::{EmittedEvents, SessionEvent, SessionEventKind, TransportEvent};
pub use internal::rtc_session::{LocalTrack, RtcSession, RtcSessionFactory};
pub use internal::session::{PeerSession, PeerSessionFactory, SessionGeneration};
pub use internal::signal::{MessageType, SignalMessage};
pub use internal::state_machine::{CallStateMachine, MachineArgs};
pub use internal::timeout::{TimeoutScheduler, TimerId};
pub use internal::transport::{SignalTransport, WebSocketTransport};

#[cfg(test)]
mod testing;

/// simple-call
/// Lets two peers find each other through a signaling relay and set up a one-to-one
/// call over WebRTC.
///
/// The `Controller` owns the call lifecycle. It forwards relay messages, user actions, timer
/// fires and peer-session completions into one `CallStateMachine`, one at a time, and
/// forwards what the machine emits back out to the relay and to subscribers.
///
/// This library is not responsible for media capture or rendering. Local tracks are handed to
/// the `RtcSessionFactory`; remote tracks come out of it.
pub struct Controller {
    /// client's id
    id: PeerId,
    /// used to drive the dispatcher
    cmd_tx: mpsc::UnboundedSender<InternalCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    updates_tx: broadcast::Sender<Update>,
    task_handle: Option<JoinHandle<()>>,
}

// a lazy version of the builder pattern
pub struct InitArgs {
    pub id: PeerId,
    pub config: Config,
    pub transport: Box<dyn SignalTransport>,
    pub sessions: Box<dyn PeerSessionFactory>,
}

/// what subscribers observe, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    State(ConnectionState),
    Event(TransientEvent),
}

/// a live view of the controller. transient events from before `subscribe` are not replayed
pub struct Subscription {
    /// the state at the time of subscribing
    pub initial: ConnectionState,
    updates: broadcast::Receiver<Update>,
}

impl Subscription {
    /// None once the controller has stopped
    pub async fn next(&mut self) -> Option<Update> {
        loop {
            match self.updates.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("subscriber lagged, skipped {} updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

const UPDATE_BUFFER: usize = 64;

enum InternalCmd {
    Connect {
        response: oneshot::Sender<Result<()>>,
    },
    PlaceCall {
        target: PeerId,
        response: oneshot::Sender<Result<(), CallError>>,
    },
    AcceptCall {
        sender: PeerId,
        response: oneshot::Sender<Result<(), CallError>>,
    },
    RejectCall {
        sender: PeerId,
        response: oneshot::Sender<Result<(), CallError>>,
    },
    DismissCall {
        response: oneshot::Sender<()>,
    },
    HangUp {
        response: oneshot::Sender<Result<(), CallError>>,
    },
    SetMediaEnabled {
        kind: MediaKind,
        enabled: bool,
        response: oneshot::Sender<()>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// The following functions are driven by the UI:
/// connect
/// place_call
/// accept_incoming_call
/// reject_incoming_call
/// dismiss_incoming_call
/// hang_up
/// set_media_enabled
///
/// Everything else arrives through the transport, the timer, or the peer session
impl Controller {
    /// must be called from within a tokio runtime
    pub fn init(args: InitArgs) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (emitted_tx, emitted_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER);

        let machine = CallStateMachine::new(MachineArgs {
            id: args.id.clone(),
            timeouts: args.config.timeouts(),
            sessions: args.sessions,
            session_event_chan: session_tx,
            timer_chan: timer_tx,
            emitted_event_chan: emitted_tx,
        });

        let dispatcher = Dispatcher {
            machine,
            transport: args.transport,
            endpoint: args.config.endpoint(&args.id),
            cmd_rx,
            emitted_rx,
            transport_tx,
            transport_rx,
            timer_rx,
            session_rx,
            state_tx,
            updates_tx: updates_tx.clone(),
        };
        let task_handle = tokio::spawn(dispatcher.run());

        Self {
            id: args.id,
            cmd_tx,
            state_rx,
            updates_tx,
            task_handle: Some(task_handle),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        // the dispatcher broadcasts state changes while holding the watch lock, so no change
        // can land between reading the state and subscribing
        let state = self.state_rx.borrow();
        let updates = self.updates_tx.subscribe();
        Subscription {
            initial: state.clone(),
            updates,
        }
    }

    /// opens the relay connection. the state becomes `WaitingForCall` once it is open
    pub async fn connect(&self) -> Result<()> {
        self.request(|response| InternalCmd::Connect { response })
            .await?
    }

    pub async fn place_call(&self, target: &str) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|response| InternalCmd::PlaceCall { target, response })
            .await?
    }

    pub async fn accept_incoming_call(&self, sender: &str) -> Result<(), CallError> {
        let sender = sender.to_string();
        self.request(|response| InternalCmd::AcceptCall { sender, response })
            .await?
    }

    pub async fn reject_incoming_call(&self, sender: &str) -> Result<(), CallError> {
        let sender = sender.to_string();
        self.request(|response| InternalCmd::RejectCall { sender, response })
            .await?
    }

    pub async fn dismiss_incoming_call(&self) -> Result<(), CallError> {
        self.request(|response| InternalCmd::DismissCall { response })
            .await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|response| InternalCmd::HangUp { response })
            .await?
    }

    /// switches local audio or video. does not affect the call state
    pub async fn set_media_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        self.request(|response| InternalCmd::SetMediaEnabled {
            kind,
            enabled,
            response,
        })
        .await
    }

    /// hangs up any call, closes the transport and stops the dispatcher
    pub async fn deinit(&mut self) -> Result<()> {
        if self
            .request(|response| InternalCmd::Shutdown { response })
            .await
            .is_err()
        {
            log::debug!("controller already stopped");
        }
        if let Some(handle) = self.task_handle.take() {
            handle.await?;
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<T>) -> InternalCmd,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(cmd(tx)).map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)
    }
}

/// the serialized execution context. owns the machine and the transport
struct Dispatcher {
    machine: CallStateMachine,
    transport: Box<dyn SignalTransport>,
    endpoint: String,
    cmd_rx: mpsc::UnboundedReceiver<InternalCmd>,
    emitted_rx: mpsc::UnboundedReceiver<EmittedEvents>,
    // kept so the transport channel never closes between connections
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerId>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    updates_tx: broadcast::Sender<Update>,
}

impl Dispatcher {
    async fn run(mut self) {
        log::debug!("dispatcher started for {}", self.machine.id());
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(InternalCmd::Shutdown { response }) => {
                        self.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event),
                Some(id) = self.timer_rx.recv() => self.machine.on_timeout(id),
                Some(event) = self.session_rx.recv() => self.machine.on_session_event(event),
            }
            self.flush();
        }
        log::debug!("dispatcher stopped");
    }

    // every response is sent after the emitted events were forwarded
    async fn handle_cmd(&mut self, cmd: InternalCmd) {
        match cmd {
            InternalCmd::Connect { response } => {
                let r = self
                    .transport
                    .connect(&self.endpoint, self.transport_tx.clone())
                    .await;
                if let Err(e) = &r {
                    log::error!("failed to connect to {}: {}", self.endpoint, e);
                    self.machine
                        .on_transport_fault(TransientEvent::TransportError(e.to_string()));
                }
                self.flush();
                let _ = response.send(r);
            }
            InternalCmd::PlaceCall { target, response } => {
                let r = self.machine.place_call(&target);
                self.flush();
                let _ = response.send(r);
            }
            InternalCmd::AcceptCall { sender, response } => {
                let r = self.machine.accept_incoming_call(&sender);
                self.flush();
                let _ = response.send(r);
            }
            InternalCmd::RejectCall { sender, response } => {
                let r = self.machine.reject_incoming_call(&sender);
                self.flush();
                let _ = response.send(r);
            }
            InternalCmd::DismissCall { response } => {
                self.machine.dismiss_incoming_call();
                self.flush();
                let _ = response.send(());
            }
            InternalCmd::HangUp { response } => {
                let r = self.machine.hang_up();
                self.flush();
                let _ = response.send(r);
            }
            InternalCmd::SetMediaEnabled {
                kind,
                enabled,
                response,
            } => {
                self.machine.set_media_enabled(kind, enabled);
                let _ = response.send(());
            }
            InternalCmd::Shutdown { response } => {
                // handled by run
                let _ = response.send(());
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.machine.on_transport_opened(),
            TransportEvent::Closed => self
                .machine
                .on_transport_fault(TransientEvent::TransportClosed),
            TransportEvent::Error(e) => self
                .machine
                .on_transport_fault(TransientEvent::TransportError(e)),
            TransportEvent::Message(frame) => match SignalMessage::decode(&frame) {
                Ok(msg) => {
                    log::debug!("received {} from {}", msg.message_type, msg.sender);
                    self.machine.on_message_received(msg);
                }
                Err(e) => log::warn!("dropping signal: {}", e),
            },
        }
    }

    // forwards everything the machine emitted
    fn flush(&mut self) {
        loop {
            let mut send_failure = None;
            while let Ok(event) = self.emitted_rx.try_recv() {
                match event {
                    EmittedEvents::Signal(msg) => {
                        log::debug!("sending {} to {}", msg.message_type, msg.target);
                        if let Err(e) = self.transport.send(msg.encode()) {
                            log::error!("failed to send {}: {}", msg.message_type, e);
                            send_failure.get_or_insert_with(|| e.to_string());
                        }
                    }
                    EmittedEvents::StateChanged(state) => {
                        let updates_tx = &self.updates_tx;
                        // published under the watch lock, see Controller::subscribe
                        self.state_tx.send_modify(|current| {
                            *current = state.clone();
                            let _ = updates_tx.send(Update::State(state));
                        });
                    }
                    EmittedEvents::Transient(event) => {
                        let _ = self.updates_tx.send(Update::Event(event));
                    }
                }
            }
            // one fault per flush, however many frames failed
            match send_failure {
                Some(e) => self
                    .machine
                    .on_transport_fault(TransientEvent::TransportError(e)),
                None => break,
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.machine.hang_up().is_ok() {
            log::info!("hung up on shutdown");
        }
        self.flush();
        self.transport.close().await;
    }
}
