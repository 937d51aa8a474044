//! Session controller: the single owner of the relay connection and the
//! current negotiation session.
//!
//! Runs as one tokio task. UI commands, signaling events, negotiation
//! completions and media acquisitions all re-enter the same `select!` loop,
//! so state is only ever mutated from here.

mod chat;
mod state;

use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

pub use chat::{ChatAuthor, ChatEntry, ChatLog};
pub use state::{SessionEvent, SessionSnapshot, SessionState};

use crate::config::{ClientConfig, MediaMode};
use crate::media::{Acquisition, AcquireOutcome, CaptureDevice, MediaSourceManager, MediaState};
use crate::negotiation::{
    EngineMessage, EngineOutput, NegotiationRole, PeerNegotiationEngine, PeerTransportFactory,
    RemoteTrack,
};
use crate::protocol::{Envelope, Presence, PresenceEvent, ProtocolViolation};
use crate::transport::{SignalingConnector, SignalingEvent, SignalingTransport, StampedEvent};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_WAITING: &str = "Connected. Waiting for a partner...";
pub const STATUS_RECONNECTING: &str = "Reconnecting...";
pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_SERVER_GONE: &str = "Disconnected from server.";
pub const STATUS_CONNECTION_ERROR: &str = "Connection error.";
const NOTICE_CONNECTED: &str = "Connected to server.";
const NOTICE_PARTNER_CONNECTED: &str = "Stranger connected!";
const NOTICE_PARTNER_DISCONNECTED: &str = "Stranger disconnected.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("no identity to reconnect with")]
    NotConnected,
    #[error("display name must not be empty")]
    EmptyIdentity,
    #[error("session controller has stopped")]
    ControllerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("no partner to chat with")]
    NotActive,
    #[error("message is empty")]
    Empty,
    #[error("signaling transport is not open")]
    TransportUnavailable,
    #[error("session controller has stopped")]
    ControllerStopped,
}

enum Command {
    Connect {
        identity: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    FindNewPartner {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    SetAudioEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetVideoEnabled {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetMediaMode {
        mode: MediaMode,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running [`SessionController`]. Every call
/// returns once the controller has applied it.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn connect(&self, identity: impl Into<String>) -> Result<(), SessionError> {
        let identity = identity.into();
        self.request(|reply| Command::Connect { identity, reply })
            .await
            .unwrap_or(Err(SessionError::ControllerStopped))
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply })
            .await
            .ok_or(SessionError::ControllerStopped)
    }

    pub async fn find_new_partner(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::FindNewPartner { reply })
            .await
            .unwrap_or(Err(SessionError::ControllerStopped))
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), ChatError> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply })
            .await
            .unwrap_or(Err(ChatError::ControllerStopped))
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.request(|reply| Command::SetAudioEnabled { enabled, reply })
            .await
            .ok_or(SessionError::ControllerStopped)
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.request(|reply| Command::SetVideoEnabled { enabled, reply })
            .await
            .ok_or(SessionError::ControllerStopped)
    }

    pub async fn set_media_mode(&self, mode: MediaMode) -> Result<(), SessionError> {
        self.request(|reply| Command::SetMediaMode { mode, reply })
            .await
            .ok_or(SessionError::ControllerStopped)
    }

    /// Tears everything down and stops the controller task.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

pub struct SessionController {
    config: ClientConfig,
    state: SessionState,
    status: String,
    identity: Option<String>,
    chat: ChatLog,
    partner_present: bool,
    remote_tracks: Vec<RemoteTrack>,
    media_hint: Option<String>,
    media_mode: MediaMode,

    transport: SignalingTransport,
    signaling_epoch: Option<u64>,
    signaling_rx: mpsc::UnboundedReceiver<StampedEvent>,

    engine: PeerNegotiationEngine,
    engine_rx: mpsc::UnboundedReceiver<EngineMessage>,

    media: MediaSourceManager,
    acquisition_tx: mpsc::UnboundedSender<Acquisition>,
    acquisition_rx: mpsc::UnboundedReceiver<Acquisition>,
    acquisition_task: Option<JoinHandle<()>>,

    commands: mpsc::Receiver<Command>,
    reconnect: Option<Pin<Box<Sleep>>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn SignalingConnector>,
        device: Arc<dyn CaptureDevice>,
        peers: Arc<dyn PeerTransportFactory>,
    ) -> (Self, SessionHandle) {
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let transport = SignalingTransport::new(
            connector,
            config.server_url.clone(),
            config.chat_wire,
            config.connect_timeout,
            signaling_tx,
        );
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = PeerNegotiationEngine::new(peers, engine_tx);
        let (acquisition_tx, acquisition_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let initial = SessionSnapshot {
            media_mode: config.media_mode,
            ..SessionSnapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            events: events_tx.clone(),
        };
        let controller = Self {
            media_mode: config.media_mode,
            config,
            state: SessionState::Disconnected,
            status: STATUS_DISCONNECTED.to_string(),
            identity: None,
            chat: ChatLog::default(),
            partner_present: false,
            remote_tracks: Vec::new(),
            media_hint: None,
            transport,
            signaling_epoch: None,
            signaling_rx,
            engine,
            engine_rx,
            media: MediaSourceManager::new(device),
            acquisition_tx,
            acquisition_rx,
            acquisition_task: None,
            commands,
            reconnect: None,
            snapshot_tx,
            events_tx,
        };
        (controller, handle)
    }

    /// Builds a controller and runs it on its own task.
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn SignalingConnector>,
        device: Arc<dyn CaptureDevice>,
        peers: Arc<dyn PeerTransportFactory>,
    ) -> SessionHandle {
        let (controller, handle) = Self::new(config, connector, device, peers);
        tokio::spawn(controller.run());
        handle
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => break,
                },
                Some(stamped) = self.signaling_rx.recv() => self.handle_signaling(stamped).await,
                Some(message) = self.engine_rx.recv() => self.handle_engine(message),
                Some(acquisition) = self.acquisition_rx.recv() => self.handle_acquisition(acquisition),
                _ = reconnect_elapsed(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.reopen();
                }
            }
        }
        self.shutdown().await;
    }

    /// Returns `false` once the controller should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { identity, reply } => {
                let _ = reply.send(self.connect(identity));
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::FindNewPartner { reply } => {
                let _ = reply.send(self.find_new_partner().await);
            }
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text));
            }
            Command::SetAudioEnabled { enabled, reply } => {
                self.media.set_audio_enabled(enabled);
                self.publish();
                let _ = reply.send(());
            }
            Command::SetVideoEnabled { enabled, reply } => {
                self.media.set_video_enabled(enabled);
                self.publish();
                let _ = reply.send(());
            }
            Command::SetMediaMode { mode, reply } => {
                self.set_media_mode(mode);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, identity: String) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        let identity = identity.trim().to_string();
        if identity.is_empty() {
            return Err(SessionError::EmptyIdentity);
        }
        tracing::info!(target = "room404::session", %identity, "connecting");
        self.identity = Some(identity.clone());
        self.set_state(SessionState::Connecting);
        self.set_status(STATUS_CONNECTING);
        self.signaling_epoch = Some(self.transport.open(&identity));
        self.start_media();
        self.publish();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.signaling_epoch = None;
        self.reconnect = None;
        self.teardown_negotiation().await;
        self.transport.close();
        self.clear_chat();
        self.release_media();
        self.set_state(SessionState::Disconnected);
        self.set_status(STATUS_DISCONNECTED);
        self.publish();
    }

    async fn find_new_partner(&mut self) -> Result<(), SessionError> {
        if self.identity.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.signaling_epoch = None;
        self.teardown_negotiation().await;
        self.transport.close();
        self.clear_chat();
        self.set_state(SessionState::Connecting);
        self.set_status(STATUS_RECONNECTING);
        self.reconnect = Some(Box::pin(tokio::time::sleep(self.config.reconnect_delay)));
        // A refused device is only asked again through set_media_mode.
        if !matches!(self.media.state(), MediaState::Failed(_)) {
            self.start_media();
        }
        self.publish();
        Ok(())
    }

    fn reopen(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        tracing::info!(target = "room404::session", %identity, "reopening signaling");
        self.signaling_epoch = Some(self.transport.open(&identity));
    }

    fn send_message(&mut self, text: String) -> Result<(), ChatError> {
        if self.state != SessionState::Active {
            return Err(ChatError::NotActive);
        }
        if text.trim().is_empty() {
            return Err(ChatError::Empty);
        }
        if !self.transport.send(&Envelope::Chat(text.clone())) {
            return Err(ChatError::TransportUnavailable);
        }
        self.append(ChatAuthor::Local, text);
        self.publish();
        Ok(())
    }

    fn set_media_mode(&mut self, mode: MediaMode) {
        if self.media_mode == mode {
            let retry = mode == MediaMode::AudioVideo
                && self.state != SessionState::Disconnected
                && matches!(self.media.state(), MediaState::Failed(_));
            if retry {
                tracing::info!(target = "room404::session", "retrying local media");
                self.start_media();
                self.publish();
            }
            return;
        }
        self.media_mode = mode;
        tracing::info!(target = "room404::session", ?mode, "media mode changed");
        match mode {
            MediaMode::TextOnly => {
                self.release_media();
                self.media_hint = None;
            }
            MediaMode::AudioVideo => {
                if self.state != SessionState::Disconnected {
                    self.start_media();
                }
            }
        }
        self.publish();
    }

    async fn handle_signaling(&mut self, stamped: StampedEvent) {
        if self.signaling_epoch != Some(stamped.epoch) {
            tracing::debug!(
                target = "room404::session",
                epoch = stamped.epoch,
                current = ?self.signaling_epoch,
                "dropping stale signaling event"
            );
            return;
        }
        match stamped.event {
            SignalingEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.set_state(SessionState::WaitingForPartner);
                    self.set_status(STATUS_WAITING);
                    self.append(ChatAuthor::System, NOTICE_CONNECTED);
                }
            }
            SignalingEvent::Envelope(envelope) => self.handle_envelope(envelope).await,
            SignalingEvent::Closed => self.transport_lost(false).await,
            SignalingEvent::Errored(reason) => {
                tracing::warn!(target = "room404::session", %reason, "signaling failed");
                self.transport_lost(true).await;
            }
        }
        self.publish();
    }

    async fn transport_lost(&mut self, errored: bool) {
        self.signaling_epoch = None;
        let was_connecting = self.state == SessionState::Connecting;
        self.teardown_negotiation().await;
        self.partner_present = false;
        self.set_state(SessionState::Disconnected);
        if errored || was_connecting {
            self.set_status(STATUS_CONNECTION_ERROR);
        } else {
            self.set_status(STATUS_SERVER_GONE);
            self.append(ChatAuthor::System, STATUS_SERVER_GONE);
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Chat(text) => {
                if self.state == SessionState::Active {
                    self.append(ChatAuthor::Partner, text);
                } else {
                    tracing::debug!(target = "room404::session", state = %self.state, "dropping chat outside an active session");
                }
            }
            Envelope::Notice(text) => {
                if !text.is_empty() {
                    self.set_status(text.clone());
                    self.append(ChatAuthor::System, text);
                }
            }
            Envelope::Presence(presence) => self.handle_presence(presence).await,
            Envelope::Offer(sdp) => {
                if let Err(violation) = self.engine.handle_offer(sdp) {
                    self.violation(violation);
                }
            }
            Envelope::Answer(sdp) => {
                if let Err(violation) = self.engine.handle_answer(sdp) {
                    self.violation(violation);
                }
            }
            Envelope::IceCandidate(candidate) => {
                if let Err(violation) = self.engine.handle_ice_candidate(candidate) {
                    self.violation(violation);
                }
            }
        }
    }

    async fn handle_presence(&mut self, presence: Presence) {
        if let Some(textual) = presence.text_disagrees {
            self.violation(ProtocolViolation::PresenceDisagreement {
                structured: presence.event,
                textual,
            });
        }
        match presence.event {
            PresenceEvent::PartnerConnected => {
                match self.state {
                    SessionState::WaitingForPartner | SessionState::Active => {}
                    other => {
                        tracing::debug!(target = "room404::session", state = %other, "ignoring partner presence");
                        return;
                    }
                }
                if self.state == SessionState::Active {
                    tracing::info!(target = "room404::session", "re-paired while active; replacing negotiation session");
                    self.teardown_negotiation().await;
                }
                let role = NegotiationRole::from_initiator_flag(presence.initiator);
                self.partner_present = true;
                self.set_state(SessionState::PartnerPresent);
                let notice = presence
                    .message
                    .unwrap_or_else(|| NOTICE_PARTNER_CONNECTED.to_string());
                self.set_status(notice.clone());
                self.append(ChatAuthor::System, notice);
                let local = self.media.local().cloned();
                self.engine.start(role, local).await;
                self.set_state(SessionState::Active);
            }
            PresenceEvent::PartnerDisconnected => {
                if !matches!(
                    self.state,
                    SessionState::Active | SessionState::PartnerPresent
                ) {
                    tracing::debug!(target = "room404::session", state = %self.state, "ignoring partner departure");
                    return;
                }
                self.set_state(SessionState::PartnerLost);
                self.teardown_negotiation().await;
                self.partner_present = false;
                self.clear_chat();
                let notice = presence
                    .message
                    .unwrap_or_else(|| NOTICE_PARTNER_DISCONNECTED.to_string());
                self.set_status(notice.clone());
                self.append(ChatAuthor::System, notice);
                self.set_state(SessionState::WaitingForPartner);
            }
        }
    }

    fn handle_engine(&mut self, message: EngineMessage) {
        for output in self.engine.handle_message(message) {
            match output {
                EngineOutput::Signal(envelope) => {
                    if !self.transport.send(&envelope) {
                        tracing::debug!(target = "room404::session", kind = envelope.kind(), "signal not sent; transport closed");
                    }
                }
                EngineOutput::RemoteMediaAvailable(track) => {
                    tracing::info!(target = "room404::session", track = ?track.info, "remote media available");
                    self.remote_tracks.push(track.clone());
                    self.emit(SessionEvent::RemoteMediaAvailable(track));
                }
                EngineOutput::RemoteMediaUnavailable => self.drop_remote_media(),
                EngineOutput::Failed(error) => {
                    self.emit(SessionEvent::NegotiationFailed(error));
                }
            }
        }
        self.publish();
    }

    fn handle_acquisition(&mut self, acquisition: Acquisition) {
        self.acquisition_task = None;
        match self.media.complete_acquire(acquisition) {
            AcquireOutcome::Ready(media) => {
                self.media_hint = None;
                self.emit(SessionEvent::LocalMediaReady);
                self.engine.attach_local_media(media);
            }
            AcquireOutcome::Failed(error) => {
                self.media_hint = Some(format!(
                    "Camera or microphone unavailable ({error}); continuing without local media."
                ));
                self.emit(SessionEvent::LocalMediaFailed(error));
            }
            AcquireOutcome::Stale => {}
        }
        self.publish();
    }

    fn start_media(&mut self) {
        if self.media_mode == MediaMode::TextOnly {
            return;
        }
        if let Some(pending) = self.media.begin_acquire() {
            let tx = self.acquisition_tx.clone();
            self.acquisition_task = Some(tokio::spawn(async move {
                let _ = tx.send(pending.await);
            }));
        }
    }

    fn release_media(&mut self) {
        if let Some(task) = self.acquisition_task.take() {
            task.abort();
        }
        self.media.release();
    }

    async fn teardown_negotiation(&mut self) {
        if let Some(report) = self.engine.teardown().await {
            self.emit(SessionEvent::NegotiationTornDown {
                generation: report.generation,
            });
        }
        self.partner_present = false;
        self.drop_remote_media();
    }

    fn drop_remote_media(&mut self) {
        if self.remote_tracks.is_empty() {
            return;
        }
        self.remote_tracks.clear();
        tracing::info!(target = "room404::session", "remote media unavailable");
        self.emit(SessionEvent::RemoteMediaUnavailable);
    }

    async fn shutdown(&mut self) {
        self.signaling_epoch = None;
        self.reconnect = None;
        self.teardown_negotiation().await;
        self.transport.close();
        self.release_media();
        tracing::debug!(target = "room404::session", "session controller stopped");
    }

    fn violation(&self, violation: ProtocolViolation) {
        tracing::warn!(target = "room404::session", %violation, "protocol violation");
        self.emit(SessionEvent::Violation(violation));
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(target = "room404::session", %from, %to, "session state changed");
        self.emit(SessionEvent::StateChanged { from, to });
        if matches!(to, SessionState::PartnerPresent | SessionState::PartnerLost) {
            self.publish();
        }
    }

    fn set_status(&mut self, status: impl Into<String>) {
        let status = status.into();
        if self.status == status {
            return;
        }
        self.status = status.clone();
        self.emit(SessionEvent::Status(status));
    }

    fn append(&mut self, author: ChatAuthor, text: impl Into<String>) {
        let entry = self.chat.push(author, text);
        self.emit(SessionEvent::Chat(entry));
    }

    fn clear_chat(&mut self) {
        if self.chat.is_empty() {
            return;
        }
        self.chat.clear();
        self.emit(SessionEvent::ChatCleared);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state,
            status: self.status.clone(),
            identity: self.identity.clone(),
            partner_present: self.partner_present,
            chat: self.chat.entries().to_vec(),
            media: self.media.tracks(),
            media_mode: self.media_mode,
            local_media: self.media.local().cloned(),
            remote_tracks: self.remote_tracks.clone(),
            media_hint: self.media_hint.clone(),
            negotiation: self.engine.negotiation(),
        });
    }
}

async fn reconnect_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{DeniedDevice, GatedDevice};
    use crate::negotiation::mock::ScriptedPeerFactory;
    use crate::negotiation::{MediaKind, PeerEvent, RemoteTrackInfo};
    use crate::protocol::{IceCandidate, SessionDescription};
    use crate::transport::mock::{Journal, MemoryConnector, RelaySide};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Rig {
        handle: SessionHandle,
        relays: mpsc::UnboundedReceiver<RelaySide>,
        connector: MemoryConnector,
        peers: ScriptedPeerFactory,
        journal: Journal,
    }

    fn rig_with(device: Arc<dyn CaptureDevice>) -> Rig {
        let journal = Journal::default();
        let (connector, relays) = MemoryConnector::new();
        connector.record_into(Arc::clone(&journal));
        let peers = ScriptedPeerFactory::with_journal(Arc::clone(&journal));
        let config = ClientConfig::default().with_reconnect_delay(Duration::from_millis(20));
        let handle = SessionController::spawn(
            config,
            Arc::new(connector.clone()),
            device,
            Arc::new(peers.clone()),
        );
        Rig {
            handle,
            relays,
            connector,
            peers,
            journal,
        }
    }

    fn rig() -> Rig {
        rig_with(Arc::new(DeniedDevice::default()))
    }

    impl Rig {
        async fn until(&self, what: &str, check: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
            let mut watch = self.handle.watch();
            let snapshot = tokio::time::timeout(WAIT, watch.wait_for(|s| check(s)))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .expect("controller alive")
                .clone();
            snapshot
        }

        async fn relay(&mut self) -> RelaySide {
            tokio::time::timeout(WAIT, self.relays.recv())
                .await
                .expect("relay connection")
                .expect("connector alive")
        }

        /// Connects as alice and waits for the relay to see the socket.
        async fn waiting(&mut self) -> RelaySide {
            self.handle.connect("alice").await.unwrap();
            let relay = self.relay().await;
            self.until("waiting", |s| s.state == SessionState::WaitingForPartner)
                .await;
            relay
        }

        async fn paired(&mut self, initiator: bool) -> RelaySide {
            let relay = self.waiting().await;
            relay.send(&presence(PresenceEvent::PartnerConnected, initiator));
            self.until("active", |s| s.state == SessionState::Active).await;
            relay
        }
    }

    fn presence(event: PresenceEvent, initiator: bool) -> Envelope {
        Envelope::Presence(Presence {
            event,
            initiator,
            message: None,
            text_disagrees: None,
        })
    }

    async fn next_envelope(relay: &mut RelaySide) -> Envelope {
        tokio::time::timeout(WAIT, relay.recv_envelope())
            .await
            .expect("envelope from client")
            .expect("client link open")
    }

    #[tokio::test]
    async fn initiator_pairing_offer_answer_and_partner_loss() {
        let mut rig = rig();
        let mut relay = rig.paired(true).await;

        assert!(matches!(next_envelope(&mut relay).await, Envelope::Offer(_)));
        relay.send(&Envelope::Answer(SessionDescription::answer("remote-answer")));
        relay.send(&Envelope::Chat("hello alice".into()));

        let sink = rig.peers.last_sink().unwrap();
        sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
            info: RemoteTrackInfo {
                id: "video".into(),
                stream_id: "partner".into(),
                kind: MediaKind::Video,
            },
            handle: None,
        }));
        let snapshot = rig
            .until("remote media", |s| !s.remote_tracks.is_empty())
            .await;
        assert!(snapshot.partner_present);
        assert!(snapshot.media_hint.is_some());

        rig.until("partner chat", |s| {
            s.chat.iter().any(|e| e.author == ChatAuthor::Partner)
        })
        .await;

        let mut events = rig.handle.subscribe();
        relay.send(&Envelope::Presence(Presence {
            event: PresenceEvent::PartnerDisconnected,
            initiator: false,
            message: Some("Stranger disconnected. Click 'New' to find someone else.".into()),
            text_disagrees: None,
        }));
        let snapshot = rig
            .until("waiting again", |s| {
                s.state == SessionState::WaitingForPartner && !s.partner_present
            })
            .await;
        assert_eq!(snapshot.chat.len(), 1);
        assert_eq!(snapshot.chat[0].author, ChatAuthor::System);
        assert!(snapshot.remote_tracks.is_empty());
        assert!(snapshot.negotiation.is_none());
        assert!(rig.peers.entries().contains(&"peer1 close".to_string()));

        let mut states = Vec::new();
        let mut saw_unavailable = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::StateChanged { to, .. } => states.push(to),
                SessionEvent::RemoteMediaUnavailable => saw_unavailable = true,
                _ => {}
            }
        }
        assert_eq!(
            states,
            vec![SessionState::PartnerLost, SessionState::WaitingForPartner]
        );
        assert!(saw_unavailable);
    }

    #[tokio::test]
    async fn chat_requires_active_session() {
        let mut rig = rig();
        let relay = rig.waiting().await;
        let before = rig.handle.snapshot().chat;
        assert_eq!(
            rig.handle.send_message("anyone?").await,
            Err(ChatError::NotActive)
        );
        assert_eq!(rig.handle.snapshot().chat, before);

        relay.send(&presence(PresenceEvent::PartnerConnected, false));
        rig.until("active", |s| s.state == SessionState::Active).await;
        assert_eq!(rig.handle.send_message("   ").await, Err(ChatError::Empty));
        rig.handle.send_message("hi there").await.unwrap();
        let snapshot = rig.handle.snapshot();
        let last = snapshot.chat.last().unwrap();
        assert_eq!(last.author, ChatAuthor::Local);
        assert_eq!(last.text, "hi there");
    }

    #[tokio::test]
    async fn partner_present_keeps_history() {
        let mut rig = rig();
        let relay = rig.waiting().await;
        let before = rig.handle.snapshot().chat.len();
        assert!(before > 0);
        relay.send(&presence(PresenceEvent::PartnerConnected, false));
        let snapshot = rig.until("active", |s| s.state == SessionState::Active).await;
        assert!(snapshot.chat.len() > before);
    }

    #[tokio::test]
    async fn media_toggles_never_offer() {
        let (device, gate) = GatedDevice::new();
        gate.open();
        let mut rig = rig_with(Arc::new(device));
        let mut relay = rig.paired(true).await;
        rig.until("local media", |s| s.local_media.is_some()).await;

        // Answer the first offer and any renegotiation caused by media
        // arriving after it.
        let mut pending = Some(next_envelope(&mut relay).await);
        while let Some(envelope) = pending.take() {
            if matches!(envelope, Envelope::Offer(_)) {
                relay.send(&Envelope::Answer(SessionDescription::answer("remote-answer")));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            pending = relay.try_recv_envelope();
        }

        rig.handle.set_audio_enabled(false).await.unwrap();
        rig.handle.set_video_enabled(false).await.unwrap();
        rig.handle.set_audio_enabled(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(relay.try_recv_envelope().is_none());
        let snapshot = rig.handle.snapshot();
        assert!(snapshot.media.audio_enabled);
        assert!(!snapshot.media.video_enabled);
        assert!(snapshot.local_media.unwrap().audio_flowing());
    }

    #[tokio::test]
    async fn find_new_partner_tears_down_before_reopening() {
        let mut rig = rig();
        let _relay = rig.paired(true).await;
        rig.handle.send_message("bye").await.unwrap();

        rig.handle.find_new_partner().await.unwrap();
        let snapshot = rig.handle.snapshot();
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert_eq!(snapshot.status, STATUS_RECONNECTING);
        assert!(snapshot.chat.is_empty());

        let second = rig.relay().await;
        assert_eq!(second.endpoint.path(), "/ws/alice");
        rig.until("waiting", |s| s.state == SessionState::WaitingForPartner)
            .await;

        let journal = rig.journal.lock().clone();
        let closed = journal.iter().position(|e| e == "peer1 close").unwrap();
        let reopened = journal
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with("connect "))
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert!(closed < reopened, "journal: {journal:?}");
    }

    #[tokio::test]
    async fn refused_media_is_only_retried_on_request() {
        let device = DeniedDevice::default();
        let mut rig = rig_with(Arc::new(device.clone()));
        let _relay = rig.paired(false).await;
        rig.until("media hint", |s| s.media_hint.is_some()).await;
        assert_eq!(device.opens(), 1);

        rig.handle.find_new_partner().await.unwrap();
        let _second = rig.relay().await;
        rig.until("waiting", |s| s.state == SessionState::WaitingForPartner)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(device.opens(), 1);

        rig.handle.set_media_mode(MediaMode::AudioVideo).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while device.opens() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("media retried");
    }

    #[tokio::test]
    async fn disconnect_clears_everything_and_cancels_reopen() {
        let (device, gate) = GatedDevice::new();
        gate.open();
        let mut rig = rig_with(Arc::new(device));
        let _relay = rig.paired(false).await;
        rig.until("local media", |s| s.local_media.is_some()).await;
        let media = rig.handle.snapshot().local_media.unwrap();

        rig.handle.find_new_partner().await.unwrap();
        rig.handle.disconnect().await.unwrap();
        let snapshot = rig.handle.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.status, STATUS_DISCONNECTED);
        assert!(snapshot.chat.is_empty());
        assert!(snapshot.local_media.is_none());
        assert!(media.is_stopped());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rig.relays.try_recv().is_err());
        assert_eq!(rig.handle.snapshot().state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connection_reports_error() {
        let rig = rig();
        rig.connector.refuse_with("no room");
        rig.handle.connect("alice").await.unwrap();
        let snapshot = rig
            .until("disconnected", |s| {
                s.state == SessionState::Disconnected && s.status == STATUS_CONNECTION_ERROR
            })
            .await;
        assert!(snapshot.identity.is_some());
        rig.connector.accept();
        rig.handle.connect("alice").await.unwrap();
    }

    #[tokio::test]
    async fn relay_close_keeps_history() {
        let mut rig = rig();
        let relay = rig.paired(false).await;
        relay.send(&Envelope::Chat("still here?".into()));
        rig.until("partner chat", |s| {
            s.chat.iter().any(|e| e.author == ChatAuthor::Partner)
        })
        .await;
        relay.close();
        let snapshot = rig
            .until("server gone", |s| s.state == SessionState::Disconnected)
            .await;
        assert_eq!(snapshot.status, STATUS_SERVER_GONE);
        assert!(snapshot.chat.iter().any(|e| e.text == "still here?"));
        assert!(rig.peers.entries().contains(&"peer1 close".to_string()));
    }

    #[tokio::test]
    async fn responder_answers_once_and_flags_duplicate() {
        let mut rig = rig();
        let mut relay = rig.paired(false).await;
        let mut events = rig.handle.subscribe();
        for n in 0..3 {
            relay.send(&Envelope::IceCandidate(IceCandidate::new(format!("c{n}"))));
        }
        let offer = Envelope::Offer(SessionDescription::offer("remote-offer"));
        relay.send(&offer);
        relay.send(&offer);
        assert!(matches!(next_envelope(&mut relay).await, Envelope::Answer(_)));

        let violation = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(SessionEvent::Violation(v)) = events.recv().await {
                    return v;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            violation,
            ProtocolViolation::OfferWhileNegotiating { .. } | ProtocolViolation::DuplicateOffer { .. }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(relay.try_recv_envelope().is_none());
        let entries = rig.peers.entries();
        assert_eq!(
            entries.iter().filter(|e| e.starts_with("peer1 remote offer")).count(),
            1
        );
        assert!(entries.contains(&"peer1 candidate c2".to_string()));
    }

    #[tokio::test]
    async fn late_media_triggers_initiator_renegotiation() {
        let (device, gate) = GatedDevice::new();
        let mut rig = rig_with(Arc::new(device));
        let mut relay = rig.paired(true).await;
        assert!(matches!(next_envelope(&mut relay).await, Envelope::Offer(_)));
        relay.send(&Envelope::Answer(SessionDescription::answer("remote-answer")));

        gate.open();
        rig.until("local media", |s| s.local_media.is_some()).await;
        assert!(matches!(next_envelope(&mut relay).await, Envelope::Offer(_)));
        assert!(rig.peers.entries().contains(&"peer1 attach".to_string()));
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let mut rig = rig();
        let relay = rig.paired(false).await;
        relay.send_raw("<<not json>>");
        relay.send_raw(r#"{"type":"wave"}"#);
        relay.send(&Envelope::Chat("real".into()));
        rig.until("partner chat", |s| s.chat.iter().any(|e| e.text == "real"))
            .await;
        assert_eq!(rig.handle.snapshot().state, SessionState::Active);
    }
}
