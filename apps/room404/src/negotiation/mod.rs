//! Offer/answer/ICE negotiation for one partner at a time.
//!
//! The engine never awaits a peer operation itself. Operations are queued
//! on a per-session [`worker`] and come back as [`EngineMessage`]s tagged
//! with the session generation; anything from an older generation is
//! dropped.

pub mod mock;
mod peer;
mod worker;

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

pub use peer::{
    MediaKind, PeerConnectionState, PeerEvent, PeerEventSink, PeerTransport,
    PeerTransportFactory, RemoteTrack, RemoteTrackInfo, RtcPeerFactory, RtcPeerTransport,
};

use crate::media::LocalMedia;
use crate::protocol::{Envelope, IceCandidate, ProtocolViolation, SdpKind, SessionDescription};
use worker::{PeerOp, PeerWorker};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer setup failed: {0}")]
    PeerSetup(String),
    #[error("session description rejected: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("local track rejected: {0}")]
    Track(String),
    #[error("peer transport closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

impl NegotiationRole {
    pub fn from_initiator_flag(initiator: bool) -> Self {
        if initiator {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPhase {
    Offering,
    AwaitingAnswer,
    ApplyingAnswer,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderPhase {
    AwaitingOffer,
    ApplyingOffer,
    Answering,
    Stable,
}

/// Role-specific handshake progress. Only the initiator side has phases
/// that produce offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Initiator(InitiatorPhase),
    Responder(ResponderPhase),
}

impl Negotiation {
    pub fn role(&self) -> NegotiationRole {
        match self {
            Negotiation::Initiator(_) => NegotiationRole::Initiator,
            Negotiation::Responder(_) => NegotiationRole::Responder,
        }
    }
}

#[derive(Debug)]
pub enum OpOutcome {
    MediaAttached,
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    RemoteApplied(SdpKind),
    CandidateRejected(NegotiationError),
    Failed {
        op: &'static str,
        error: NegotiationError,
    },
}

#[derive(Debug)]
pub enum EngineMessage {
    Completion { generation: u64, outcome: OpOutcome },
    Peer { generation: u64, event: PeerEvent },
}

impl EngineMessage {
    pub fn generation(&self) -> u64 {
        match self {
            EngineMessage::Completion { generation, .. } | EngineMessage::Peer { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineOutput {
    Signal(Envelope),
    RemoteMediaAvailable(RemoteTrack),
    RemoteMediaUnavailable,
    Failed(NegotiationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub generation: u64,
    pub had_remote_media: bool,
    pub dropped_candidates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDescription {
    Absent,
    /// Submitted to the worker. Later candidates queue behind it.
    Submitted,
}

struct NegotiationSession {
    generation: u64,
    negotiation: Negotiation,
    remote: RemoteDescription,
    pending_remote_candidates: VecDeque<IceCandidate>,
    local_media: Option<LocalMedia>,
    media_attached: bool,
    renegotiate: bool,
    reached_stable: bool,
    last_remote_offer: Option<String>,
    remote_media: bool,
    worker: PeerWorker,
}

impl NegotiationSession {
    fn attach_local_media(&mut self) {
        if self.media_attached {
            return;
        }
        if let Some(media) = &self.local_media {
            self.worker.submit(PeerOp::AttachMedia(media.clone()));
            self.media_attached = true;
        }
    }

    fn apply_remote(&mut self, sdp: SessionDescription) {
        self.worker.submit(PeerOp::SetRemote(sdp));
        if self.remote == RemoteDescription::Absent {
            let buffered = self.pending_remote_candidates.len();
            for candidate in self.pending_remote_candidates.drain(..) {
                self.worker.submit(PeerOp::AddCandidate(candidate));
            }
            if buffered > 0 {
                tracing::debug!(
                    target = "room404::negotiation",
                    generation = self.generation,
                    buffered,
                    "flushing buffered remote candidates"
                );
            }
            self.remote = RemoteDescription::Submitted;
        }
    }

    fn offer(&mut self) {
        debug_assert!(matches!(self.negotiation, Negotiation::Initiator(_)));
        self.worker.submit(PeerOp::CreateOffer);
        self.negotiation = Negotiation::Initiator(InitiatorPhase::Offering);
    }
}

pub struct PeerNegotiationEngine {
    factory: Arc<dyn PeerTransportFactory>,
    messages: mpsc::UnboundedSender<EngineMessage>,
    next_generation: u64,
    session: Option<NegotiationSession>,
}

impl PeerNegotiationEngine {
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        messages: mpsc::UnboundedSender<EngineMessage>,
    ) -> Self {
        Self {
            factory,
            messages,
            next_generation: 0,
            session: None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.generation)
    }

    pub fn negotiation(&self) -> Option<Negotiation> {
        self.session.as_ref().map(|session| session.negotiation)
    }

    pub fn pending_candidates(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |session| session.pending_remote_candidates.len())
    }

    /// Replaces any current session with a fresh one.
    pub async fn start(&mut self, role: NegotiationRole, media: Option<LocalMedia>) -> u64 {
        self.teardown().await;
        self.next_generation += 1;
        let generation = self.next_generation;
        if media.is_none() {
            tracing::info!(target = "room404::negotiation", generation, "no local media; negotiating receive-only");
        }
        let negotiation = match role {
            NegotiationRole::Initiator => Negotiation::Initiator(InitiatorPhase::Offering),
            NegotiationRole::Responder => Negotiation::Responder(ResponderPhase::AwaitingOffer),
        };
        let mut session = NegotiationSession {
            generation,
            negotiation,
            remote: RemoteDescription::Absent,
            pending_remote_candidates: VecDeque::new(),
            local_media: media,
            media_attached: false,
            renegotiate: false,
            reached_stable: false,
            last_remote_offer: None,
            remote_media: false,
            worker: PeerWorker::spawn(generation, Arc::clone(&self.factory), self.messages.clone()),
        };
        if role == NegotiationRole::Initiator {
            session.attach_local_media();
            session.offer();
        }
        tracing::info!(target = "room404::negotiation", generation, ?role, "negotiation session started");
        self.session = Some(session);
        generation
    }

    pub fn handle_offer(&mut self, sdp: SessionDescription) -> Result<(), ProtocolViolation> {
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolViolation::NoSession { kind: "offer" });
        };
        let generation = session.generation;
        let phase = match session.negotiation {
            Negotiation::Initiator(_) => {
                return Err(ProtocolViolation::OfferToInitiator { generation });
            }
            Negotiation::Responder(phase) => phase,
        };
        let duplicate = session.last_remote_offer.as_deref() == Some(sdp.sdp.as_str());
        match phase {
            ResponderPhase::AwaitingOffer | ResponderPhase::Stable if !duplicate => {
                if phase == ResponderPhase::Stable {
                    tracing::debug!(target = "room404::negotiation", generation, "accepting renegotiation offer");
                }
                session.attach_local_media();
                session.last_remote_offer = Some(sdp.sdp.clone());
                session.apply_remote(sdp);
                session.worker.submit(PeerOp::CreateAnswer);
                session.negotiation = Negotiation::Responder(ResponderPhase::ApplyingOffer);
                Ok(())
            }
            _ if duplicate => Err(ProtocolViolation::DuplicateOffer { generation }),
            _ => Err(ProtocolViolation::OfferWhileNegotiating { generation }),
        }
    }

    pub fn handle_answer(&mut self, sdp: SessionDescription) -> Result<(), ProtocolViolation> {
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolViolation::NoSession { kind: "answer" });
        };
        let generation = session.generation;
        match session.negotiation {
            Negotiation::Initiator(InitiatorPhase::AwaitingAnswer) => {
                session.apply_remote(sdp);
                session.negotiation = Negotiation::Initiator(InitiatorPhase::ApplyingAnswer);
                Ok(())
            }
            Negotiation::Initiator(_) => Err(ProtocolViolation::AnswerWithoutOffer { generation }),
            Negotiation::Responder(_) => Err(ProtocolViolation::AnswerToResponder { generation }),
        }
    }

    pub fn handle_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), ProtocolViolation> {
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolViolation::NoSession {
                kind: "ice-candidate",
            });
        };
        match session.remote {
            RemoteDescription::Absent => {
                session.pending_remote_candidates.push_back(candidate);
                tracing::trace!(
                    target = "room404::negotiation",
                    generation = session.generation,
                    buffered = session.pending_remote_candidates.len(),
                    "buffering remote candidate"
                );
            }
            RemoteDescription::Submitted => session.worker.submit(PeerOp::AddCandidate(candidate)),
        }
        Ok(())
    }

    /// Adds media that became available after the session started.
    pub fn attach_local_media(&mut self, media: LocalMedia) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.media_attached {
            return;
        }
        let generation = session.generation;
        session.local_media = Some(media);
        match session.negotiation {
            Negotiation::Initiator(InitiatorPhase::Stable) => {
                session.attach_local_media();
                session.offer();
                tracing::info!(target = "room404::negotiation", generation, "renegotiating with local media");
            }
            Negotiation::Initiator(_) => {
                // An offer is in flight; re-offer once its answer lands.
                session.attach_local_media();
                session.renegotiate = true;
            }
            Negotiation::Responder(ResponderPhase::AwaitingOffer) => {
                tracing::debug!(target = "room404::negotiation", generation, "local media will ride on the answer");
            }
            Negotiation::Responder(_) => {
                session.attach_local_media();
                tracing::info!(target = "room404::negotiation", generation, "local media attached; waiting for initiator to renegotiate");
            }
        }
    }

    /// Routes a worker or peer message. Messages from any generation other
    /// than the live one are dropped.
    pub fn handle_message(&mut self, message: EngineMessage) -> Vec<EngineOutput> {
        let generation = message.generation();
        if self.generation() != Some(generation) {
            tracing::debug!(
                target = "room404::negotiation",
                generation,
                current = ?self.generation(),
                "dropping stale negotiation message"
            );
            return Vec::new();
        }
        match message {
            EngineMessage::Completion { outcome, .. } => self.complete(outcome),
            EngineMessage::Peer { event, .. } => self.peer_event(event),
        }
    }

    fn complete(&mut self, outcome: OpOutcome) -> Vec<EngineOutput> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let generation = session.generation;
        match (outcome, session.negotiation) {
            (OpOutcome::MediaAttached, _) => {
                tracing::debug!(target = "room404::negotiation", generation, "local media attached to peer");
                Vec::new()
            }
            (OpOutcome::OfferCreated(sdp), Negotiation::Initiator(InitiatorPhase::Offering)) => {
                session.negotiation = Negotiation::Initiator(InitiatorPhase::AwaitingAnswer);
                tracing::debug!(target = "room404::negotiation", generation, "sending offer");
                vec![EngineOutput::Signal(Envelope::Offer(sdp))]
            }
            (OpOutcome::RemoteApplied(SdpKind::Answer), Negotiation::Initiator(InitiatorPhase::ApplyingAnswer)) => {
                session.negotiation = Negotiation::Initiator(InitiatorPhase::Stable);
                session.reached_stable = true;
                if session.renegotiate {
                    session.renegotiate = false;
                    session.offer();
                    tracing::info!(target = "room404::negotiation", generation, "renegotiating with late local media");
                }
                Vec::new()
            }
            (OpOutcome::RemoteApplied(SdpKind::Offer), Negotiation::Responder(ResponderPhase::ApplyingOffer)) => {
                session.negotiation = Negotiation::Responder(ResponderPhase::Answering);
                Vec::new()
            }
            (OpOutcome::AnswerCreated(sdp), Negotiation::Responder(ResponderPhase::Answering)) => {
                session.negotiation = Negotiation::Responder(ResponderPhase::Stable);
                session.reached_stable = true;
                tracing::debug!(target = "room404::negotiation", generation, "sending answer");
                vec![EngineOutput::Signal(Envelope::Answer(sdp))]
            }
            (OpOutcome::CandidateRejected(error), _) => {
                tracing::warn!(target = "room404::negotiation", generation, error = %error, "remote candidate rejected");
                vec![EngineOutput::Failed(error)]
            }
            (OpOutcome::Failed { op, error }, negotiation) => {
                tracing::warn!(target = "room404::negotiation", generation, op, error = %error, "peer operation failed");
                session.negotiation = match negotiation {
                    Negotiation::Initiator(_) => Negotiation::Initiator(InitiatorPhase::Stable),
                    Negotiation::Responder(_) if session.reached_stable => {
                        Negotiation::Responder(ResponderPhase::Stable)
                    }
                    Negotiation::Responder(_) => Negotiation::Responder(ResponderPhase::AwaitingOffer),
                };
                session.last_remote_offer = None;
                session.renegotiate = false;
                vec![EngineOutput::Failed(error)]
            }
            (outcome, negotiation) => {
                tracing::debug!(target = "room404::negotiation", generation, ?outcome, ?negotiation, "completion does not match phase");
                Vec::new()
            }
        }
    }

    fn peer_event(&mut self, event: PeerEvent) -> Vec<EngineOutput> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                vec![EngineOutput::Signal(Envelope::IceCandidate(candidate))]
            }
            PeerEvent::RemoteTrack(track) => {
                session.remote_media = true;
                vec![EngineOutput::RemoteMediaAvailable(track)]
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(target = "room404::negotiation", generation = session.generation, ?state, "peer connection state");
                match state {
                    PeerConnectionState::Failed | PeerConnectionState::Closed
                        if session.remote_media =>
                    {
                        session.remote_media = false;
                        vec![EngineOutput::RemoteMediaUnavailable]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    /// Destroys the current session, if any, and waits for its peer
    /// transport to close. Safe to call at any point.
    pub async fn teardown(&mut self) -> Option<TeardownReport> {
        let session = self.session.take()?;
        let report = TeardownReport {
            generation: session.generation,
            had_remote_media: session.remote_media,
            dropped_candidates: session.pending_remote_candidates.len(),
        };
        session.worker.shutdown().await;
        tracing::info!(
            target = "room404::negotiation",
            generation = report.generation,
            dropped_candidates = report.dropped_candidates,
            had_remote_media = report.had_remote_media,
            "negotiation session torn down"
        );
        Some(report)
    }
}
