use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::peer::{PeerEventSink, PeerTransport, PeerTransportFactory};
use super::{EngineMessage, NegotiationError, OpOutcome};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug)]
pub(crate) enum PeerOp {
    AttachMedia(LocalMedia),
    CreateOffer,
    SetRemote(SessionDescription),
    CreateAnswer,
    AddCandidate(IceCandidate),
}

impl PeerOp {
    fn name(&self) -> &'static str {
        match self {
            PeerOp::AttachMedia(_) => "attach_media",
            PeerOp::CreateOffer => "create_offer",
            PeerOp::SetRemote(_) => "set_remote_description",
            PeerOp::CreateAnswer => "create_answer",
            PeerOp::AddCandidate(_) => "add_ice_candidate",
        }
    }
}

type PeerSlot = Arc<Mutex<Option<Arc<dyn PeerTransport>>>>;

/// Serializes every operation on one peer transport. Ops run strictly in
/// submission order; each completion is reported tagged with the session
/// generation.
pub(crate) struct PeerWorker {
    generation: u64,
    ops: mpsc::UnboundedSender<PeerOp>,
    peer: PeerSlot,
    task: JoinHandle<()>,
}

impl PeerWorker {
    pub(crate) fn spawn(
        generation: u64,
        factory: Arc<dyn PeerTransportFactory>,
        messages: mpsc::UnboundedSender<EngineMessage>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let peer: PeerSlot = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run(
            generation,
            factory,
            messages,
            ops_rx,
            Arc::clone(&peer),
        ));
        Self {
            generation,
            ops: ops_tx,
            peer,
            task,
        }
    }

    pub(crate) fn submit(&self, op: PeerOp) {
        let name = op.name();
        if self.ops.send(op).is_err() {
            tracing::debug!(
                target = "room404::negotiation",
                generation = self.generation,
                op = name,
                "peer worker gone; op dropped"
            );
        }
    }

    /// Stops the worker and closes the peer transport, if one was created.
    pub(crate) async fn shutdown(self) {
        self.task.abort();
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                tracing::warn!(
                    target = "room404::negotiation",
                    generation = self.generation,
                    error = %err,
                    "peer transport close failed"
                );
            }
        }
    }
}

async fn run(
    generation: u64,
    factory: Arc<dyn PeerTransportFactory>,
    messages: mpsc::UnboundedSender<EngineMessage>,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    slot: PeerSlot,
) {
    let sink = PeerEventSink::new(generation, messages.clone());
    let peer = match factory.create(sink).await {
        Ok(peer) => peer,
        Err(error) => {
            let _ = messages.send(EngineMessage::Completion {
                generation,
                outcome: OpOutcome::Failed {
                    op: "create_peer",
                    error,
                },
            });
            return;
        }
    };
    *slot.lock() = Some(Arc::clone(&peer));
    tracing::debug!(target = "room404::negotiation", generation, "peer transport created");

    while let Some(op) = ops.recv().await {
        let name = op.name();
        tracing::trace!(target = "room404::negotiation", generation, op = name, state = "start");
        let outcome = match execute(peer.as_ref(), op).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => continue,
            Err(error) => OpOutcome::Failed { op: name, error },
        };
        if messages
            .send(EngineMessage::Completion {
                generation,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

async fn execute(
    peer: &dyn PeerTransport,
    op: PeerOp,
) -> Result<Option<OpOutcome>, NegotiationError> {
    match op {
        PeerOp::AttachMedia(media) => {
            peer.add_local_media(&media).await?;
            Ok(Some(OpOutcome::MediaAttached))
        }
        PeerOp::CreateOffer => Ok(Some(OpOutcome::OfferCreated(peer.create_offer().await?))),
        PeerOp::SetRemote(sdp) => {
            let kind = sdp.kind;
            peer.set_remote_description(sdp).await?;
            Ok(Some(OpOutcome::RemoteApplied(kind)))
        }
        PeerOp::CreateAnswer => Ok(Some(OpOutcome::AnswerCreated(peer.create_answer().await?))),
        PeerOp::AddCandidate(candidate) => match peer.add_ice_candidate(candidate).await {
            Ok(()) => Ok(None),
            // A bad candidate is not a failed handshake step.
            Err(error) => Ok(Some(OpOutcome::CandidateRejected(error))),
        },
    }
}
