//! Scripted peer transport that records every call instead of touching
//! the network. Entries read `peer{generation} {call}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{NegotiationError, PeerEventSink, PeerTransport, PeerTransportFactory};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::mock::Journal;

#[derive(Clone)]
pub struct ScriptedPeerFactory {
    journal: Journal,
    sinks: Arc<Mutex<Vec<PeerEventSink>>>,
    rejected: Arc<Mutex<Vec<String>>>,
}

impl Default for ScriptedPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPeerFactory {
    pub fn new() -> Self {
        Self::with_journal(Journal::default())
    }

    /// Records into a journal shared with other mocks, so cross-component
    /// ordering can be asserted.
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            sinks: Arc::new(Mutex::new(Vec::new())),
            rejected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Makes every peer fail `add_ice_candidate` for this candidate string.
    pub fn reject_candidate(&self, candidate: impl Into<String>) {
        self.rejected.lock().push(candidate.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Event sink of the most recently created peer, for injecting
    /// callbacks such as remote tracks.
    pub fn last_sink(&self) -> Option<PeerEventSink> {
        self.sinks.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.sinks.lock().len()
    }
}

#[async_trait]
impl PeerTransportFactory for ScriptedPeerFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let name = format!("peer{}", events.generation());
        self.journal.lock().push(format!("{name} create"));
        self.sinks.lock().push(events);
        Ok(Arc::new(ScriptedPeer {
            name,
            journal: Arc::clone(&self.journal),
            rejected: Arc::clone(&self.rejected),
            descriptions: AtomicU64::new(0),
        }))
    }
}

struct ScriptedPeer {
    name: String,
    journal: Journal,
    rejected: Arc<Mutex<Vec<String>>>,
    descriptions: AtomicU64,
}

impl ScriptedPeer {
    fn record(&self, call: impl AsRef<str>) {
        self.journal
            .lock()
            .push(format!("{} {}", self.name, call.as_ref()));
    }

    fn next_sdp(&self, kind: &str) -> String {
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{kind}-{}-{n}", self.name)
    }
}

#[async_trait]
impl PeerTransport for ScriptedPeer {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        if media.is_stopped() {
            return Err(NegotiationError::Track("media already released".into()));
        }
        self.record("attach");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record("offer");
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record("answer");
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_remote_description(
        &self,
        sdp: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let kind = match sdp.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        self.record(format!("remote {kind} {}", sdp.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(format!("candidate {}", candidate.candidate));
        if self.rejected.lock().contains(&candidate.candidate) {
            return Err(NegotiationError::Candidate("unparseable".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.record("close");
        Ok(())
    }
}
