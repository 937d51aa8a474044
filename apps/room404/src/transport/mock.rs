//! In-memory connector. Each accepted connection hands the test a
//! [`RelaySide`] that plays the relay.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{LinkEvent, SignalingConnector, SignalingLink, TransportError};
use crate::protocol::{ChatWireFormat, Envelope};

/// Shared, ordered record of notable calls across mocks.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub struct RelaySide {
    pub endpoint: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl RelaySide {
    pub fn send(&self, envelope: &Envelope) -> bool {
        match envelope.encode(ChatWireFormat::Envelope) {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Frame(text.into())).is_ok()
    }

    pub fn close(&self) {
        let _ = self.to_client.send(LinkEvent::Closed);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.to_client.send(LinkEvent::Errored(reason.into()));
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame from the client that parses as an envelope.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(text) = self.from_client.recv().await {
            if let Ok(envelope) = Envelope::parse(&text) {
                return Some(envelope);
            }
        }
        None
    }

    pub fn try_recv_envelope(&mut self) -> Option<Envelope> {
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(envelope) = Envelope::parse(&text) {
                return Some(envelope);
            }
        }
        None
    }
}

struct ConnectorState {
    refusal: Option<String>,
    journal: Option<Journal>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<RelaySide>,
    state: Arc<Mutex<ConnectorState>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelaySide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            state: Arc::new(Mutex::new(ConnectorState {
                refusal: None,
                journal: None,
            })),
        };
        (connector, rx)
    }

    pub fn refuse_with(&self, reason: impl Into<String>) {
        self.state.lock().refusal = Some(reason.into());
    }

    /// Lifts a previous [`refuse_with`](Self::refuse_with).
    pub fn accept(&self) {
        self.state.lock().refusal = None;
    }

    pub fn record_into(&self, journal: Journal) {
        self.state.lock().journal = Some(journal);
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingLink, TransportError> {
        let refusal = {
            let state = self.state.lock();
            if let Some(journal) = &state.journal {
                journal.lock().push(format!("connect {}", endpoint.path()));
            }
            state.refusal.clone()
        };
        if let Some(reason) = refusal {
            return Err(TransportError::Refused(reason));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let relay = RelaySide {
            endpoint: endpoint.clone(),
            from_client,
            to_client,
        };
        self.accepted
            .send(relay)
            .map_err(|_| TransportError::Connect("memory relay is gone".into()))?;
        Ok(SignalingLink::new(client_tx, client_rx))
    }
}
