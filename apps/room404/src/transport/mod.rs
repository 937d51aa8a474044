//! Signaling transport to the relay.
//!
//! [`SignalingTransport`] owns one relay connection at a time and turns raw
//! frames into [`SignalingEvent`]s. How bytes actually move is behind the
//! [`SignalingConnector`] seam so the controller can run over a websocket
//! or entirely in memory.

pub mod mock;
mod signaling;
mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub use signaling::{SignalingEvent, SignalingTransport, StampedEvent};
pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay refused the connection: {0}")]
    Refused(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

/// What a live link reports upward. `Closed` is an orderly end,
/// `Errored` anything else.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(String),
    Closed,
    Errored(String),
}

/// One established connection: a text sink, an event stream and the
/// background tasks driving both. Dropping the link aborts the tasks.
pub struct SignalingLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    pub(crate) async fn next_event(&mut self) -> Option<LinkEvent> {
        self.inbound.recv().await
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingLink, TransportError>;
}

/// Maps an http(s) or ws(s) base to the relay endpoint `{base}/ws/{identity}`.
pub fn derive_endpoint(base: &Url, identity: &str) -> Result<Url, TransportError> {
    let mut url = base.clone();
    match base.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| TransportError::InvalidEndpoint(base.to_string()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| TransportError::InvalidEndpoint(base.to_string()))?,
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme `{other}` in {base}"
            )));
        }
    }
    url.set_query(None);
    url.set_fragment(None);
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::InvalidEndpoint(base.to_string()))?;
        segments.pop_if_empty();
        segments.push("ws");
        segments.push(identity);
    }
    Ok(url)
}
