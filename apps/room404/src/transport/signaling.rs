use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use super::{
    LinkEvent, SignalingConnector, SignalingLink, TransportError, TransportState, derive_endpoint,
};
use crate::protocol::{ChatWireFormat, Envelope};

const FANOUT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Opened,
    Envelope(Envelope),
    Closed,
    Errored(String),
}

/// A signaling event tagged with the connection attempt it belongs to.
#[derive(Debug, Clone)]
pub struct StampedEvent {
    pub epoch: u64,
    pub event: SignalingEvent,
}

struct Inner {
    state: TransportState,
    epoch: u64,
    identity: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pump: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct Emitter {
    events: mpsc::UnboundedSender<StampedEvent>,
    fanout: broadcast::Sender<SignalingEvent>,
}

impl Emitter {
    fn emit(&self, epoch: u64, event: SignalingEvent) {
        let _ = self.fanout.send(event.clone());
        if self.events.send(StampedEvent { epoch, event }).is_err() {
            tracing::trace!(target = "room404::signaling", "event receiver dropped");
        }
    }
}

pub struct SignalingTransport {
    connector: Arc<dyn SignalingConnector>,
    base_url: Url,
    chat_format: ChatWireFormat,
    connect_timeout: Duration,
    emitter: Emitter,
    inner: Arc<Mutex<Inner>>,
}

impl SignalingTransport {
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        base_url: Url,
        chat_format: ChatWireFormat,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<StampedEvent>,
    ) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            connector,
            base_url,
            chat_format,
            connect_timeout,
            emitter: Emitter { events, fanout },
            inner: Arc::new(Mutex::new(Inner {
                state: TransportState::Idle,
                epoch: 0,
                identity: None,
                outbound: None,
                pump: None,
            })),
        }
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn identity(&self) -> Option<String> {
        self.inner.lock().identity.clone()
    }

    /// Additional listeners. Slow subscribers lag rather than block the pump.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.emitter.fanout.subscribe()
    }

    /// Starts a connection for `identity`, closing any previous one first.
    /// Returns the epoch that every event of this attempt will carry.
    pub fn open(&self, identity: &str) -> u64 {
        self.close();

        let epoch = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.state = TransportState::Connecting;
            inner.identity = Some(identity.to_string());
            inner.epoch
        };

        let endpoint = match derive_endpoint(&self.base_url, identity) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.inner.lock().state = TransportState::Failed;
                tracing::warn!(target = "room404::signaling", epoch, error = %err, "cannot open signaling");
                self.emitter.emit(epoch, SignalingEvent::Errored(err.to_string()));
                return epoch;
            }
        };

        tracing::debug!(target = "room404::signaling", epoch, url = %endpoint, "opening signaling");
        let pump = tokio::spawn(run_pump(
            Arc::clone(&self.connector),
            endpoint,
            self.connect_timeout,
            epoch,
            Arc::clone(&self.inner),
            self.emitter.clone(),
        ));
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.pump = Some(pump);
        } else {
            pump.abort();
        }
        epoch
    }

    /// Sends one envelope. Returns `false` without side effects unless open.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let inner = self.inner.lock();
        if inner.state != TransportState::Open {
            tracing::debug!(
                target = "room404::signaling",
                kind = envelope.kind(),
                state = ?inner.state,
                "dropping outbound envelope; transport not open"
            );
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };
        match envelope.encode(self.chat_format) {
            Ok(text) => {
                tracing::trace!(target = "room404::signaling", event = "ws_out", kind = envelope.kind(), len = text.len());
                outbound.send(text).is_ok()
            }
            Err(err) => {
                tracing::warn!(target = "room404::signaling", error = %err, "failed to encode envelope");
                false
            }
        }
    }

    /// Idempotent. Later events from the closed attempt are never emitted.
    pub fn close(&self) {
        let (epoch, pump, was_live) = {
            let mut inner = self.inner.lock();
            let was_live = matches!(
                inner.state,
                TransportState::Connecting | TransportState::Open
            );
            if was_live {
                inner.state = TransportState::Closed;
            }
            inner.outbound = None;
            let epoch = inner.epoch;
            // Retire the epoch so an in-flight pump cannot emit for it.
            inner.epoch += 1;
            (epoch, inner.pump.take(), was_live)
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if was_live {
            tracing::debug!(target = "room404::signaling", epoch, "signaling closed locally");
            self.emitter.emit(epoch, SignalingEvent::Closed);
        }
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.lock().pump.take() {
            pump.abort();
        }
    }
}

async fn run_pump(
    connector: Arc<dyn SignalingConnector>,
    endpoint: Url,
    connect_timeout: Duration,
    epoch: u64,
    inner: Arc<Mutex<Inner>>,
    emitter: Emitter,
) {
    let connected = tokio::time::timeout(connect_timeout, connector.connect(&endpoint)).await;
    let mut link: SignalingLink = match connected {
        Ok(Ok(link)) => link,
        Ok(Err(err)) => {
            fail(&inner, &emitter, epoch, err);
            return;
        }
        Err(_) => {
            fail(&inner, &emitter, epoch, TransportError::Timeout(connect_timeout));
            return;
        }
    };

    {
        let mut guard = inner.lock();
        if guard.epoch != epoch {
            return;
        }
        guard.state = TransportState::Open;
        guard.outbound = Some(link.sender());
    }
    tracing::debug!(target = "room404::signaling", epoch, url = %endpoint, "signaling open");
    emit_current(&inner, &emitter, epoch, SignalingEvent::Opened);

    while let Some(event) = link.next_event().await {
        match event {
            LinkEvent::Frame(text) => {
                tracing::trace!(target = "room404::signaling", event = "ws_in", len = text.len());
                match Envelope::parse(&text) {
                    Ok(envelope) => {
                        emit_current(&inner, &emitter, epoch, SignalingEvent::Envelope(envelope))
                    }
                    Err(err) => {
                        tracing::debug!(target = "room404::signaling", epoch, error = %err, "dropping unparseable frame")
                    }
                }
            }
            LinkEvent::Closed => break,
            LinkEvent::Errored(reason) => {
                if finish(&inner, epoch, TransportState::Failed) {
                    tracing::warn!(target = "room404::signaling", epoch, reason = %reason, "signaling link failed");
                    emitter.emit(epoch, SignalingEvent::Errored(reason));
                }
                return;
            }
        }
    }

    if finish(&inner, epoch, TransportState::Closed) {
        tracing::debug!(target = "room404::signaling", epoch, "signaling closed by relay");
        emitter.emit(epoch, SignalingEvent::Closed);
    }
}

fn emit_current(inner: &Mutex<Inner>, emitter: &Emitter, epoch: u64, event: SignalingEvent) {
    let current = inner.lock().epoch == epoch;
    if current {
        emitter.emit(epoch, event);
    }
}

fn fail(inner: &Mutex<Inner>, emitter: &Emitter, epoch: u64, err: TransportError) {
    if finish(inner, epoch, TransportState::Failed) {
        tracing::warn!(target = "room404::signaling", epoch, error = %err, "signaling connect failed");
        emitter.emit(epoch, SignalingEvent::Errored(err.to_string()));
    }
}

/// Moves a still-current attempt into a terminal state. Returns whether the
/// attempt was current.
fn finish(inner: &Mutex<Inner>, epoch: u64, state: TransportState) -> bool {
    let mut guard = inner.lock();
    if guard.epoch != epoch {
        return false;
    }
    guard.state = state;
    guard.outbound = None;
    guard.pump = None;
    true
}
