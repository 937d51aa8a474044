//! In-process relay for integration tests. It pairs whoever waits longest
//! with the next arrival and forwards chat and signaling verbatim, the way
//! the production relay does.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use room404_client_core::session::{SessionHandle, SessionSnapshot};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;

pub const REFUSED_NAME: &str = "banned";
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

#[derive(Default)]
struct Lobby {
    clients: HashMap<String, mpsc::UnboundedSender<WsMessage>>,
    partners: HashMap<String, String>,
    waiting: Option<String>,
}

impl Lobby {
    fn send(&self, name: &str, value: Value) {
        if let Some(tx) = self.clients.get(name) {
            let _ = tx.send(WsMessage::Text(value.to_string()));
        }
    }

    fn pair_or_wait(&mut self, name: &str) {
        match self.waiting.take() {
            Some(waiting) if waiting != name && self.clients.contains_key(&waiting) => {
                debug!("stub relay: pairing {waiting} with {name}");
                self.partners.insert(waiting.clone(), name.to_string());
                self.partners.insert(name.to_string(), waiting.clone());
                self.send(&waiting, presence("partner_connected", "Stranger connected!", true));
                self.send(name, presence("partner_connected", "Stranger connected!", false));
            }
            _ => self.waiting = Some(name.to_string()),
        }
    }

    fn leave(&mut self, name: &str) {
        self.clients.remove(name);
        if self.waiting.as_deref() == Some(name) {
            self.waiting = None;
        }
        if let Some(partner) = self.partners.remove(name) {
            self.partners.remove(&partner);
            self.send(
                &partner,
                presence("partner_disconnected", "Stranger disconnected.", false),
            );
            self.pair_or_wait(&partner);
        }
    }
}

fn presence(event: &str, message: &str, initiator: bool) -> Value {
    json!({
        "type": "system",
        "event": event,
        "message": message,
        "initiator": initiator,
    })
}

pub struct StubRelay {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StubRelay {
    pub async fn start() -> Self {
        let lobby = Arc::new(AsyncMutex::new(Lobby::default()));
        let router = Router::new()
            .route("/ws/:name", get(ws_handler))
            .with_state(lobby);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub relay");
        let addr = listener.local_addr().expect("relay addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self { addr, task }
    }

    /// Base url as a user would type it; the client maps it to `ws://`.
    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("relay url")
    }
}

impl Drop for StubRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(lobby): State<Arc<AsyncMutex<Lobby>>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if name == REFUSED_NAME {
        return (StatusCode::FORBIDDEN, "not welcome").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, name, lobby))
}

async fn handle_socket(socket: WebSocket, name: String, lobby: Arc<AsyncMutex<Lobby>>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    {
        let mut lobby = lobby.lock().await;
        lobby.clients.insert(name.clone(), tx);
        lobby.send(&name, json!({"type": "system", "message": "Connected to server."}));
        lobby.pair_or_wait(&name);
    }

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let forwarded = match serde_json::from_str::<Value>(&text) {
            Ok(value) if value.get("type").is_some() => value,
            _ => json!({"type": "chat", "message": text}),
        };
        let lobby = lobby.lock().await;
        if let Some(partner) = lobby.partners.get(&name) {
            lobby.send(partner, forwarded);
        }
    }

    debug!("stub relay: {name} left");
    lobby.lock().await.leave(&name);
    send_task.abort();
}

/// Waits until the controller publishes a snapshot matching `predicate`.
pub async fn wait_for(
    handle: &SessionHandle,
    what: &str,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = handle.watch();
    let waited = timeout(WAIT, async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                panic!("controller stopped while waiting for {what}");
            }
        }
    })
    .await;
    match waited {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("timed out waiting for {what}: {:?}", handle.snapshot()),
    }
}
