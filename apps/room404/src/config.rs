use std::env;
use std::time::Duration;

use url::Url;

use crate::protocol::ChatWireFormat;
use crate::transport::{TransportError, derive_endpoint};

pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaMode {
    #[default]
    AudioVideo,
    /// No local capture; sessions negotiate receive-only.
    TextOnly,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base address; `http(s)` is mapped to `ws(s)`
    pub server_url: Url,
    /// Pause between closing and reopening on "find new partner"
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// STUN/TURN urls. Empty means host candidates only
    pub ice_servers: Vec<String>,
    pub chat_wire: ChatWireFormat,
    pub media_mode: MediaMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ice_servers: vec![DEFAULT_STUN.to_string()],
            chat_wire: ChatWireFormat::Envelope,
            media_mode: MediaMode::AudioVideo,
        }
    }
}

fn default_server() -> Url {
    match Url::parse(DEFAULT_SERVER) {
        Ok(url) => url,
        Err(_) => unreachable!("default server url is valid"),
    }
}

pub(crate) fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(target = "room404::config", var = name, value = %raw, "ignoring non-numeric duration");
            None
        }
    }
}

impl ClientConfig {
    /// Load configuration from `ROOM404_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(server) = env::var("ROOM404_SERVER") {
            // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
            let server = server.replacen("://localhost", "://127.0.0.1", 1);
            match Url::parse(&server) {
                Ok(url) => config.server_url = url,
                Err(err) => {
                    tracing::warn!(target = "room404::config", value = %server, error = %err, "ignoring invalid ROOM404_SERVER")
                }
            }
        }
        if let Some(delay) = env_millis("ROOM404_RECONNECT_DELAY_MS") {
            config.reconnect_delay = delay;
        }
        if let Some(timeout) = env_millis("ROOM404_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        if let Ok(stun) = env::var("ROOM404_STUN") {
            config.ice_servers = stun
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if env_flag("ROOM404_LOCALHOST_ONLY") {
            config.ice_servers.clear();
        }
        if env_flag("ROOM404_BARE_CHAT") {
            config.chat_wire = ChatWireFormat::Bare;
        }
        if env_flag("ROOM404_TEXT_ONLY") {
            config.media_mode = MediaMode::TextOnly;
        }
        config
    }

    pub fn with_server(mut self, server_url: Url) -> Self {
        self.server_url = server_url;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_chat_wire(mut self, chat_wire: ChatWireFormat) -> Self {
        self.chat_wire = chat_wire;
        self
    }

    pub fn with_media_mode(mut self, media_mode: MediaMode) -> Self {
        self.media_mode = media_mode;
        self
    }

    /// Websocket endpoint for one participant
    pub fn signaling_endpoint(&self, identity: &str) -> Result<Url, TransportError> {
        derive_endpoint(&self.server_url, identity)
    }
}
