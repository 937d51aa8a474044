use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use url::Url;

use crate::config::{ClientConfig, MediaMode};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "room404",
    about = "Talk to a random stranger over text, audio and video",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ROOM404_SERVER",
        value_name = "URL",
        help = "Base URL of the relay (http, https, ws or wss)"
    )]
    pub server: Option<String>,

    #[arg(
        long,
        env = "ROOM404_NAME",
        value_name = "NAME",
        help = "Display name sent to the relay; a random one is picked when unset"
    )]
    pub name: Option<String>,

    #[arg(long, help = "Chat only; never ask for camera or microphone")]
    pub text_only: bool,

    #[arg(
        long = "reconnect-delay-ms",
        value_name = "MS",
        help = "Pause before reconnecting when looking for a new partner"
    )]
    pub reconnect_delay_ms: Option<u64>,

    #[arg(
        long = "stun",
        value_name = "URL",
        help = "STUN/TURN server, may be repeated (replaces the default)"
    )]
    pub stun: Vec<String>,

    #[arg(
        long,
        conflicts_with = "stun",
        help = "Gather host candidates only (no STUN)"
    )]
    pub localhost_only: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "ROOM404_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "ROOM404_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    /// Layers command line overrides on top of `base`.
    pub fn apply(&self, mut base: ClientConfig) -> Result<ClientConfig, url::ParseError> {
        if let Some(server) = &self.server {
            let server = server.replacen("://localhost", "://127.0.0.1", 1);
            base.server_url = Url::parse(&server)?;
        }
        if let Some(ms) = self.reconnect_delay_ms {
            base.reconnect_delay = Duration::from_millis(ms);
        }
        if !self.stun.is_empty() {
            base.ice_servers = self.stun.clone();
        }
        if self.localhost_only {
            base.ice_servers.clear();
        }
        if self.text_only {
            base.media_mode = MediaMode::TextOnly;
        }
        Ok(base)
    }

    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("stranger-{}", &suffix[..6])
            }
        }
    }
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Say(String),
    NewPartner,
    Mute,
    Unmute,
    Video(bool),
    TextOnly,
    AudioVideo,
    Status,
    Help,
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    /// `None` for blank lines. A leading `//` sends a literal slash.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(text) = line.strip_prefix("//") {
            return Some(ConsoleCommand::Say(format!("/{text}")));
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(ConsoleCommand::Say(line.to_string()));
        };
        let mut words = command.split_whitespace();
        let parsed = match (words.next().unwrap_or_default(), words.next()) {
            ("new" | "next", None) => ConsoleCommand::NewPartner,
            ("mute", None) => ConsoleCommand::Mute,
            ("unmute", None) => ConsoleCommand::Unmute,
            ("video", Some("on")) => ConsoleCommand::Video(true),
            ("video", Some("off")) => ConsoleCommand::Video(false),
            ("text", None) => ConsoleCommand::TextOnly,
            ("av", None) => ConsoleCommand::AudioVideo,
            ("status", None) => ConsoleCommand::Status,
            ("help", None) => ConsoleCommand::Help,
            ("quit" | "exit", None) => ConsoleCommand::Quit,
            _ => ConsoleCommand::Unknown(line.to_string()),
        };
        Some(parsed)
    }
}

pub const CONSOLE_HELP: &str = "\
/new          leave this stranger and find another
/mute         stop sending audio
/unmute       resume sending audio
/video on|off toggle the camera
/text         chat only from the next partner on
/av           audio and video from the next partner on
/status       show connection state
/quit         leave";
