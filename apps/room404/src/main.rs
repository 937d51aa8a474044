use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use room404_client_core::cli::{CONSOLE_HELP, Cli, ConsoleCommand};
use room404_client_core::config::{ClientConfig, MediaMode};
use room404_client_core::media::SampleTrackDevice;
use room404_client_core::negotiation::RtcPeerFactory;
use room404_client_core::session::{ChatAuthor, SessionController, SessionEvent, SessionHandle};
use room404_client_core::telemetry::logging;
use room404_client_core::transport::WebSocketConnector;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("failed to configure logging")?;
    let config = cli
        .apply(ClientConfig::from_env())
        .context("invalid --server url")?;
    let identity = cli.display_name();
    debug!(
        target = "room404::cli",
        server = %config.server_url,
        identity = %identity,
        media_mode = ?config.media_mode,
        "starting"
    );

    let peers = RtcPeerFactory::new(config.ice_servers.clone());
    let handle = SessionController::spawn(
        config,
        Arc::new(WebSocketConnector),
        Arc::new(SampleTrackDevice::default()),
        Arc::new(peers),
    );
    let printer = spawn_printer(&handle);

    println!("You are {identity}. Type /help for commands.");
    handle.connect(identity).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(err) = dispatch(&handle, command).await {
            println!("-- {err}");
        }
    }

    handle.shutdown().await;
    printer.abort();
    Ok(())
}

async fn dispatch(handle: &SessionHandle, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Say(text) => handle.send_message(text).await?,
        ConsoleCommand::NewPartner => handle.find_new_partner().await?,
        ConsoleCommand::Mute => handle.set_audio_enabled(false).await?,
        ConsoleCommand::Unmute => handle.set_audio_enabled(true).await?,
        ConsoleCommand::Video(enabled) => handle.set_video_enabled(enabled).await?,
        ConsoleCommand::TextOnly => handle.set_media_mode(MediaMode::TextOnly).await?,
        ConsoleCommand::AudioVideo => handle.set_media_mode(MediaMode::AudioVideo).await?,
        ConsoleCommand::Status => {
            let snapshot = handle.snapshot();
            println!(
                "-- {} ({}); audio {}, video {}, {} remote track(s)",
                snapshot.status,
                snapshot.state,
                on_off(snapshot.media.audio_enabled),
                on_off(snapshot.media.video_enabled),
                snapshot.remote_tracks.len()
            );
            if let Some(hint) = snapshot.media_hint {
                println!("-- {hint}");
            }
        }
        ConsoleCommand::Help => println!("{CONSOLE_HELP}"),
        ConsoleCommand::Unknown(line) => println!("-- unknown command {line}, try /help"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn spawn_printer(handle: &SessionHandle) -> JoinHandle<()> {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target = "room404::cli", skipped, "event printer lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                SessionEvent::Status(status) => println!("-- {status}"),
                SessionEvent::Chat(entry) => match entry.author {
                    ChatAuthor::Local => println!("You: {}", entry.text),
                    ChatAuthor::Partner => println!("Stranger: {}", entry.text),
                    ChatAuthor::System => println!("** {}", entry.text),
                },
                SessionEvent::RemoteMediaAvailable(track) => {
                    println!("-- receiving {:?} from stranger", track.info.kind)
                }
                SessionEvent::RemoteMediaUnavailable => println!("-- stranger media ended"),
                SessionEvent::LocalMediaFailed(err) => {
                    println!("-- camera/microphone unavailable ({err}); you can still chat")
                }
                other => debug!(target = "room404::cli", event = ?other, "session event"),
            }
        }
    })
}
