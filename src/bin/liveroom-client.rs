//! Headless conference client.
//!
//! Joins a room with synthetic capture devices and takes commands on stdin:
//! `/hand`, `/mic`, `/cam`, `/screen`, `/record`, `/mute-all`, `/unmute-all`,
//! `/mute <member>`, `/unmute <member>`, `/retry <member>`, `/leave`.
//! Any other line is sent as chat.

use liveroom::config::ClientConfig;
use liveroom::connection::ConferenceEvent;
use liveroom::devices::MediaDevices;
use liveroom::signaling::SignalingClient;
use liveroom::webrtc::WebRtcFactory;
use liveroom::{Conference, ConferenceCommand, ConferenceOptions};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_command(line: &str) -> Option<ConferenceCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match word {
        "/hand" => ConferenceCommand::RaiseHand,
        "/mic" => ConferenceCommand::ToggleAudio,
        "/cam" => ConferenceCommand::ToggleVideo,
        "/screen" => ConferenceCommand::ToggleScreenShare,
        "/record" => ConferenceCommand::ToggleRecording,
        "/mute-all" => ConferenceCommand::MuteAll(true),
        "/unmute-all" => ConferenceCommand::MuteAll(false),
        "/mute" | "/unmute" if !rest.is_empty() => ConferenceCommand::MuteOne {
            member: rest.to_string(),
            mute: word == "/mute",
        },
        "/retry" if !rest.is_empty() => ConferenceCommand::RetryLink(rest.to_string()),
        "/leave" | "/quit" => ConferenceCommand::Leave,
        _ if word.starts_with('/') => {
            warn!("Unknown command {}", word);
            return None;
        }
        _ => ConferenceCommand::SendChat(line.to_string()),
    };
    Some(command)
}

fn log_event(event: ConferenceEvent) {
    match event {
        ConferenceEvent::PhaseChanged(phase) => info!("Conference is {}", phase),
        ConferenceEvent::Roster(members) => {
            let names: Vec<_> = members.iter().map(|m| m.user_name.as_str()).collect();
            info!("In the room: {:?}", names);
        }
        ConferenceEvent::MemberJoined(m) => info!("{} ({}) joined", m.user_name, m.member_id),
        ConferenceEvent::MemberLeft(id) => info!("{} left", id),
        ConferenceEvent::LinkState { member, state } => info!("Link to {}: {}", member, state),
        ConferenceEvent::LinkClosed { member, reason } => {
            warn!("Link to {} closed: {} (/retry {} to rebuild it)", member, reason, member)
        }
        ConferenceEvent::RemoteTrack { member, kind, .. } => info!("Receiving {:?} from {}", kind, member),
        ConferenceEvent::ScreenShare { active } => info!("Screen share {}", if active { "on" } else { "off" }),
        ConferenceEvent::Chat { user_name, message, .. } => info!("[chat] {}: {}", user_name, message),
        ConferenceEvent::HandRaised { user_name, .. } => info!("{} raised a hand", user_name),
        ConferenceEvent::MuteRequested { from, mute, .. } => {
            info!("{} asked us to {}", from, if mute { "mute" } else { "unmute" })
        }
        ConferenceEvent::RecordingSaved(path) => info!("Recording saved to {}", path.display()),
        ConferenceEvent::Error { message, retryable } => {
            error!("{}{}", message, if retryable { " (retry possible)" } else { "" })
        }
    }
}

#[cfg(feature = "native-audio")]
fn capture_devices() -> Arc<dyn MediaDevices> {
    Arc::new(liveroom::audio::NativeDevices::new())
}

#[cfg(not(feature = "native-audio"))]
fn capture_devices() -> Arc<dyn MediaDevices> {
    Arc::new(liveroom::devices::SyntheticDevices::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("liveroom=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    info!(
        "Joining {} at {} as {} ({})",
        config.identity.room_id, config.signal_url, config.identity.user_name, config.identity.role
    );

    let client =
        SignalingClient::connect_with_retry(&config.signal_url, config.connect_attempts, config.connect_delay)
            .await?;
    let (signaling, server_rx) = client.into_parts();
    let factory = Arc::new(WebRtcFactory::new(&config.ice_servers)?);

    let (mut conference, mut events) =
        Conference::new(ConferenceOptions::from(&config), signaling, factory, capture_devices());
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(event);
        }
    });

    conference.join().await?;

    let (commands, commands_rx) = mpsc::unbounded_channel();
    let interrupt = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = interrupt.send(ConferenceCommand::Leave);
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(command) = parse_command(&line) {
                let leaving = command == ConferenceCommand::Leave;
                if commands.send(command).is_err() || leaving {
                    break;
                }
            }
        }
    });

    conference.run(server_rx, commands_rx).await;
    Ok(())
}
