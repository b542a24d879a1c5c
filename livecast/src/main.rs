use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use livecast_core::{
    logging,
    models::{GoLiveRequest, SessionId, UserId},
    service::{LiveRegistry, NotificationService},
    store, Config, Identity, StorePaths,
};
use livecast_rtc::{
    join_playback, watch_live, Broadcast, MediaConstraints, MediaFiles, SampleSource,
    WebRtcTransport,
};

#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(about = "Peer-to-peer live broadcasting over a realtime store", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, global = true, env = "LIVECAST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a live session and stream to it until interrupted
    GoLive {
        /// Broadcasting user
        #[arg(long)]
        user: String,

        /// Premium price; omit for a public session
        #[arg(long)]
        premium: Option<u32>,

        /// Message sent to followers
        #[arg(long)]
        message: Option<String>,

        /// Stream video only
        #[arg(long)]
        no_audio: bool,

        /// IVF (VP8) file played into the video track
        #[arg(long)]
        video_file: Option<PathBuf>,

        /// Ogg (Opus) file played into the audio track
        #[arg(long)]
        audio_file: Option<PathBuf>,

        /// Restart the files when they end
        #[arg(long = "loop")]
        repeat: bool,
    },

    /// Watch a live session until interrupted
    Watch {
        session: String,

        /// Watching user
        #[arg(long)]
        user: String,
    },

    /// Print live sessions, newest first
    List {
        /// Keep printing the list every time it changes
        #[arg(long)]
        follow: bool,
    },

    /// Print one live session
    Show { session: String },

    /// Print the follower notifications of a user, oldest first
    Notifications {
        #[arg(long)]
        user: String,
    },

    /// Remove abandoned live sessions
    Reap {
        /// Age in seconds after which a session is abandoned
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config)?;

    let store = store::connect(&config.store).await?;
    let paths = StorePaths::new(config.store.namespace.clone())?;
    let registry = LiveRegistry::new(store.clone(), paths.clone(), config.live.clone());

    match args.command {
        Command::GoLive {
            user,
            premium,
            message,
            no_audio,
            video_file,
            audio_file,
            repeat,
        } => {
            if no_audio && audio_file.is_some() {
                anyhow::bail!("--audio-file cannot be combined with --no-audio");
            }
            let media = MediaFiles::load(video_file.as_deref(), audio_file.as_deref()).await?;
            if media.is_empty() {
                warn!("No media files given, viewers will receive empty tracks");
            }

            let identity = Identity::authenticated(UserId::from(user));
            let request = GoLiveRequest {
                premium_amount: premium,
                notification_message: message,
            };
            let constraints = MediaConstraints {
                video: true,
                audio: !no_audio,
            };
            let transport = WebRtcTransport::new(&config.webrtc).await?;
            let source = SampleSource::default();

            let broadcast =
                Broadcast::go_live(registry, transport, &identity, request, &source, &constraints)
                    .await?;
            println!("{}", broadcast.session().id());
            info!(session_id = %broadcast.session().id(), "Live, press Ctrl+C to stop");

            let cancel = CancellationToken::new();
            let playback = match broadcast.connection().local_stream() {
                Some(stream) => media.spawn(&stream, repeat, &cancel),
                None => Vec::new(),
            };

            shutdown_signal().await;
            cancel.cancel();
            match join_playback(playback).await {
                Ok(samples) => info!(samples, "Media playback finished"),
                Err(e) => warn!("Media playback ended with an error: {}", e),
            }
            if let Err(e) = broadcast.stop_streaming().await {
                error!("Failed to stop broadcast cleanly: {}", e);
                return Err(e.into());
            }
        }
        Command::Watch { session, user } => {
            let identity = Identity::authenticated(UserId::from(user));
            let session_id = SessionId::from(session);
            let transport = WebRtcTransport::new(&config.webrtc).await?;

            let connection = watch_live(&registry, transport, &identity, &session_id, |stream| {
                for track in stream.tracks() {
                    info!(track_id = %track.id(), kind = %track.kind(), "Receiving track");
                }
            })
            .await?;

            let mut feed = registry.watch_session(&session_id).await?;
            tokio::select! {
                () = shutdown_signal() => {}
                () = async {
                    while let Some(Some(_)) = feed.next().await {}
                } => {
                    info!(session_id = %session_id, "Broadcast ended");
                }
            }
            connection.close_connection().await?;
        }
        Command::List { follow } => {
            if follow {
                let mut feed = registry.watch().await?;
                loop {
                    tokio::select! {
                        () = shutdown_signal() => break,
                        sessions = feed.next() => match sessions {
                            Some(sessions) => println!("{}", serde_json::to_string(&sessions)?),
                            None => break,
                        },
                    }
                }
            } else {
                let sessions = registry.list().await?;
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            }
        }
        Command::Show { session } => {
            let session_id = SessionId::from(session);
            match registry.get(&session_id).await? {
                Some(live) => println!("{}", serde_json::to_string_pretty(&live)?),
                None => anyhow::bail!("Session {session_id} is not live"),
            }
        }
        Command::Notifications { user } => {
            let notifications = NotificationService::new(store, paths)
                .list_follower_notifications(&UserId::from(user))
                .await?;
            println!("{}", serde_json::to_string_pretty(&notifications)?);
        }
        Command::Reap { max_age_secs } => {
            let secs = max_age_secs.unwrap_or(config.live.stale_session_secs);
            if secs == 0 {
                warn!("No maximum age given and live.stale_session_secs is 0, nothing to reap");
                return Ok(());
            }
            let reaped = registry.reap_stale(Duration::from_secs(secs)).await?;
            info!("Reaped {} stale session(s)", reaped.len());
            println!("{}", serde_json::to_string(&reaped)?);
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
