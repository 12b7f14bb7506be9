use std::io::Write;
use std::time::Duration;

use clap::Parser;
use spiral_player::ticker::{TitleTicker, MAX_CHARS};
use spiral_player::{Player, PlayerError, PlayerHandle};
use spiral_proto::config::{Config, DecoderKind};
use spiral_proto::platform;
use spiral_proto::protocol::{PlayerCommand, PlayerEvent};
use spiral_proto::state::{PlayState, PlayerSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Command-line arguments for spiral
#[derive(Parser, Debug)]
#[command(name = "spiral")]
#[command(about = "RadioSpiral stream player")]
#[command(version)]
struct Args {
    /// Log to a file in the data directory, including decoder output
    #[arg(long)]
    log: bool,

    /// Decoder backend (overrides the config file)
    #[arg(long)]
    decoder: Option<DecoderKind>,

    /// Stream to play instead of the configured one
    #[arg(long)]
    url: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Scroll long titles in place
    #[arg(long)]
    ticker: bool,

    /// Ignore decoder binaries bundled beside the executable
    #[arg(long)]
    use_system_deps: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    platform::set_use_system_deps(args.use_system_deps);

    let (events_tx, _) = broadcast::channel::<PlayerEvent>(256);

    let mut config = Config::load()?;
    if let Some(decoder) = args.decoder {
        config.player.decoder = decoder;
    }
    if args.log {
        config.player.log_decoder_output = true;
    }

    let log_path = spiral_player::logging::init(&config.logging, args.log, events_tx.clone())?;
    if let Some(path) = log_path {
        info!("Log file: {:?}", path);
    }
    info!("Config loaded from: {:?}", Config::config_path());

    let stream_url = args
        .url
        .clone()
        .unwrap_or_else(|| config.player.stream_url.clone());

    let player = Player::from_config(&config.player, events_tx.clone());
    info!("Using {} backend, stream {}", player.kind(), stream_url);
    let (handle, player_task) = player.spawn();

    let printer = tokio::spawn(print_events(handle.subscribe(), args.json, args.ticker));

    let result = command_loop(&handle, &stream_url, args.json).await;

    if let Err(e) = handle.shutdown().await {
        debug!("shutdown: {}", e);
    }
    if let Err(e) = player_task.await {
        error!("player task failed: {}", e);
    }
    // Let the printer drain what the shutdown emitted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    result
}

/// Read commands from stdin until `quit`, EOF or Ctrl-C.
async fn command_loop(handle: &PlayerHandle, default_url: &str, json: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };

        let command = match PlayerCommand::parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("? {}", e);
                continue;
            }
        };
        if !dispatch(handle, command, default_url, json).await? {
            break;
        }
    }
    Ok(())
}

/// Run one command. Returns false when the front end should exit.
async fn dispatch(
    handle: &PlayerHandle,
    command: PlayerCommand,
    default_url: &str,
    json: bool,
) -> anyhow::Result<bool> {
    let result = match command {
        PlayerCommand::Load { url } => {
            handle
                .load(url.unwrap_or_else(|| default_url.to_string()))
                .await
        }
        PlayerCommand::Play => handle.play().await,
        PlayerCommand::Pause => handle.pause().await,
        PlayerCommand::Toggle => toggle(handle, default_url).await,
        PlayerCommand::Stop => handle.stop().await,
        PlayerCommand::Mute => handle.mute().await,
        PlayerCommand::VolumeUp => handle.inc_volume().await,
        PlayerCommand::VolumeDown => handle.dec_volume().await,
        PlayerCommand::Status => handle.status().await.map(|snapshot| {
            print_status(&snapshot, json);
        }),
        PlayerCommand::Close => handle.close().await,
        PlayerCommand::Quit => return Ok(false),
    };

    match result {
        Ok(()) => Ok(true),
        Err(PlayerError::Closed) => Ok(false),
        Err(e @ PlayerError::DeviceInit(_)) => Err(e.into()),
        Err(e) if e.is_benign() => {
            debug!("{}", e);
            Ok(true)
        }
        Err(e) => {
            warn!("{}", e);
            Ok(true)
        }
    }
}

/// The play button: start the stream when idle, stop it when playing.
async fn toggle(handle: &PlayerHandle, default_url: &str) -> Result<(), PlayerError> {
    let snapshot = handle.status().await?;
    match snapshot.state {
        PlayState::Playing => handle.stop().await,
        PlayState::Paused => handle.play().await,
        PlayState::Loading => handle.close().await,
        PlayState::Stopped => {
            let url = snapshot.url.unwrap_or_else(|| default_url.to_string());
            handle.load(url).await?;
            handle.play().await
        }
    }
}

async fn print_events(mut rx: broadcast::Receiver<PlayerEvent>, json: bool, scroll: bool) {
    let mut ticker = TitleTicker::default();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if let PlayerEvent::TitleChanged { title } = &event {
                        ticker.set_title(Some(title.clone()));
                    }
                    if let PlayerEvent::StateChanged { state: PlayState::Stopped } = &event {
                        ticker.set_title(None);
                    }
                    print_event(&event, json);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("event printer missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = interval.tick(), if scroll && !json => {
                if let Some(frame) = ticker.tick() {
                    print!("\r♪ {:<width$}", frame, width = MAX_CHARS);
                    let _ = std::io::stdout().flush();
                }
            }
        }
    }
}

fn print_event(event: &PlayerEvent, json: bool) {
    if json {
        match event.to_json_line() {
            Ok(line) => println!("{}", line),
            Err(e) => debug!("cannot encode event: {}", e),
        }
        return;
    }
    println!("{}", render_event(event));
}

fn print_status(snapshot: &PlayerSnapshot, json: bool) {
    print_event(
        &PlayerEvent::Status {
            snapshot: snapshot.clone(),
        },
        json,
    );
}

fn render_event(event: &PlayerEvent) -> String {
    match event {
        PlayerEvent::PlaybackStarted => "▶ playback started".to_string(),
        PlayerEvent::TitleChanged { title } => format!("♪ {}", title),
        PlayerEvent::StateChanged { state } => format!("[{}]", state.label()),
        PlayerEvent::VolumeChanged { volume } => format!("volume {}%", percent(*volume)),
        PlayerEvent::Status { snapshot } => render_status(snapshot),
        PlayerEvent::Error { message } => format!("error: {}", message),
        PlayerEvent::Log { message } => message.clone(),
    }
}

fn render_status(snapshot: &PlayerSnapshot) -> String {
    let mut line = format!("[{}] volume {}%", snapshot.state.label(), percent(snapshot.volume));
    if snapshot.muted {
        line.push_str(" (muted)");
    }
    if let Some(url) = &snapshot.url {
        line.push_str(&format!(" {}", url));
    }
    if let Some(title) = &snapshot.title {
        line.push_str(&format!(" ♪ {}", spiral_player::ticker::scroll_title(title, 0)));
    }
    line
}

fn percent(volume: f32) -> u32 {
    (volume * 100.0).round() as u32
}
