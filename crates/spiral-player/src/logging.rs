//! tracing setup: a formatted log (stderr or file) plus a layer that
//! forwards warnings and errors to front ends as `PlayerEvent::Log`.
use std::path::PathBuf;

use spiral_proto::config::LoggingConfig;
use spiral_proto::platform;
use spiral_proto::protocol::PlayerEvent;
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE: &str = "spiral.log";

/// Forwards WARN and ERROR records to the player's event channel.
pub struct EventLayer {
    sender: broadcast::Sender<PlayerEvent>,
}

impl EventLayer {
    pub fn new(sender: broadcast::Sender<PlayerEvent>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for EventLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }
        let _ = self.sender.send(PlayerEvent::Log {
            message: format_record(event),
        });
    }
}

fn format_record(event: &tracing::Event<'_>) -> String {
    let now = chrono::Local::now();
    let mut message = format!("{} [{}] ", now.format("%H:%M:%S"), event.metadata().level());
    let mut visitor = MessageVisitor(&mut message);
    event.record(&mut visitor);
    message
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Install the global subscriber.  With `to_file` the log goes to
/// `<data_dir>/spiral.log` and its path is returned; otherwise to stderr.
/// `RUST_LOG` overrides the configured filter.
pub fn init(
    config: &LoggingConfig,
    to_file: bool,
    events: broadcast::Sender<PlayerEvent>,
) -> anyhow::Result<Option<PathBuf>> {
    let (file_layer, stderr_layer, log_path) = if to_file || config.log_to_file {
        let data_dir = platform::data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let log_path = data_dir.join(LOG_FILE);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);
        (Some(layer), None, Some(log_path))
    } else {
        let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        (None, Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(EventLayer::new(events))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.filter)),
        )
        .try_init()?;

    Ok(log_path)
}
