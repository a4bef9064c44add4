/// Structured logging setup using tracing
///
/// Writes to stderr so stdout stays reserved for the JSON results printed by the CLI.
/// Auto-detects format: human-readable with ANSI colors when stderr is a terminal,
/// structured JSON when piped/redirected. An optional plain-text file layer mirrors
/// everything to `log_file`.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};
use crate::config::Config;

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync + 'static>;

/// Initialize tracing subscriber with stderr output
///
/// Format auto-detection:
/// - Terminal: human-readable with ANSI colors
/// - Pipe/redirect: structured JSON
///
/// Log level from config.log_level (default: info)
/// RUST_LOG env var can override at runtime
pub fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (subscriber, file_error) =
        build_subscriber(env_filter, config.log_file.as_deref(), std::io::stderr().is_terminal());
    subscriber.init();

    if let Some(error) = file_error {
        tracing::warn!(error = %error, "Could not open log_file, logging to stderr only");
    }
}

/// Filter, optional file mirror, then the stderr layer in the detected format.
///
/// Also returns the reason `log_file` could not be opened, if it could not.
fn build_subscriber(
    env_filter: EnvFilter,
    log_file: Option<&str>,
    terminal: bool,
) -> (BoxedSubscriber, Option<String>) {
    let mut file_error = None;
    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            ),
            Err(e) => {
                file_error = Some(format!("{}: {}", path, e));
                None
            }
        }
    });

    let stderr_layer = if terminal {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer);

    (Box::new(subscriber), file_error)
}
