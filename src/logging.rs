//! Tracing setup: a compact stdout layer, a daily-rotated file layer,
//! and an optional forwarding layer that streams formatted log lines to
//! the dispatch socket (worker mode).

use std::fmt::Write as _;
use std::path::Path;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initializes the global subscriber. `forward` receives every formatted
/// line at info level and above; a worker wires it to the master link.
pub fn init_logging<P: AsRef<Path>>(
    log_dir: P,
    forward: Option<flume::Sender<String>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let file_appender = tracing_appender::rolling::daily(log_path, "arachne.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false)
        .compact();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    let forward_layer = forward.map(|tx| ForwardLayer { tx });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .with(forward_layer)
        .init();

    // the guard must outlive the program for the background writer to flush
    Box::leak(Box::new(file_guard));

    tracing::debug!(dir = %log_path.display(), "logging initialized");
    Ok(())
}

/// Renders events to single lines and pushes them onto a channel. Drops
/// lines when the channel is full rather than blocking the caller.
struct ForwardLayer {
    tx: flume::Sender<String>,
}

impl<S: tracing::Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > tracing::Level::INFO {
            return;
        }
        let mut line = format!("[{}] ", event.metadata().level());
        let mut visitor = LineVisitor { line: &mut line };
        event.record(&mut visitor);
        let _ = self.tx.try_send(line);
    }
}

struct LineVisitor<'a> {
    line: &'a mut String,
}

impl Visit for LineVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.line, "{value:?} ");
        } else {
            let _ = write!(self.line, "{}={value:?} ", field.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_layer_renders_event_fields() {
        let (tx, rx) = flume::bounded(8);
        let subscriber = tracing_subscriber::registry().with(ForwardLayer { tx });
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(url = "http://example.test", "fetched");
            tracing::debug!("too quiet to forward");
        });

        let line = rx.try_recv().unwrap();
        assert!(line.contains("fetched"));
        assert!(line.contains("url"));
        assert!(rx.try_recv().is_err());
    }
}
