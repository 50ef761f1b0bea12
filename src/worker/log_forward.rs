//! Forward worker-side tracing events to the UI side as `log` responses.

use crate::protocol::{LogLevel, Response};
use std::fmt::{self, Write as _};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

/// A [`Layer`] that turns every event into a [`Response::Log`].
pub struct ForwardLayer {
    responses: mpsc::UnboundedSender<Response>,
}

impl ForwardLayer {
    pub fn new(responses: mpsc::UnboundedSender<Response>) -> Self {
        Self { responses }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = LogLevel::from(event.metadata().level());
        // nobody left to tell once the channel is gone
        let _ = self.responses.send(Response::log(level, visitor.finish()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}

/// Subscriber used inside a worker: everything at `level` or above is
/// forwarded, nothing is printed locally.
pub fn subscriber(
    responses: mpsc::UnboundedSender<Response>,
    level: LevelFilter,
) -> impl Subscriber + Send + Sync + 'static {
    Registry::default()
        .with(level)
        .with(ForwardLayer::new(responses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    #[test]
    fn test_events_become_log_responses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracing::subscriber::with_default(subscriber(tx, LevelFilter::DEBUG), || {
            info!("Worker ready");
            warn!(object_id = 3, "Deleted unknown object");
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Response::log(LogLevel::Info, "Worker ready")
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Response::log(LogLevel::Warn, "Deleted unknown object object_id=3")
        );
    }

    #[test]
    fn test_level_filter_applies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracing::subscriber::with_default(subscriber(tx, LevelFilter::INFO), || {
            debug!("too chatty");
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tracing::subscriber::with_default(subscriber(tx, LevelFilter::INFO), || {
            info!("into the void");
        });
    }
}
