//! Log fan-out
//!
//! A `tracing` layer that mirrors formatted events onto a broadcast
//! channel so connected WebSocket clients can tail daemon logs.

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Channel depth; slow readers miss old lines instead of blocking
const LOG_CHANNEL_CAPACITY: usize = 256;

pub fn channel() -> (broadcast::Sender<serde_json::Value>, BroadcastLayer) {
    let (tx, _rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
    let layer = BroadcastLayer { tx: tx.clone() };
    (tx, layer)
}

pub struct BroadcastLayer {
    tx: broadcast::Sender<serde_json::Value>,
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let payload = serde_json::json!({
            "event": "log_message",
            "data": {
                "level": event.metadata().level().to_string(),
                "target": event.metadata().target(),
                "message": visitor.message,
                "timestamp": Utc::now().to_rfc3339(),
            },
        });
        let _ = self.tx.send(payload);
    }
}

/// Pulls the `message` field out of an event
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_events_reach_subscribers() {
        let (tx, layer) = channel();
        let mut rx = tx.subscribe();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("fleet check complete");
        });

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["event"], "log_message");
        assert_eq!(msg["data"]["level"], "INFO");
        assert_eq!(msg["data"]["message"], "fleet check complete");
    }

    #[test]
    fn test_no_subscribers_no_send() {
        let (tx, layer) = channel();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("dropped on the floor");
        });
        // A late subscriber sees nothing from before it attached
        let mut rx = tx.subscribe();
        assert!(rx.try_recv().is_err());
    }
}
