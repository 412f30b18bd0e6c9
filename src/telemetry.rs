// Telemetry publishing over zenoh
//
// Every event is also logged through tracing at its source; the sink only
// forwards a JSON copy for remote operators. Publish failures never reach
// the actuation path.

use tracing::warn;
use zenoh::Wait;

use crate::messages::TelemetryEvent;

/// Destination for operator-facing events
pub trait TelemetrySink: Send {
    fn publish(&mut self, event: &TelemetryEvent);
}

/// Publishes events as JSON to `<prefix>/<kind>`
#[derive(Clone)]
pub struct ZenohTelemetry {
    session: zenoh::Session,
    prefix: String,
}

impl ZenohTelemetry {
    /// Publish on an already open session, the one the runtime shares with
    /// the intent subscriber
    pub fn with_session(session: zenoh::Session, prefix: &str) -> Self {
        Self {
            session,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn topic_for(&self, event: &TelemetryEvent) -> String {
        format!("{}/{}", self.prefix, event.kind())
    }
}

impl TelemetrySink for ZenohTelemetry {
    fn publish(&mut self, event: &TelemetryEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize telemetry event: {}", e);
                return;
            }
        };
        let topic = self.topic_for(event);
        if let Err(e) = self.session.put(topic.clone(), json).wait() {
            warn!("Failed to publish telemetry to {}: {}", topic, e);
        }
    }
}
