use std::fmt;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, layer::Context};

use crate::{contract::Payload, jsonrpc::Request, message::LogRecord};

/// Method of the notification carrying a [`LogRecord`] to the host.
pub const LOG_RECORD: &str = "log.record";

/// Tracing layer that ships every event to the host as a `log.record`
/// notification, written to the same output queue as the responses.
pub struct HostLogLayer {
    tx: UnboundedSender<String>,
}

impl HostLogLayer {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let record = LogRecord {
            level: metadata.level().into(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            at: Utc::now(),
        };
        let Ok(params) = serde_json::to_value(&record) else {
            return;
        };
        if let Ok(line) = serde_json::to_string(&Request::notification(LOG_RECORD, Some(params))) {
            let _ = self.tx.send(format!("{line}\n"));
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    fields: Payload,
}

impl RecordVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }
}
