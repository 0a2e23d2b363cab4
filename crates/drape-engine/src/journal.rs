use drape_contracts::events::{EventPayload, EventWriter};
use serde_json::Value;

/// Optional job-event sink. A failed write is logged and otherwise ignored:
/// the audit log never decides the outcome of a job.
#[derive(Debug, Clone, Default)]
pub struct JobJournal {
    writer: Option<EventWriter>,
}

impl JobJournal {
    pub fn new(writer: EventWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// `payload` should be a JSON object; anything else is recorded under `value`.
    pub fn record(&self, event_type: &str, job_id: &str, payload: Value) {
        let Some(writer) = &self.writer else {
            return;
        };
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => EventPayload::new(),
            other => {
                let mut map = EventPayload::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if let Err(err) = writer.emit(event_type, job_id, payload) {
            tracing::warn!(
                job_id = %job_id,
                event = event_type,
                error = %err,
                "failed to append job event"
            );
        }
    }
}
