use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the job lifecycle log (`events.jsonl`).
///
/// - default fields are `type`, `job_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - inline image payloads are replaced with `<omitted>`
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(
        &self,
        event_type: &str,
        job_id: &str,
        payload: EventPayload,
    ) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("job_id".to_string(), Value::String(job_id.to_string()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            let value = sanitize_payload(&value, &key);
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn is_inline_image_key(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "b64" | "b64_json" | "image" | "image_bytes" | "data"
    )
}

fn sanitize_payload(value: &Value, key: &str) -> Value {
    if is_inline_image_key(key) && !matches!(value, Value::Null) {
        return Value::String("<omitted>".to_string());
    }
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => {
            Value::Array(rows.iter().map(|row| sanitize_payload(row, "")).collect())
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (child_key, row) in map {
                out.insert(child_key.clone(), sanitize_payload(row, child_key));
            }
            Value::Object(out)
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
