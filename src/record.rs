//! Structured log records and their newline-delimited JSON wire frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which the record timestamp is stored.
pub const TIMESTAMP_KEY: &str = "@timestamp";

/// Reserved key carrying the static API token on streamed records.
pub const TOKEN_KEY: &str = "token";

/// Timestamp layout expected by the collector, always UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// A flattened structured log line.
///
/// Values are limited to what JSON can carry (string, number, bool, null,
/// object, array), so every record can be serialized without reflection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord {
    fields: Map<String, Value>,
}

impl LogRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing any previous value under the same key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set `@timestamp` unless the producer already supplied one.
    pub fn stamp(&mut self, at: DateTime<Utc>) {
        if !self.fields.contains_key(TIMESTAMP_KEY) {
            self.fields
                .insert(TIMESTAMP_KEY.to_string(), Value::String(format_timestamp(at)));
        }
    }

    /// Encode the record as one `<json-object>\n` frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut frame = serde_json::to_vec(&self.fields)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Encode the record with `token` merged in under [`TOKEN_KEY`].
    ///
    /// The buffered record itself is left untouched.
    pub fn to_frame_with_token(&self, token: Option<&str>) -> Result<Vec<u8>, serde_json::Error> {
        match token {
            Some(token) => {
                let mut fields = self.fields.clone();
                fields.insert(TOKEN_KEY.to_string(), Value::String(token.to_string()));
                let mut frame = serde_json::to_vec(&fields)?;
                frame.push(b'\n');
                Ok(frame)
            }
            None => self.to_frame(),
        }
    }
}

impl From<Map<String, Value>> for LogRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TryFrom<Value> for LogRecord {
    type Error = Value;

    /// Only JSON objects are records; any other value is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(other),
        }
    }
}

/// Format a timestamp as `yyyy-MM-ddTHH:mm:ss.SSSZ`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}
