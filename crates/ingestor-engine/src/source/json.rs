//! JSON record files
//!
//! Accepted layouts: a top-level array of objects, an object wrapping that array under
//! the records key, or any sequence of concatenated / newline-delimited objects (each
//! of which may itself be one of the former).

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::de::SliceRead;
use serde_json::{StreamDeserializer, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{forward, read_file, RecordSink, RecordSource};
use crate::error::SourceError;
use crate::record::Record;

#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    records_key: String,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>, records_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            records_key: records_key.into(),
        }
    }
}

#[async_trait]
impl RecordSource for JsonFileSource {
    async fn records(&self) -> Result<Vec<Record>, SourceError> {
        let bytes = read_file(&self.path).await?;
        let records = JsonRecords::new(&bytes, &self.records_key).collect::<Result<Vec<_>, _>>()?;
        debug!(path = %self.path.display(), records = records.len(), "Decoded JSON records");
        Ok(records)
    }

    async fn stream(&self, sink: RecordSink, cancel: CancellationToken) -> Result<usize, SourceError> {
        let bytes = read_file(&self.path).await?;
        forward(JsonRecords::new(&bytes, &self.records_key), &sink, &cancel).await
    }
}

/// Incremental decoder over an in-memory JSON document
pub struct JsonRecords<'a> {
    values: StreamDeserializer<'a, SliceRead<'a>, Value>,
    pending: VecDeque<Value>,
    records_key: &'a str,
    failed: bool,
}

impl<'a> JsonRecords<'a> {
    pub fn new(bytes: &'a [u8], records_key: &'a str) -> Self {
        Self {
            values: serde_json::Deserializer::from_slice(bytes).into_iter::<Value>(),
            pending: VecDeque::new(),
            records_key,
            failed: false,
        }
    }
}

fn to_record(value: Value) -> Result<Record, SourceError> {
    Record::from_json(&value).ok_or_else(|| {
        SourceError::InvalidRecord(format!("expected a JSON object, found {}", value))
    })
}

impl Iterator for JsonRecords<'_> {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(value) = self.pending.pop_front() {
                return Some(to_record(value));
            }

            match self.values.next()? {
                Ok(Value::Array(items)) => self.pending.extend(items),
                Ok(Value::Object(mut object)) => match object.remove(self.records_key) {
                    Some(Value::Array(items)) => self.pending.extend(items),
                    Some(other) => {
                        object.insert(self.records_key.to_string(), other);
                        return Some(to_record(Value::Object(object)));
                    }
                    None => return Some(to_record(Value::Object(object))),
                },
                Ok(other) => {
                    self.failed = true;
                    return Some(to_record(other));
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}
