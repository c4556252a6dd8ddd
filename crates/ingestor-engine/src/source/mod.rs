//! Record sources
//!
//! A source produces a finite sequence of records either eagerly
//! ([`RecordSource::records`]) or lazily into a bounded [`RecordSink`]. Lazy streams end
//! with an explicit completion marker, so a producer that dies without finishing is
//! reported as an error instead of looking like a clean end of input.

pub mod json;
pub mod xml;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::record::Record;
use crate::schema::Schema;

pub use json::JsonFileSource;
pub use xml::XmlFileSource;

#[derive(Debug)]
enum SourceEvent {
    Record(Record),
    Failed(SourceError),
    Completed,
}

/// Producer half of a lazy record stream
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<SourceEvent>,
}

/// Consumer half of a lazy record stream
#[derive(Debug)]
pub struct RecordStream {
    rx: mpsc::Receiver<SourceEvent>,
    finished: bool,
}

/// Bounded record channel
pub fn record_channel(capacity: usize) -> (RecordSink, RecordStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RecordSink { tx },
        RecordStream {
            rx,
            finished: false,
        },
    )
}

impl RecordSink {
    /// Push one record, waiting while the channel is full.
    /// Returns `false` once the consumer has gone away.
    pub async fn send(&self, record: Record) -> bool {
        self.tx.send(SourceEvent::Record(record)).await.is_ok()
    }

    async fn complete(&self) {
        let _ = self.tx.send(SourceEvent::Completed).await;
    }

    async fn fail(&self, err: SourceError) {
        let _ = self.tx.send(SourceEvent::Failed(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl RecordStream {
    /// Next record, `Ok(None)` on completion
    pub async fn next(&mut self) -> Result<Option<Record>, SourceError> {
        if self.finished {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(SourceEvent::Record(record)) => Ok(Some(record)),
            Some(SourceEvent::Completed) => {
                self.finished = true;
                Ok(None)
            }
            Some(SourceEvent::Failed(err)) => {
                self.finished = true;
                Err(err)
            }
            None => {
                self.finished = true;
                Err(SourceError::Aborted(
                    "stream closed without completion".to_string(),
                ))
            }
        }
    }
}

/// Anything that can produce records for a run
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Materialize every record in order
    async fn records(&self) -> Result<Vec<Record>, SourceError>;

    /// Push records into `sink` until exhausted, cancelled, or the sink closes.
    /// Returns how many records were sent.
    async fn stream(&self, sink: RecordSink, cancel: CancellationToken) -> Result<usize, SourceError>;
}

/// Drive `source` on its own task, returning the consumer half
///
/// Completion and failure are both forwarded through the stream.
pub fn spawn_source(
    source: Arc<dyn RecordSource>,
    capacity: usize,
    cancel: CancellationToken,
) -> (RecordStream, JoinHandle<()>) {
    let (sink, stream) = record_channel(capacity);

    let handle = tokio::spawn(async move {
        match source.stream(sink.clone(), cancel).await {
            Ok(count) => {
                debug!(records = count, "Record source completed");
                sink.complete().await;
            }
            Err(err) => {
                warn!(error = %err, "Record source failed");
                sink.fail(err).await;
            }
        }
    });

    (stream, handle)
}

/// In-memory source, mostly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    records: Vec<Record>,
    fail_after: Option<usize>,
}

impl VecSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            fail_after: None,
        }
    }

    /// Stream the first `count` records, then fail
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn records(&self) -> Result<Vec<Record>, SourceError> {
        match self.fail_after {
            Some(count) => Err(SourceError::InvalidRecord(format!(
                "input broken after record {}",
                count
            ))),
            None => Ok(self.records.clone()),
        }
    }

    async fn stream(&self, sink: RecordSink, cancel: CancellationToken) -> Result<usize, SourceError> {
        let limit = self.fail_after.unwrap_or(self.records.len());
        let mut sent = 0;

        for record in self.records.iter().take(limit) {
            if cancel.is_cancelled() || !sink.send(record.clone()).await {
                return Ok(sent);
            }
            sent += 1;
        }

        match self.fail_after {
            Some(count) => Err(SourceError::InvalidRecord(format!(
                "input broken after record {}",
                count
            ))),
            None => Ok(sent),
        }
    }
}

/// Input formats recognised by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Json,
    Xml,
}

impl InputFormat {
    pub fn detect(path: &Path) -> Result<Self, SourceError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "json" | "jsonl" | "ndjson" => Ok(InputFormat::Json),
            "xml" => Ok(InputFormat::Xml),
            _ => Err(SourceError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Open a file source for `path`, picking the parser by extension
pub fn open_file(path: impl Into<PathBuf>, schema: &Schema) -> Result<Arc<dyn RecordSource>, SourceError> {
    let path = path.into();
    let source: Arc<dyn RecordSource> = match InputFormat::detect(&path)? {
        InputFormat::Json => Arc::new(JsonFileSource::new(path, schema.records_key())),
        InputFormat::Xml => Arc::new(XmlFileSource::new(path, schema.record_tag())),
    };
    Ok(source)
}

pub(crate) async fn read_file(path: &Path) -> Result<Vec<u8>, SourceError> {
    tokio::fs::read(path)
        .await
        .map_err(|err| SourceError::io(path, err))
}

/// Send every item of `records` into `sink`, stopping on the first error
///
/// Items are pulled one at a time, so a full sink also pauses decoding, and nothing is
/// decoded once the run is cancelled or the consumer is gone.
pub(crate) async fn forward<I>(mut records: I, sink: &RecordSink, cancel: &CancellationToken) -> Result<usize, SourceError>
where
    I: Iterator<Item = Result<Record, SourceError>>,
{
    let mut sent = 0;
    while !cancel.is_cancelled() && !sink.is_closed() {
        let Some(record) = records.next() else {
            break;
        };
        if !sink.send(record?).await {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn record(id: i64) -> Record {
        Record::new().with_scalar("id", id)
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(InputFormat::detect(Path::new("a/b.JSON")).unwrap(), InputFormat::Json);
        assert_eq!(InputFormat::detect(Path::new("b.ndjson")).unwrap(), InputFormat::Json);
        assert_eq!(InputFormat::detect(Path::new("b.xml")).unwrap(), InputFormat::Xml);
        assert!(matches!(
            InputFormat::detect(Path::new("b.csv")),
            Err(SourceError::UnsupportedFormat(_))
        ));
        assert!(InputFormat::detect(Path::new("noext")).is_err());
    }

    #[tokio::test]
    async fn test_spawned_source_signals_completion() {
        let source = Arc::new(VecSource::new(vec![record(1), record(2)]));
        let (mut stream, handle) = spawn_source(source, 1, CancellationToken::new());

        assert!(stream.next().await.unwrap().is_some());
        assert!(stream.next().await.unwrap().is_some());
        assert!(stream.next().await.unwrap().is_none());
        assert!(stream.next().await.unwrap().is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_source_forwards_failure() {
        let source = Arc::new(VecSource::new(vec![record(1), record(2)]).failing_after(1));
        let (mut stream, _handle) = spawn_source(source, 4, CancellationToken::new());

        assert!(stream.next().await.unwrap().is_some());
        assert!(matches!(stream.next().await, Err(SourceError::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn test_closed_channel_without_completion_is_an_error() {
        let (sink, mut stream) = record_channel(2);
        assert!(sink.send(record(1)).await);
        drop(sink);

        assert!(stream.next().await.unwrap().is_some());
        assert!(matches!(stream.next().await, Err(SourceError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_forward_decodes_only_as_fast_as_the_sink_drains() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let records = (0..100i64).map(move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SourceError>(record(id))
        });

        let (sink, mut stream) = record_channel(1);
        let producer =
            tokio::spawn(async move { forward(records, &sink, &CancellationToken::new()).await });

        assert!(stream.next().await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert!(pulled.load(Ordering::SeqCst) <= 3);

        drop(stream);
        assert_eq!(producer.await.unwrap().unwrap(), 2);
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forward_stops_decoding_once_cancelled() {
        let pulled = AtomicUsize::new(0);
        let records = (0..10i64).map(|id| {
            pulled.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SourceError>(record(id))
        });
        let (sink, _stream) = record_channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(forward(records, &sink, &cancel).await.unwrap(), 0);
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }
}
