//! XML record files
//!
//! Every element named by the record tag becomes one [`Record`]. Inside it, leaf
//! elements become text scalars (empty leaves become nulls) and elements with children
//! become collection elements; repeating such an element name appends to the same
//! collection. Attributes and mixed content are ignored.

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{forward, read_file, RecordSink, RecordSource};
use crate::error::SourceError;
use crate::record::{FieldValue, Record, Scalar};

#[derive(Debug, Clone)]
pub struct XmlFileSource {
    path: PathBuf,
    record_tag: String,
}

impl XmlFileSource {
    pub fn new(path: impl Into<PathBuf>, record_tag: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            record_tag: record_tag.into(),
        }
    }
}

#[async_trait]
impl RecordSource for XmlFileSource {
    async fn records(&self) -> Result<Vec<Record>, SourceError> {
        let bytes = read_file(&self.path).await?;
        let records = XmlRecords::new(&bytes, &self.record_tag).collect::<Result<Vec<_>, _>>()?;
        debug!(path = %self.path.display(), records = records.len(), "Decoded XML records");
        Ok(records)
    }

    async fn stream(&self, sink: RecordSink, cancel: CancellationToken) -> Result<usize, SourceError> {
        let bytes = read_file(&self.path).await?;
        forward(XmlRecords::new(&bytes, &self.record_tag), &sink, &cancel).await
    }
}

#[derive(Debug, Default)]
struct Frame {
    name: String,
    record: Record,
    text: String,
    has_children: bool,
}

impl Frame {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Attach a finished child element to this frame
    fn adopt(&mut self, child: Frame) {
        self.has_children = true;
        if child.has_children {
            self.record.push_element(&child.name, child.record);
        } else {
            let value = if child.text.is_empty() {
                Scalar::Null
            } else {
                Scalar::Text(child.text)
            };
            self.record.insert(child.name, FieldValue::Scalar(value));
        }
    }
}

/// Pull parser yielding one record per record-tag element
pub struct XmlRecords<'a> {
    reader: Reader<&'a [u8]>,
    record_tag: &'a str,
    stack: Vec<Frame>,
    buf: Vec<u8>,
    done: bool,
}

impl<'a> XmlRecords<'a> {
    pub fn new(bytes: &'a [u8], record_tag: &'a str) -> Self {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        Self {
            reader,
            record_tag,
            stack: Vec::new(),
            buf: Vec::new(),
            done: false,
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> Option<Result<Record, SourceError>> {
        self.done = true;
        Some(Err(SourceError::Xml(format!(
            "{} at byte {}",
            message.into(),
            self.reader.buffer_position()
        ))))
    }

    /// Close the innermost element; returns the record if it was a record element
    fn close(&mut self) -> Option<Record> {
        let frame = self.stack.pop()?;
        match self.stack.last_mut() {
            Some(parent) => {
                parent.adopt(frame);
                None
            }
            None => Some(frame.record),
        }
    }
}

enum Step {
    Open(String),
    Leaf(String),
    Text(String),
    Close,
    Eof,
    Skip,
    Invalid(String),
}

fn element_name(name: quick_xml::name::LocalName<'_>) -> String {
    String::from_utf8_lossy(name.as_ref()).into_owned()
}

impl Iterator for XmlRecords<'_> {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(element)) => Step::Open(element_name(element.local_name())),
                Ok(Event::Empty(element)) => Step::Leaf(element_name(element.local_name())),
                Ok(Event::Text(text)) => match text.unescape() {
                    Ok(content) => Step::Text(content.into_owned()),
                    Err(err) => Step::Invalid(err.to_string()),
                },
                Ok(Event::CData(data)) => Step::Text(String::from_utf8_lossy(&data).into_owned()),
                Ok(Event::End(_)) => Step::Close,
                Ok(Event::Eof) => Step::Eof,
                Ok(_) => Step::Skip,
                Err(err) => Step::Invalid(err.to_string()),
            };

            match step {
                Step::Open(name) => {
                    if !self.stack.is_empty() || name == self.record_tag {
                        self.stack.push(Frame::new(name));
                    }
                }
                Step::Leaf(name) => match self.stack.last_mut() {
                    Some(parent) => parent.adopt(Frame::new(name)),
                    None if name == self.record_tag => return Some(Ok(Record::new())),
                    None => {}
                },
                Step::Text(content) => {
                    if let Some(frame) = self.stack.last_mut() {
                        frame.text.push_str(&content);
                    }
                }
                Step::Close => {
                    if let Some(record) = self.close() {
                        return Some(Ok(record));
                    }
                }
                Step::Eof => {
                    if let Some(open) = self.stack.last() {
                        let message = format!("unexpected end of input inside <{}>", open.name);
                        return self.fail(message);
                    }
                    self.done = true;
                    return None;
                }
                Step::Skip => {}
                Step::Invalid(message) => return self.fail(message),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const MIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Records>
  <Record>
    <user>alice</user>
    <dateCreated>1698412800</dateCreated>
    <location>HQ &amp; Annex</location>
    <assetName/>
    <fnumbers>
      <fNumber>FN001</fNumber>
      <scanTime>08:00</scanTime>
    </fnumbers>
    <fnumbers>
      <fNumber>FN002</fNumber>
      <scanTime><![CDATA[09:00]]></scanTime>
    </fnumbers>
  </Record>
  <Record>
    <user>bob</user>
  </Record>
</Records>"#;

    fn decode(input: &str, tag: &str) -> Vec<Result<Record, SourceError>> {
        XmlRecords::new(input.as_bytes(), tag).collect()
    }

    #[test]
    fn test_repeated_children_merge_into_collection() {
        let records: Vec<Record> = decode(MIST, "Record").into_iter().map(Result::unwrap).collect();

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.get("user"), Some(&FieldValue::Scalar(Scalar::from("alice"))));
        assert_eq!(
            first.get("location"),
            Some(&FieldValue::Scalar(Scalar::from("HQ & Annex")))
        );
        assert_eq!(first.get("assetName"), Some(&FieldValue::Scalar(Scalar::Null)));

        let (name, elements) = first.collections().next().unwrap();
        assert_eq!(name, "fnumbers");
        assert_eq!(elements.len(), 2);
        assert_eq!(
            elements[1].get("scanTime"),
            Some(&FieldValue::Scalar(Scalar::from("09:00")))
        );

        assert_eq!(records[1].len(), 1);
    }

    #[test]
    fn test_custom_record_tag() {
        let input = "<feed><item><id>1</id></item><other/><item><id>2</id></item></feed>";
        let records = decode(input, "item");
        assert_eq!(records.len(), 2);
        assert!(decode(input, "Record").is_empty());
    }

    #[test]
    fn test_malformed_xml_fails() {
        let records = decode("<Records><Record><user>a</user></Record><Record><user>b", "Record");
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(matches!(records[1], Err(SourceError::Xml(_))));
    }

    #[test]
    fn test_mismatched_end_tag_fails() {
        let records = decode("<Record><user>a</name></Record>", "Record");
        assert!(records.iter().any(Result::is_err));
    }

    #[tokio::test]
    async fn test_reads_file() {
        let mut file = tempfile::Builder::new().suffix(".xml").tempfile().unwrap();
        file.write_all(MIST.as_bytes()).unwrap();

        let source = XmlFileSource::new(file.path(), "Record");
        assert_eq!(source.records().await.unwrap().len(), 2);
    }
}
