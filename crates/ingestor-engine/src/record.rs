//! Generic nested record model
//!
//! Sources decode their input into [`Record`]s: an ordered list of named fields where
//! each field is either a scalar value or a collection of sub-records of the same
//! shape. The engine only ever reads records.

use serde::{Deserialize, Serialize};

/// A single scalar value as it will be bound into an INSERT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Name of the variant, used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::Text(_) => "text",
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Scalar::Null, Into::into)
    }
}

/// Value of one named field of a record
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Scalar),
    Collection(Vec<Record>),
}

/// An immutable nested record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scalar field, replacing an earlier field of the same name
    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(name.into(), FieldValue::Scalar(value.into()));
        self
    }

    /// Add a nested collection field, replacing an earlier field of the same name
    pub fn with_collection(mut self, name: impl Into<String>, elements: Vec<Record>) -> Self {
        self.insert(name.into(), FieldValue::Collection(elements));
        self
    }

    /// Append an element to a collection field, creating the collection if needed.
    /// A scalar already stored under `name` is replaced.
    pub fn push_element(&mut self, name: &str, element: Record) {
        match self.fields.iter_mut().find(|(key, _)| key == name) {
            Some((_, FieldValue::Collection(elements))) => elements.push(element),
            Some((_, value)) => *value = FieldValue::Collection(vec![element]),
            None => self
                .fields
                .push((name.to_string(), FieldValue::Collection(vec![element]))),
        }
    }

    pub(crate) fn insert(&mut self, name: String, value: FieldValue) {
        match self.fields.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Top-level scalar ("base") fields in declaration order
    pub fn scalars(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.fields.iter().filter_map(|(name, value)| match value {
            FieldValue::Scalar(scalar) => Some((name.as_str(), scalar)),
            FieldValue::Collection(_) => None,
        })
    }

    /// Top-level nested-collection fields in declaration order
    pub fn collections(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.fields.iter().filter_map(|(name, value)| match value {
            FieldValue::Collection(elements) => Some((name.as_str(), elements.as_slice())),
            FieldValue::Scalar(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a record from a decoded JSON object
    ///
    /// Objects become records, arrays of objects become collections and a nested
    /// object becomes a one-element collection. Arrays holding anything other than
    /// objects are kept as their JSON text. Returns `None` if `value` is not an object.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut record = Record::new();

        for (name, value) in object {
            let field = match value {
                serde_json::Value::Object(_) => {
                    FieldValue::Collection(Record::from_json(value).into_iter().collect())
                }
                serde_json::Value::Array(items) if items.iter().all(|item| item.is_object()) => {
                    FieldValue::Collection(items.iter().filter_map(Record::from_json).collect())
                }
                serde_json::Value::Array(_) => FieldValue::Scalar(Scalar::Text(value.to_string())),
                other => FieldValue::Scalar(scalar_from_json(other)),
            };
            record.insert(name.clone(), field);
        }

        Some(record)
    }
}

fn scalar_from_json(value: &serde_json::Value) -> Scalar {
    match value {
        serde_json::Value::Null => Scalar::Null,
        serde_json::Value::Bool(b) => Scalar::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Scalar::Int(i),
            None => n.as_f64().map_or_else(|| Scalar::Text(n.to_string()), Scalar::Float),
        },
        serde_json::Value::String(s) => Scalar::Text(s.clone()),
        other => Scalar::Text(other.to_string()),
    }
}
