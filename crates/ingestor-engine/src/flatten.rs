//! Schema-driven flattening of nested records into relational rows
//!
//! A record without nested collections produces one row from its scalar fields.
//! A record with collections produces one row per collection element, each row being
//! the parent's scalar fields merged with that element's (recursively flattened)
//! fields. Sibling collections are expanded independently and their rows
//! concatenated, never cross-multiplied. Collections with no elements are ignored;
//! if every collection is empty the record still yields its base row.
//!
//! Fields are then projected through the [`Schema`]: only listed columns survive, in
//! schema order. Fields no column reads are dropped and reported, never fatal.

use std::collections::BTreeSet;

use crate::record::{Record, Scalar};
use crate::schema::Schema;

/// One relational row whose columns are all on the schema's allow-list
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlattenedRow {
    entries: Vec<(String, Scalar)>,
}

impl FlattenedRow {
    /// Build a row from column/value pairs, keeping their order
    pub fn from_pairs<I, C, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, V)>,
        C: Into<String>,
        V: Into<Scalar>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(column, value)| (column.into(), value.into()))
                .collect(),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(column, _)| column.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Scalar> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn entries(&self) -> &[(String, Scalar)] {
        &self.entries
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether both rows hold exactly the same set of columns
    pub fn same_columns(&self, other: &FlattenedRow) -> bool {
        self.len() == other.len() && self.columns().all(|column| other.get(column).is_some())
    }
}

/// Rows produced from one record plus the fields the schema discarded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    pub rows: Vec<FlattenedRow>,
    /// Dotted paths of fields no schema column reads
    pub dropped: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct FieldEntry<'r> {
    path: String,
    name: &'r str,
    value: &'r Scalar,
}

/// Turns records into schema-filtered rows
#[derive(Debug, Clone, Copy)]
pub struct Flattener<'s> {
    schema: &'s Schema,
}

impl<'s> Flattener<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema }
    }

    pub fn flatten(&self, record: &Record) -> Flattened {
        let mut flattened = Flattened::default();

        for partial in expand(record, "") {
            let row = self.project(&partial, &mut flattened.dropped);
            if !row.is_empty() {
                flattened.rows.push(row);
            }
        }

        flattened
    }

    fn project(&self, partial: &[FieldEntry<'_>], dropped: &mut BTreeSet<String>) -> FlattenedRow {
        let mut used = vec![false; partial.len()];
        let mut entries = Vec::with_capacity(self.schema.columns().len());

        for mapping in self.schema.columns() {
            let field = mapping.field();
            // Later entries are deeper in the record, so the last match wins.
            let hit = partial.iter().rposition(|entry| {
                if mapping.is_path() {
                    entry.path == field
                } else {
                    entry.name == field
                }
            });

            if let Some(index) = hit {
                used[index] = true;
                entries.push((mapping.column.clone(), partial[index].value.clone()));
            }
        }

        for (entry, used) in partial.iter().zip(used) {
            if !used {
                dropped.insert(entry.path.clone());
            }
        }

        FlattenedRow { entries }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Expand a record into partial rows, bottom-up through nested collections
fn expand<'r>(record: &'r Record, prefix: &str) -> Vec<Vec<FieldEntry<'r>>> {
    let base: Vec<FieldEntry<'r>> = record
        .scalars()
        .map(|(name, value)| FieldEntry {
            path: join_path(prefix, name),
            name,
            value,
        })
        .collect();

    let mut rows = Vec::new();
    for (name, elements) in record.collections() {
        let child_prefix = join_path(prefix, name);
        for element in elements {
            for child in expand(element, &child_prefix) {
                let mut row = base.clone();
                row.extend(child);
                rows.push(row);
            }
        }
    }

    if rows.is_empty() {
        rows.push(base);
    }
    rows
}
