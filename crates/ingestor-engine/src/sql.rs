//! Dynamic multi-row INSERT generation
//!
//! Statements only ever contain schema-validated identifiers and placeholders.
//! Every value travels as a bound parameter, so field content cannot change the
//! statement's structure.

use crate::error::SqlError;
use crate::flatten::FlattenedRow;
use crate::record::Scalar;
use crate::schema::{quote_identifier, PlaceholderStyle, Schema};

/// Upper bound on bound parameters per statement (PostgreSQL protocol limit)
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// A parameterized INSERT and its values in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    /// Unquoted target table
    pub table: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub values: Vec<Scalar>,
    pub row_count: usize,
}

/// Builds INSERT statements for one schema
#[derive(Debug, Clone)]
pub struct InsertBuilder<'s> {
    schema: &'s Schema,
    max_parameters: usize,
}

impl<'s> InsertBuilder<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            max_parameters: MAX_BIND_PARAMETERS,
        }
    }

    /// Lower the per-statement parameter budget (at least one row always fits)
    pub fn with_max_parameters(mut self, max_parameters: usize) -> Self {
        self.max_parameters = max_parameters.max(1);
        self
    }

    /// One INSERT for rows sharing the same column set
    ///
    /// The first row fixes the column order; later rows are bound in that order.
    pub fn build(&self, rows: &[FlattenedRow]) -> Result<InsertStatement, SqlError> {
        let first = rows.first().ok_or(SqlError::NoRows)?;
        if first.is_empty() {
            return Err(SqlError::EmptyRow);
        }

        let columns: Vec<String> = first.columns().map(str::to_string).collect();
        for column in &columns {
            if !self.schema.allows(column) {
                return Err(SqlError::ColumnNotAllowed(column.clone()));
            }
        }

        let mut values = Vec::with_capacity(columns.len() * rows.len());
        for (index, row) in rows.iter().enumerate() {
            if !row.same_columns(first) {
                return Err(SqlError::ColumnMismatch {
                    index,
                    expected: columns.clone(),
                    found: row.columns().map(str::to_string).collect(),
                });
            }
            for column in &columns {
                values.push(row.get(column).cloned().unwrap_or(Scalar::Null));
            }
        }

        Ok(InsertStatement {
            table: self.schema.table().to_string(),
            sql: self.render(&columns, rows.len()),
            columns,
            values,
            row_count: rows.len(),
        })
    }

    /// Statements for an arbitrary row list
    ///
    /// Rows are grouped by column set in order of first appearance, and each group is
    /// split so no statement exceeds the parameter budget.
    pub fn build_all(&self, rows: &[FlattenedRow]) -> Result<Vec<InsertStatement>, SqlError> {
        let mut statements = Vec::new();

        for group in group_by_columns(rows) {
            let per_row = group[0].len().max(1);
            let rows_per_statement = (self.max_parameters / per_row).max(1);
            for chunk in group.chunks(rows_per_statement) {
                statements.push(self.build(chunk)?);
            }
        }

        Ok(statements)
    }

    fn render(&self, columns: &[String], row_count: usize) -> String {
        let column_list = columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.schema.quoted_table(),
            column_list
        );

        let mut parameter = 0usize;
        for row in 0..row_count {
            if row > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for (position, column) in columns.iter().enumerate() {
                if position > 0 {
                    sql.push_str(", ");
                }
                parameter += 1;
                self.push_placeholder(&mut sql, parameter, column);
            }
            sql.push(')');
        }

        sql
    }

    fn push_placeholder(&self, sql: &mut String, parameter: usize, column: &str) {
        let placeholder = match self.schema.placeholder() {
            PlaceholderStyle::Dollar => format!("${}", parameter),
            PlaceholderStyle::Question => "?".to_string(),
        };

        match self.schema.column(column).and_then(|m| m.sql_type.as_deref()) {
            Some(sql_type) => sql.push_str(&format!("CAST({} AS {})", placeholder, sql_type)),
            None => sql.push_str(&placeholder),
        }
    }
}

/// Group rows by identical column set, preserving first-appearance order
pub fn group_by_columns(rows: &[FlattenedRow]) -> Vec<Vec<FlattenedRow>> {
    let mut groups: Vec<Vec<FlattenedRow>> = Vec::new();

    for row in rows.iter().filter(|row| !row.is_empty()) {
        match groups.iter_mut().find(|group| group[0].same_columns(row)) {
            Some(group) => group.push(row.clone()),
            None => groups.push(vec![row.clone()]),
        }
    }

    groups
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn schema(style: PlaceholderStyle) -> Schema {
        Schema::builder("sflw_recs")
            .column("user")
            .column_from("dt_created", "dateCreated")
            .cast("bigint")
            .column("status")
            .placeholder(style)
            .build()
            .unwrap()
    }

    fn row(user: &str, created: &str) -> FlattenedRow {
        FlattenedRow::from_pairs([("user", user), ("dt_created", created)])
    }

    #[test]
    fn test_multi_row_insert_with_dollar_placeholders() {
        let schema = schema(PlaceholderStyle::Dollar);
        let statement = InsertBuilder::new(&schema)
            .build(&[row("alice", "1"), row("bob", "2")])
            .unwrap();

        assert_eq!(
            statement.sql,
            "INSERT INTO \"sflw_recs\" (\"user\", \"dt_created\") VALUES \
             ($1, CAST($2 AS bigint)), ($3, CAST($4 AS bigint))"
        );
        assert_eq!(
            statement.values,
            vec![
                Scalar::from("alice"),
                Scalar::from("1"),
                Scalar::from("bob"),
                Scalar::from("2"),
            ]
        );
        assert_eq!(statement.row_count, 2);
    }

    #[test]
    fn test_question_placeholders() {
        let schema = schema(PlaceholderStyle::Question);
        let statement = InsertBuilder::new(&schema)
            .build(&[FlattenedRow::from_pairs([("user", "a"), ("status", "b")])])
            .unwrap();

        assert_eq!(
            statement.sql,
            "INSERT INTO \"sflw_recs\" (\"user\", \"status\") VALUES (?, ?)"
        );
    }

    #[test]
    fn test_first_row_fixes_column_order() {
        let schema = schema(PlaceholderStyle::Dollar);
        let rows = vec![
            FlattenedRow::from_pairs([("status", "s1"), ("user", "u1")]),
            FlattenedRow::from_pairs([("user", "u2"), ("status", "s2")]),
        ];

        let statement = InsertBuilder::new(&schema).build(&rows).unwrap();

        assert_eq!(statement.columns, vec!["status", "user"]);
        assert_eq!(
            statement.values,
            vec![
                Scalar::from("s1"),
                Scalar::from("u1"),
                Scalar::from("s2"),
                Scalar::from("u2"),
            ]
        );
    }

    #[test]
    fn test_mismatched_rows_rejected() {
        let schema = schema(PlaceholderStyle::Dollar);
        let rows = vec![row("a", "1"), FlattenedRow::from_pairs([("user", "b")])];

        match InsertBuilder::new(&schema).build(&rows) {
            Err(SqlError::ColumnMismatch { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(InsertBuilder::new(&schema).build(&[]), Err(SqlError::NoRows));
    }

    #[test]
    fn test_columns_outside_schema_rejected() {
        let schema = schema(PlaceholderStyle::Dollar);
        let rows = vec![FlattenedRow::from_pairs([("password", "x")])];
        assert_eq!(
            InsertBuilder::new(&schema).build(&rows),
            Err(SqlError::ColumnNotAllowed("password".to_string()))
        );
    }

    #[test]
    fn test_metacharacters_only_reach_bound_values() {
        let schema = schema(PlaceholderStyle::Dollar);
        let hostile = "x'); DROP TABLE sflw_recs; --";
        let statement = InsertBuilder::new(&schema)
            .build(&[row(hostile, "1")])
            .unwrap();

        assert!(!statement.sql.contains("DROP"));
        assert_eq!(statement.values[0], Scalar::from(hostile));
    }

    #[test]
    fn test_build_all_groups_and_chunks() {
        let schema = schema(PlaceholderStyle::Dollar);
        let rows = vec![
            row("a", "1"),
            FlattenedRow::from_pairs([("user", "b")]),
            row("c", "3"),
            row("d", "4"),
            FlattenedRow::default(),
        ];

        let statements = InsertBuilder::new(&schema)
            .with_max_parameters(4)
            .build_all(&rows)
            .unwrap();

        let counts: Vec<usize> = statements.iter().map(|s| s.row_count).collect();
        assert_eq!(counts, vec![2, 1, 1]);
        assert_eq!(statements[2].columns, vec!["user"]);
        assert!(statements[1].sql.ends_with("($1, CAST($2 AS bigint))"));
    }
}
