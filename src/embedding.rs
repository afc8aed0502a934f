//! Addressing and invalidation of derived embedding records.
//!
//! Embedding rows are written by an external pipeline and only ever removed
//! here. Two metadata shapes exist in stored data:
//!
//! * flat: `metadata.source_table` + `metadata.source_id` (used for new writes)
//! * nested: `metadata.Metadata.<key>` with a per-kind key (legacy rows)
//!
//! [`EmbeddingIndex::invalidate`] removes rows under either shape, so callers
//! never need to know which one a given row was written with.

use anyhow::Result as AnyResult;
use serde_json::Value;

use crate::error::Result;
use crate::model::SourceRef;
use crate::store::{RecordStore, WriteBatch, WriteOp};

/// Key wrapping the legacy nested metadata object.
pub const LEGACY_METADATA_KEY: &str = "Metadata";

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> AnyResult<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Returns the raw schema string.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the raw table string.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Index name used for the flat-address expression index.
    pub fn address_index_name(&self) -> String {
        format!(
            "{}_{}_source_addr_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "embedding".to_string(),
        }
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// One of the metadata layouts that can point an embedding at its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressShape {
    /// `metadata.source_table` + `metadata.source_id`.
    Flat,
    /// `metadata.Metadata.<legacy key>`.
    Nested,
}

/// Every embedding row belonging to one source entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingAddress {
    source: SourceRef,
    shapes: Vec<AddressShape>,
}

impl EmbeddingAddress {
    /// Address covering the given shapes.
    pub fn new(source: SourceRef, shapes: Vec<AddressShape>) -> Self {
        Self { source, shapes }
    }

    /// Source entity.
    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    /// Shapes this address resolves under.
    pub fn shapes(&self) -> &[AddressShape] {
        &self.shapes
    }

    /// Whether a metadata document resolves to this address.
    pub fn matches(&self, metadata: &Value) -> bool {
        let id = self.source.id();
        self.shapes.iter().any(|shape| match shape {
            AddressShape::Flat => {
                json_text(metadata.get("source_table")).as_deref()
                    == Some(self.source.kind().table())
                    && json_text(metadata.get("source_id")).as_deref() == Some(id)
            }
            AddressShape::Nested => {
                let nested = metadata
                    .get(LEGACY_METADATA_KEY)
                    .and_then(|inner| inner.get(self.source.kind().legacy_key()));
                json_text(nested).as_deref() == Some(id)
            }
        })
    }

    /// SQL predicate over a `metadata` JSON column plus its bound values.
    ///
    /// Placeholders start at `$first_param`; every value is a bound text parameter.
    pub fn sql_predicate(&self, first_param: usize) -> (String, Vec<String>) {
        let table_param = first_param;
        let id_param = first_param + 1;
        let key_param = first_param + 2;
        let mut clauses = Vec::with_capacity(self.shapes.len());
        let mut params = vec![
            self.source.kind().table().to_string(),
            self.source.id().to_string(),
        ];
        for shape in &self.shapes {
            match shape {
                AddressShape::Flat => clauses.push(format!(
                    "(metadata->>'source_table' = ${table_param}::text \
                     AND metadata->>'source_id' = ${id_param}::text)"
                )),
                AddressShape::Nested => {
                    clauses.push(format!(
                        "(metadata->'{LEGACY_METADATA_KEY}'->>${key_param}::text = ${id_param}::text)"
                    ));
                    params.push(self.source.kind().legacy_key().to_string());
                }
            }
        }
        if clauses.is_empty() {
            return ("FALSE".to_string(), Vec::new());
        }
        (clauses.join(" OR "), params)
    }
}

/// Text value of a JSON scalar, mirroring Postgres `->>`.
fn json_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Invalidation entry point for derived embedding records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingIndex {
    legacy_cleanup: bool,
}

impl EmbeddingIndex {
    /// `legacy_cleanup` also matches the nested legacy shape.
    pub fn new(legacy_cleanup: bool) -> Self {
        Self { legacy_cleanup }
    }

    /// Whether legacy nested rows are matched.
    pub fn legacy_cleanup(&self) -> bool {
        self.legacy_cleanup
    }

    /// Address of every embedding row belonging to `source`.
    pub fn address(&self, source: &SourceRef) -> EmbeddingAddress {
        let mut shapes = vec![AddressShape::Flat];
        if self.legacy_cleanup {
            shapes.push(AddressShape::Nested);
        }
        EmbeddingAddress::new(source.clone(), shapes)
    }

    /// Write operation that invalidates `source` inside a larger batch.
    pub fn invalidation(&self, source: &SourceRef) -> WriteOp {
        WriteOp::InvalidateEmbeddings(self.address(source))
    }

    /// Deletes every embedding row of `source` in its own transaction.
    ///
    /// Returns the number of rows removed; zero matches is a success.
    pub async fn invalidate(&self, store: &dyn RecordStore, source: &SourceRef) -> Result<u64> {
        let mut batch = WriteBatch::new();
        let slot = batch.push(self.invalidation(source));
        let outcome = store.commit(batch).await?;
        let removed = outcome.rows(slot);
        tracing::debug!(source = %source, removed, "invalidated embeddings");
        Ok(removed)
    }
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new(true)
    }
}
