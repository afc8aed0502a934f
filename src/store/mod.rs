//! Access to the authoritative administrative tables.
//!
//! Reads go straight to the store. Writes that must land together (a row
//! mutation plus the invalidation of its embeddings) are expressed as a
//! [`WriteBatch`] and applied by [`RecordStore::commit`] in one transaction.

use async_trait::async_trait;

use crate::embedding::EmbeddingAddress;
use crate::error::Result;
use crate::ids::IdSequence;
use crate::model::{
    Faq, FaqDraft, Fund, FundQuery, ManualStep, Scenario, ScenarioDraft, ScenarioQuery,
    StepDraft, StepQuery, Term,
};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One write inside a [`WriteBatch`].
///
/// Updates that match no row abort the whole batch with
/// [`KbError::NotFound`](crate::KbError::NotFound); deletes and invalidations
/// report how many rows they touched and succeed on zero.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a fund with a pre-generated id.
    InsertFund(Fund),
    /// Replace every column of an existing fund.
    UpdateFund(Fund),
    /// Remove a fund row.
    DeleteFund {
        /// Fund id.
        fund_id: String,
    },
    /// Replace every column of an existing manual step.
    UpdateStep(ManualStep),
    /// Rewrite only the fund reference list of a manual step.
    SetStepFunds {
        /// Step id.
        chunk_id: i32,
        /// Serialized reference list.
        fund_abbr: Option<String>,
    },
    /// Remove a manual step row.
    DeleteStep {
        /// Step id.
        chunk_id: i32,
    },
    /// Replace every column of an existing scenario.
    UpdateScenario(Scenario),
    /// Remove a scenario row.
    DeleteScenario {
        /// Scenario id.
        id: i32,
    },
    /// Insert a term with a pre-generated id.
    InsertTerm(Term),
    /// Replace every column of an existing term.
    UpdateTerm(Term),
    /// Remove a term row.
    DeleteTerm {
        /// Term id.
        word_id: String,
    },
    /// Delete every embedding row resolving to an address.
    InvalidateEmbeddings(EmbeddingAddress),
}

/// Ordered writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an op and returns its slot in the [`BatchOutcome`].
    pub fn push(&mut self, op: WriteOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Ops in application order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Rows touched by each op of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    rows: Vec<u64>,
}

impl BatchOutcome {
    /// Wraps per-op row counts.
    pub fn new(rows: Vec<u64>) -> Self {
        Self { rows }
    }

    /// Rows touched by the op at `slot`.
    pub fn rows(&self, slot: usize) -> u64 {
        self.rows.get(slot).copied().unwrap_or(0)
    }
}

/// Parameterized access to the administrative tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Funds matching `query`, ordered by id.
    async fn list_funds(&self, query: &FundQuery) -> Result<Vec<Fund>>;

    /// Fund by id.
    async fn fund(&self, fund_id: &str) -> Result<Option<Fund>>;

    /// Largest numeric suffix currently used by `sequence`.
    async fn max_sequence(&self, sequence: IdSequence) -> Result<Option<u32>>;

    /// Manual steps matching `query`, ordered by id.
    async fn list_steps(&self, query: &StepQuery) -> Result<Vec<ManualStep>>;

    /// Manual step by id.
    async fn step(&self, chunk_id: i32) -> Result<Option<ManualStep>>;

    /// Steps whose raw reference list contains `needle` as a substring.
    ///
    /// This is only a pre-filter; token membership is decided by the caller.
    async fn steps_mentioning(&self, needle: &str) -> Result<Vec<ManualStep>>;

    /// Inserts a manual step and returns it with its assigned id.
    async fn insert_step(&self, draft: &StepDraft) -> Result<ManualStep>;

    /// Scenarios matching `query`, ordered by id.
    async fn list_scenarios(&self, query: &ScenarioQuery) -> Result<Vec<Scenario>>;

    /// Scenario by id.
    async fn scenario(&self, id: i32) -> Result<Option<Scenario>>;

    /// Inserts a scenario and returns it with its assigned id.
    async fn insert_scenario(&self, draft: &ScenarioDraft) -> Result<Scenario>;

    /// Terms whose word contains `search` (case-insensitive), ordered by id.
    async fn list_terms(&self, search: Option<&str>) -> Result<Vec<Term>>;

    /// Distinct non-empty word types, sorted.
    async fn term_types(&self) -> Result<Vec<String>>;

    /// Term by id.
    async fn term(&self, word_id: &str) -> Result<Option<Term>>;

    /// Every FAQ, ordered by id.
    async fn list_faqs(&self) -> Result<Vec<Faq>>;

    /// Inserts a FAQ and returns it with its assigned id.
    async fn insert_faq(&self, draft: &FaqDraft) -> Result<Faq>;

    /// Replaces a FAQ; `None` when the id does not exist.
    async fn update_faq(&self, faq: &Faq) -> Result<Option<Faq>>;

    /// Removes a FAQ and returns the number of rows deleted.
    async fn delete_faq(&self, id: i32) -> Result<u64>;

    /// Applies every op of `batch` in one transaction.
    async fn commit(&self, batch: WriteBatch) -> Result<BatchOutcome>;
}

/// Builds a `LIKE`/`ILIKE` pattern matching `needle` anywhere, with
/// wildcard characters escaped.
pub(crate) fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("ABC"), "%ABC%");
        assert_eq!(contains_pattern("A_B%"), "%A\\_B\\%%");
        assert_eq!(contains_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn batch_slots_follow_push_order() {
        let mut batch = WriteBatch::new();
        assert_eq!(batch.push(WriteOp::DeleteStep { chunk_id: 1 }), 0);
        assert_eq!(batch.push(WriteOp::DeleteStep { chunk_id: 2 }), 1);
        assert_eq!(batch.len(), 2);
        let outcome = BatchOutcome::new(vec![1, 0]);
        assert_eq!(outcome.rows(0), 1);
        assert_eq!(outcome.rows(5), 0);
    }
}
