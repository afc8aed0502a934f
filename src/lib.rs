#![warn(missing_docs)]
//! Knowledge-base administration backend.
//!
//! Keeps derived embedding records consistent with the authoritative fund,
//! manual step, scenario and glossary tables, and guards fund deletion against
//! silently breaking the manual steps that reference a fund.
//!
//! The `test-util` feature exposes an in-memory [`RecordStore`] for tests.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod ids;
pub mod model;
pub mod regen;
pub mod store;
pub mod tags;

pub use coordinator::{Coordinator, FundDeletion};
pub use embedding::{EmbeddingAddress, EmbeddingIndex, TableName};
pub use error::{DependentConflict, DependentStep, KbError, Result};
pub use ids::IdSequence;
pub use model::{
    Faq, FaqDraft, Fund, FundDraft, FundQuery, FundStatus, ManualStep, Scenario, ScenarioDraft,
    ScenarioQuery, SourceKind, SourceRef, StepDraft, StepQuery, Term, TermDraft, TermListing,
};
pub use regen::{DisabledDispatcher, Regenerate, RegenerationRequest};
#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryStore;
pub use store::{BatchOutcome, PgStore, RecordStore, WriteBatch, WriteOp};
pub use tags::TagSet;
