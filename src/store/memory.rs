//! In-process [`RecordStore`] with the same semantics as the Postgres store.
//!
//! Batches are applied to a copy of the tables and swapped in only when every
//! op succeeds, so a failing batch leaves no trace.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{BatchOutcome, RecordStore, WriteBatch, WriteOp};
use crate::embedding::EmbeddingAddress;
use crate::error::{KbError, Result};
use crate::ids::IdSequence;
use crate::model::{
    Faq, FaqDraft, Fund, FundQuery, ManualStep, Scenario, ScenarioDraft, ScenarioQuery,
    StepDraft, StepQuery, Term,
};

/// Embedding row as seen by the invalidation path: an id plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    /// Row id.
    pub id: i64,
    /// Metadata document written by the pipeline.
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    funds: BTreeMap<String, Fund>,
    steps: BTreeMap<i32, ManualStep>,
    scenarios: BTreeMap<i32, Scenario>,
    terms: BTreeMap<String, Term>,
    faqs: BTreeMap<i32, Faq>,
    embeddings: Vec<StoredEmbedding>,
    next_step: i32,
    next_scenario: i32,
    next_faq: i32,
    next_embedding: i64,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    // commits left before an injected failure
    fail_after: Option<usize>,
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a fund outside any batch.
    pub async fn seed_fund(&self, fund: Fund) {
        let mut state = self.state.lock().await;
        state.tables.funds.insert(fund.fund_id.clone(), fund);
    }

    /// Inserts or replaces a manual step outside any batch.
    pub async fn seed_step(&self, step: ManualStep) {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;
        tables.next_step = tables.next_step.max(step.chunk_id);
        tables.steps.insert(step.chunk_id, step);
    }

    /// Inserts or replaces a scenario outside any batch.
    pub async fn seed_scenario(&self, scenario: Scenario) {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;
        tables.next_scenario = tables.next_scenario.max(scenario.id);
        tables.scenarios.insert(scenario.id, scenario);
    }

    /// Inserts or replaces a term outside any batch.
    pub async fn seed_term(&self, term: Term) {
        let mut state = self.state.lock().await;
        state.tables.terms.insert(term.word_id.clone(), term);
    }

    /// Stores an embedding row the way the external pipeline would.
    pub async fn seed_embedding(&self, metadata: Value) -> i64 {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;
        tables.next_embedding += 1;
        let id = tables.next_embedding;
        tables.embeddings.push(StoredEmbedding { id, metadata });
        id
    }

    /// Embedding rows resolving to `address`.
    pub async fn embeddings_at(&self, address: &EmbeddingAddress) -> Vec<StoredEmbedding> {
        let state = self.state.lock().await;
        state
            .tables
            .embeddings
            .iter()
            .filter(|row| address.matches(&row.metadata))
            .cloned()
            .collect()
    }

    /// Total embedding rows.
    pub async fn embedding_count(&self) -> usize {
        self.state.lock().await.tables.embeddings.len()
    }

    /// Lets `successes` more commits through, then fails the next one.
    pub async fn fail_commit_after(&self, successes: usize) {
        self.state.lock().await.fail_after = Some(successes);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_funds(&self, query: &FundQuery) -> Result<Vec<Fund>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .funds
            .values()
            .filter(|fund| {
                query.search.as_deref().map_or(true, |needle| {
                    contains_ci(Some(&fund.fund_abbr), needle)
                        || contains_ci(fund.fund_name_th.as_deref(), needle)
                        || contains_ci(fund.source_agency.as_deref(), needle)
                })
            })
            .filter(|fund| query.admits(fund.status))
            .cloned()
            .collect())
    }

    async fn fund(&self, fund_id: &str) -> Result<Option<Fund>> {
        Ok(self.state.lock().await.tables.funds.get(fund_id).cloned())
    }

    async fn max_sequence(&self, sequence: IdSequence) -> Result<Option<u32>> {
        let state = self.state.lock().await;
        let tables = &state.tables;
        let max = match sequence {
            IdSequence::Fund => tables.funds.keys().filter_map(|id| sequence.parse(id)).max(),
            IdSequence::Term => tables.terms.keys().filter_map(|id| sequence.parse(id)).max(),
        };
        Ok(max)
    }

    async fn list_steps(&self, query: &StepQuery) -> Result<Vec<ManualStep>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .steps
            .values()
            .filter(|step| {
                query.search.as_deref().map_or(true, |needle| {
                    [
                        &step.document_title,
                        &step.category_main,
                        &step.category_sub,
                        &step.topic,
                        &step.section,
                        &step.chunk_content,
                        &step.fund_abbr,
                        &step.data_type,
                    ]
                    .into_iter()
                    .any(|field| contains_ci(field.as_deref(), needle))
                })
            })
            .filter(|step| {
                query
                    .document_title
                    .as_deref()
                    .map_or(true, |title| step.document_title.as_deref() == Some(title))
            })
            .cloned()
            .collect())
    }

    async fn step(&self, chunk_id: i32) -> Result<Option<ManualStep>> {
        Ok(self.state.lock().await.tables.steps.get(&chunk_id).cloned())
    }

    async fn steps_mentioning(&self, needle: &str) -> Result<Vec<ManualStep>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .steps
            .values()
            .filter(|step| {
                step.fund_abbr
                    .as_deref()
                    .is_some_and(|raw| raw.contains(needle))
            })
            .cloned()
            .collect())
    }

    async fn insert_step(&self, draft: &StepDraft) -> Result<ManualStep> {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;
        tables.next_step += 1;
        let step = draft.clone().into_step(tables.next_step);
        tables.steps.insert(step.chunk_id, step.clone());
        Ok(step)
    }

    async fn list_scenarios(&self, query: &ScenarioQuery) -> Result<Vec<Scenario>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .scenarios
            .values()
            .filter(|scenario| {
                query.search.as_deref().map_or(true, |needle| {
                    contains_ci(scenario.scenario_name.as_deref(), needle)
                        || contains_ci(scenario.scenario.as_deref(), needle)
                })
            })
            .filter(|scenario| {
                query
                    .tag
                    .as_deref()
                    .map_or(true, |tag| scenario.tag.as_deref() == Some(tag))
            })
            .cloned()
            .collect())
    }

    async fn scenario(&self, id: i32) -> Result<Option<Scenario>> {
        Ok(self.state.lock().await.tables.scenarios.get(&id).cloned())
    }

    async fn insert_scenario(&self, draft: &ScenarioDraft) -> Result<Scenario> {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;
        tables.next_scenario += 1;
        let scenario = draft.clone().into_scenario(tables.next_scenario);
        tables.scenarios.insert(scenario.id, scenario.clone());
        Ok(scenario)
    }

    async fn list_terms(&self, search: Option<&str>) -> Result<Vec<Term>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .terms
            .values()
            .filter(|term| search.map_or(true, |needle| contains_ci(term.word.as_deref(), needle)))
            .cloned()
            .collect())
    }

    async fn term_types(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut types: Vec<String> = state
            .tables
            .terms
            .values()
            .filter_map(|term| term.word_type.clone())
            .filter(|word_type| !word_type.is_empty())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn term(&self, word_id: &str) -> Result<Option<Term>> {
        Ok(self.state.lock().await.tables.terms.get(word_id).cloned())
    }

    async fn list_faqs(&self) -> Result<Vec<Faq>> {
        Ok(self.state.lock().await.tables.faqs.values().cloned().collect())
    }

    async fn insert_faq(&self, draft: &FaqDraft) -> Result<Faq> {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;
        tables.next_faq += 1;
        let faq = Faq {
            id: tables.next_faq,
            question: draft.question.clone(),
            answer: draft.answer.clone(),
        };
        tables.faqs.insert(faq.id, faq.clone());
        Ok(faq)
    }

    async fn update_faq(&self, faq: &Faq) -> Result<Option<Faq>> {
        let mut state = self.state.lock().await;
        Ok(state.tables.faqs.get_mut(&faq.id).map(|slot| {
            *slot = faq.clone();
            slot.clone()
        }))
    }

    async fn delete_faq(&self, id: i32) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(u64::from(state.tables.faqs.remove(&id).is_some()))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<BatchOutcome> {
        let mut state = self.state.lock().await;
        if let Some(remaining) = state.fail_after {
            if remaining == 0 {
                state.fail_after = None;
                return Err(KbError::Internal(anyhow!("injected commit failure")));
            }
            state.fail_after = Some(remaining - 1);
        }
        let mut staged = state.tables.clone();
        let mut rows = Vec::with_capacity(batch.len());
        for op in batch {
            rows.push(apply(&mut staged, op)?);
        }
        state.tables = staged;
        Ok(BatchOutcome::new(rows))
    }
}

fn apply(tables: &mut Tables, op: WriteOp) -> Result<u64> {
    match op {
        WriteOp::InsertFund(fund) => {
            if tables.funds.contains_key(&fund.fund_id) {
                return Err(KbError::DuplicateKey {
                    entity: "fund",
                    id: fund.fund_id,
                });
            }
            tables.funds.insert(fund.fund_id.clone(), fund);
            Ok(1)
        }
        WriteOp::UpdateFund(fund) => match tables.funds.get_mut(&fund.fund_id) {
            Some(slot) => {
                *slot = fund;
                Ok(1)
            }
            None => Err(KbError::not_found("fund", fund.fund_id)),
        },
        WriteOp::DeleteFund { fund_id } => Ok(u64::from(tables.funds.remove(&fund_id).is_some())),
        WriteOp::UpdateStep(step) => match tables.steps.get_mut(&step.chunk_id) {
            Some(slot) => {
                *slot = step;
                Ok(1)
            }
            None => Err(KbError::not_found("manual step", step.chunk_id)),
        },
        WriteOp::SetStepFunds {
            chunk_id,
            fund_abbr,
        } => match tables.steps.get_mut(&chunk_id) {
            Some(slot) => {
                slot.fund_abbr = fund_abbr;
                Ok(1)
            }
            None => Err(KbError::not_found("manual step", chunk_id)),
        },
        WriteOp::DeleteStep { chunk_id } => Ok(u64::from(tables.steps.remove(&chunk_id).is_some())),
        WriteOp::UpdateScenario(scenario) => match tables.scenarios.get_mut(&scenario.id) {
            Some(slot) => {
                *slot = scenario;
                Ok(1)
            }
            None => Err(KbError::not_found("scenario", scenario.id)),
        },
        WriteOp::DeleteScenario { id } => Ok(u64::from(tables.scenarios.remove(&id).is_some())),
        WriteOp::InsertTerm(term) => {
            if tables.terms.contains_key(&term.word_id) {
                return Err(KbError::DuplicateKey {
                    entity: "term",
                    id: term.word_id,
                });
            }
            tables.terms.insert(term.word_id.clone(), term);
            Ok(1)
        }
        WriteOp::UpdateTerm(term) => match tables.terms.get_mut(&term.word_id) {
            Some(slot) => {
                *slot = term;
                Ok(1)
            }
            None => Err(KbError::not_found("term", term.word_id)),
        },
        WriteOp::DeleteTerm { word_id } => Ok(u64::from(tables.terms.remove(&word_id).is_some())),
        WriteOp::InvalidateEmbeddings(address) => {
            let before = tables.embeddings.len();
            tables
                .embeddings
                .retain(|row| !address.matches(&row.metadata));
            Ok((before - tables.embeddings.len()) as u64)
        }
    }
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|text| text.to_lowercase().contains(&needle.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingIndex;
    use crate::model::{FundStatus, SourceKind, SourceRef};
    use serde_json::json;

    fn step(chunk_id: i32, fund_abbr: &str) -> ManualStep {
        StepDraft {
            topic: Some(format!("step {chunk_id}")),
            fund_abbr: Some(fund_abbr.to_string()),
            ..StepDraft::default()
        }
        .into_step(chunk_id)
    }

    #[tokio::test]
    async fn failed_batch_leaves_tables_untouched() {
        let store = MemoryStore::new();
        store.seed_step(step(1, "ABC")).await;
        store
            .seed_embedding(json!({"source_table": "manual", "source_id": "1"}))
            .await;

        let index = EmbeddingIndex::default();
        let mut batch = WriteBatch::new();
        batch.push(index.invalidation(&SourceRef::new(SourceKind::Manual, 1)));
        batch.push(WriteOp::DeleteStep { chunk_id: 1 });
        batch.push(WriteOp::SetStepFunds {
            chunk_id: 99,
            fund_abbr: None,
        });

        let err = store.commit(batch).await.expect_err("missing row aborts");
        assert!(matches!(err, KbError::NotFound { .. }));
        assert!(store.step(1).await.expect("read").is_some());
        assert_eq!(store.embedding_count().await, 1);
    }

    #[tokio::test]
    async fn injected_failure_hits_the_requested_commit() {
        let store = MemoryStore::new();
        store.fail_commit_after(1).await;
        assert!(store.commit(WriteBatch::new()).await.is_ok());
        assert!(store.commit(WriteBatch::new()).await.is_err());
        assert!(store.commit(WriteBatch::new()).await.is_ok());
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let store = MemoryStore::new();
        store
            .seed_fund(Fund {
                fund_id: "F-001".into(),
                fund_abbr: "RES".into(),
                fund_name_th: Some("Research Grant".into()),
                fund_name_en: None,
                fiscal_year: None,
                source_agency: None,
                start_period: None,
                end_period: None,
                status: FundStatus::Disable,
            })
            .await;
        let hits = store
            .list_funds(&FundQuery {
                search: Some("grant".into()),
                statuses: Vec::new(),
            })
            .await
            .expect("list");
        assert_eq!(hits.len(), 1);
        let hits = store
            .list_funds(&FundQuery {
                search: Some("grant".into()),
                statuses: vec![FundStatus::Enable],
            })
            .await
            .expect("list");
        assert!(hits.is_empty());
        let hits = store
            .list_funds(&FundQuery::from_params(Some("status:disable"), Some("enable")))
            .await
            .expect("list");
        assert!(hits.is_empty());
        let hits = store
            .list_funds(&FundQuery::from_params(Some("status:disable"), Some("disable")))
            .await
            .expect("list");
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn sequences_ignore_foreign_ids() {
        let store = MemoryStore::new();
        store
            .seed_term(Term {
                word_id: "W-004".into(),
                word: None,
                meaning: None,
                word_type: None,
            })
            .await;
        store
            .seed_term(Term {
                word_id: "legacy".into(),
                word: None,
                meaning: None,
                word_type: None,
            })
            .await;
        assert_eq!(store.max_sequence(IdSequence::Term).await.expect("max"), Some(4));
        assert_eq!(store.max_sequence(IdSequence::Fund).await.expect("max"), None);
    }
}
