//! Shared fixtures for the coordinator integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kbadmin::{
    BatchOutcome, Coordinator, EmbeddingIndex, Faq, FaqDraft, Fund, FundQuery, FundStatus,
    IdSequence, ManualStep, MemoryStore, RecordStore, Regenerate, RegenerationRequest, Result,
    Scenario, ScenarioDraft, ScenarioQuery, StepDraft, StepQuery, Term, WriteBatch,
};
use serde_json::{json, Value};

/// Dispatcher that keeps every request for inspection.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<RegenerationRequest>>,
}

impl RecordingDispatcher {
    pub fn requests(&self) -> Vec<RegenerationRequest> {
        self.requests.lock().expect("dispatcher lock").clone()
    }
}

#[async_trait::async_trait]
impl Regenerate for RecordingDispatcher {
    fn dispatch(&self, request: RegenerationRequest) {
        self.requests.lock().expect("dispatcher lock").push(request);
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub coordinator: Coordinator,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let coordinator = Coordinator::new(store.clone(), EmbeddingIndex::default(), dispatcher.clone());
    Harness {
        store,
        dispatcher,
        coordinator,
    }
}

pub fn fund(fund_id: &str, fund_abbr: &str) -> Fund {
    Fund {
        fund_id: fund_id.to_string(),
        fund_abbr: fund_abbr.to_string(),
        fund_name_th: Some(format!("ทุน {fund_abbr}")),
        fund_name_en: None,
        fiscal_year: Some(2568),
        source_agency: None,
        start_period: None,
        end_period: None,
        status: FundStatus::Enable,
    }
}

pub fn step(chunk_id: i32, fund_abbr: Option<&str>) -> ManualStep {
    StepDraft {
        document_title: Some("คู่มือการเบิกจ่าย".to_string()),
        category_main: Some("การเงิน".to_string()),
        category_sub: Some("เบิกจ่าย".to_string()),
        step_number: Some(1),
        topic: Some(format!("ขั้นตอน {chunk_id}")),
        chunk_content: Some("ยื่นแบบฟอร์ม".to_string()),
        fund_abbr: fund_abbr.map(str::to_string),
        ..StepDraft::default()
    }
    .into_step(chunk_id)
}

/// Embedding metadata in the flat shape.
pub fn flat(table: &str, id: &str) -> Value {
    json!({ "source_table": table, "source_id": id, "type": "test" })
}

/// Embedding metadata in the nested legacy shape.
pub fn nested(key: &str, id: Value) -> Value {
    json!({ "Metadata": { key: id } })
}

/// Store whose reads can lag behind its writes, as seen by a caller racing
/// another writer. Everything else goes to the wrapped [`MemoryStore`].
pub struct StaleReads {
    pub inner: Arc<MemoryStore>,
    /// Extra rows returned by `steps_mentioning` that no longer exist.
    pub vanished_steps: Vec<ManualStep>,
    /// Number of `max_sequence` calls that report one less than the truth.
    pub lagging_sequences: AtomicUsize,
}

impl StaleReads {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            vanished_steps: Vec::new(),
            lagging_sequences: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for StaleReads {
    async fn list_funds(&self, query: &FundQuery) -> Result<Vec<Fund>> {
        self.inner.list_funds(query).await
    }

    async fn fund(&self, fund_id: &str) -> Result<Option<Fund>> {
        self.inner.fund(fund_id).await
    }

    async fn max_sequence(&self, sequence: IdSequence) -> Result<Option<u32>> {
        let max = self.inner.max_sequence(sequence).await?;
        let lag = self
            .lagging_sequences
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(if lag {
            max.and_then(|n| n.checked_sub(1)).filter(|n| *n > 0)
        } else {
            max
        })
    }

    async fn list_steps(&self, query: &StepQuery) -> Result<Vec<ManualStep>> {
        self.inner.list_steps(query).await
    }

    async fn step(&self, chunk_id: i32) -> Result<Option<ManualStep>> {
        self.inner.step(chunk_id).await
    }

    async fn steps_mentioning(&self, needle: &str) -> Result<Vec<ManualStep>> {
        let mut steps = self.inner.steps_mentioning(needle).await?;
        steps.extend(self.vanished_steps.iter().cloned());
        steps.sort_by_key(|step| step.chunk_id);
        Ok(steps)
    }

    async fn insert_step(&self, draft: &StepDraft) -> Result<ManualStep> {
        self.inner.insert_step(draft).await
    }

    async fn list_scenarios(&self, query: &ScenarioQuery) -> Result<Vec<Scenario>> {
        self.inner.list_scenarios(query).await
    }

    async fn scenario(&self, id: i32) -> Result<Option<Scenario>> {
        self.inner.scenario(id).await
    }

    async fn insert_scenario(&self, draft: &ScenarioDraft) -> Result<Scenario> {
        self.inner.insert_scenario(draft).await
    }

    async fn list_terms(&self, search: Option<&str>) -> Result<Vec<Term>> {
        self.inner.list_terms(search).await
    }

    async fn term_types(&self) -> Result<Vec<String>> {
        self.inner.term_types().await
    }

    async fn term(&self, word_id: &str) -> Result<Option<Term>> {
        self.inner.term(word_id).await
    }

    async fn list_faqs(&self) -> Result<Vec<Faq>> {
        self.inner.list_faqs().await
    }

    async fn insert_faq(&self, draft: &FaqDraft) -> Result<Faq> {
        self.inner.insert_faq(draft).await
    }

    async fn update_faq(&self, faq: &Faq) -> Result<Option<Faq>> {
        self.inner.update_faq(faq).await
    }

    async fn delete_faq(&self, id: i32) -> Result<u64> {
        self.inner.delete_faq(id).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<BatchOutcome> {
        self.inner.commit(batch).await
    }
}
