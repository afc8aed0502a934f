//! Orchestrates record mutations, embedding invalidation and regeneration.
//!
//! Every content-affecting write goes through a [`Coordinator`]. A row change
//! and the invalidation of its embeddings are committed as one [`WriteBatch`];
//! regeneration is dispatched only after that batch has committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::EmbeddingIndex;
use crate::error::{DependentConflict, DependentStep, KbError, Result};
use crate::ids::IdSequence;
use crate::model::{
    present, Faq, FaqDraft, Fund, FundDraft, FundQuery, ManualStep, Scenario, ScenarioDraft,
    ScenarioQuery, SourceKind, SourceRef, StepDraft, StepQuery, Term, TermDraft, TermListing,
};
use crate::regen::{render, Regenerate, RegenerationRequest};
use crate::store::{RecordStore, WriteBatch, WriteOp};
use crate::tags::TagSet;

/// Default number of attempts when a generated id collides.
pub const DEFAULT_ID_ATTEMPTS: usize = 3;

/// Result of a committed fund deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FundDeletion {
    /// Deleted fund.
    pub fund_id: String,
    /// Steps removed because the fund was their only reference.
    pub deleted_steps: Vec<i32>,
    /// Steps that kept other references and were rewritten.
    pub updated_steps: Vec<i32>,
}

/// Entry point for every mutation of the knowledge base.
pub struct Coordinator {
    store: Arc<dyn RecordStore>,
    index: EmbeddingIndex,
    dispatcher: Arc<dyn Regenerate>,
    id_attempts: usize,
}

impl Coordinator {
    /// Wires a coordinator over an open store.
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: EmbeddingIndex,
        dispatcher: Arc<dyn Regenerate>,
    ) -> Self {
        Self {
            store,
            index,
            dispatcher,
            id_attempts: DEFAULT_ID_ATTEMPTS,
        }
    }

    /// Overrides how many times a colliding generated id is retried.
    pub fn with_id_attempts(mut self, attempts: usize) -> Self {
        self.id_attempts = attempts.max(1);
        self
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Embedding index configuration.
    pub fn index(&self) -> EmbeddingIndex {
        self.index
    }

    /// Dispatcher receiving regeneration requests.
    pub fn dispatcher(&self) -> &Arc<dyn Regenerate> {
        &self.dispatcher
    }

    /// Deletes every embedding row of `source` on its own.
    pub async fn invalidate(&self, source: &SourceRef) -> Result<u64> {
        self.index.invalidate(self.store.as_ref(), source).await
    }

    /// Funds matching `query`.
    pub async fn list_funds(&self, query: &FundQuery) -> Result<Vec<Fund>> {
        self.store.list_funds(query).await
    }

    /// Creates a fund under a freshly generated `F-NNN` id.
    pub async fn create_fund(&self, draft: FundDraft) -> Result<Fund> {
        let mut draft = draft;
        draft.fund_abbr = validate_fund(&draft.fund_abbr, &draft.fund_name_th)?;
        let fund = self
            .insert_generated(IdSequence::Fund, |fund_id| {
                let fund = draft.clone().into_fund(fund_id);
                let source = SourceRef::new(SourceKind::Fund, &fund.fund_id);
                (WriteOp::InsertFund(fund.clone()), source, fund)
            })
            .await?;
        tracing::info!(fund_id = %fund.fund_id, fund_abbr = %fund.fund_abbr, "fund created");
        self.regenerate(render::for_fund(&fund));
        Ok(fund)
    }

    /// Replaces a fund and refreshes it and every step referencing its old or
    /// new abbreviation.
    pub async fn update_fund(&self, fund: Fund) -> Result<Fund> {
        let mut fund = fund;
        fund.fund_abbr = validate_fund(&fund.fund_abbr, &fund.fund_name_th)?;
        let previous = self
            .store
            .fund(&fund.fund_id)
            .await?
            .ok_or_else(|| KbError::not_found("fund", &fund.fund_id))?;

        let mut affected = BTreeMap::new();
        for abbr in [&previous.fund_abbr, &fund.fund_abbr] {
            for step in self.dependents(abbr).await? {
                affected.insert(step.chunk_id, step);
            }
        }

        let mut batch = WriteBatch::new();
        batch.push(
            self.index
                .invalidation(&SourceRef::new(SourceKind::Fund, &fund.fund_id)),
        );
        batch.push(WriteOp::UpdateFund(fund.clone()));
        for chunk_id in affected.keys() {
            batch.push(
                self.index
                    .invalidation(&SourceRef::new(SourceKind::Manual, chunk_id)),
            );
        }
        self.store.commit(batch).await?;
        tracing::info!(
            fund_id = %fund.fund_id,
            fund_abbr = %fund.fund_abbr,
            refreshed_steps = affected.len(),
            "fund updated"
        );

        self.regenerate(render::for_fund(&fund));
        for step in affected.values() {
            self.regenerate(render::for_step(step));
        }
        Ok(fund)
    }

    /// Live dependents of a fund, as a conflict preview.
    ///
    /// The preview is advisory; [`Coordinator::delete_fund`] always recomputes it.
    pub async fn fund_dependents(&self, fund_id: &str) -> Result<DependentConflict> {
        let fund = self
            .store
            .fund(fund_id)
            .await?
            .ok_or_else(|| KbError::not_found("fund", fund_id))?;
        let steps = self.dependents(&fund.fund_abbr).await?;
        Ok(DependentConflict {
            steps: steps.iter().map(DependentStep::from).collect(),
            fund_abbr: fund.fund_abbr,
        })
    }

    /// Deletes a fund, cascading over the manual steps that reference it.
    ///
    /// Without `force`, live dependents turn the call into a preview: it fails
    /// with [`KbError::Conflict`] and writes nothing. With `force`, each
    /// dependent loses the fund's token in its own transaction (or is deleted
    /// when no token remains), then the fund itself is removed. A failure part
    /// way through leaves earlier steps committed; calling again resumes from
    /// the current state.
    pub async fn delete_fund(&self, fund_id: &str, force: bool) -> Result<FundDeletion> {
        let fund = self
            .store
            .fund(fund_id)
            .await?
            .ok_or_else(|| KbError::not_found("fund", fund_id))?;
        let dependents = self.dependents(&fund.fund_abbr).await?;
        if !dependents.is_empty() && !force {
            tracing::info!(
                fund_id,
                fund_abbr = %fund.fund_abbr,
                dependents = dependents.len(),
                "fund deletion blocked by dependents"
            );
            return Err(KbError::Conflict(DependentConflict {
                steps: dependents.iter().map(DependentStep::from).collect(),
                fund_abbr: fund.fund_abbr,
            }));
        }

        let mut outcome = FundDeletion {
            fund_id: fund.fund_id.clone(),
            ..FundDeletion::default()
        };
        for step in dependents {
            let remaining = step.fund_tags().without(&fund.fund_abbr);
            let source = SourceRef::new(SourceKind::Manual, step.chunk_id);
            let mut batch = WriteBatch::new();
            batch.push(self.index.invalidation(&source));
            if remaining.is_empty() {
                let slot = batch.push(WriteOp::DeleteStep {
                    chunk_id: step.chunk_id,
                });
                if self.store.commit(batch).await?.rows(slot) == 0 {
                    tracing::debug!(chunk_id = step.chunk_id, "step vanished during cascade");
                    continue;
                }
                tracing::debug!(chunk_id = step.chunk_id, "deleted step left without funds");
                outcome.deleted_steps.push(step.chunk_id);
                continue;
            }

            let fund_abbr = remaining.to_column();
            batch.push(WriteOp::SetStepFunds {
                chunk_id: step.chunk_id,
                fund_abbr: fund_abbr.clone(),
            });
            match self.store.commit(batch).await {
                Ok(_) => {}
                Err(KbError::NotFound { .. }) => {
                    tracing::debug!(chunk_id = step.chunk_id, "step vanished during cascade");
                    continue;
                }
                Err(err) => return Err(err),
            }
            tracing::debug!(chunk_id = step.chunk_id, remaining = %remaining, "removed fund from step");
            outcome.updated_steps.push(step.chunk_id);
            let updated = ManualStep { fund_abbr, ..step };
            self.regenerate(render::for_step(&updated));
        }

        let mut batch = WriteBatch::new();
        batch.push(
            self.index
                .invalidation(&SourceRef::new(SourceKind::Fund, &fund.fund_id)),
        );
        let slot = batch.push(WriteOp::DeleteFund {
            fund_id: fund.fund_id.clone(),
        });
        if self.store.commit(batch).await?.rows(slot) == 0 {
            return Err(KbError::not_found("fund", &fund.fund_id));
        }
        tracing::info!(
            fund_id = %outcome.fund_id,
            deleted_steps = outcome.deleted_steps.len(),
            updated_steps = outcome.updated_steps.len(),
            "fund deleted"
        );
        Ok(outcome)
    }

    /// Steps whose reference list carries `fund_abbr` as a whole token.
    pub async fn dependents(&self, fund_abbr: &str) -> Result<Vec<ManualStep>> {
        if fund_abbr.trim().is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self.store.steps_mentioning(fund_abbr).await?;
        Ok(candidates
            .into_iter()
            .filter(|step| step.fund_tags().contains(fund_abbr))
            .collect())
    }

    /// Steps matching `query`.
    pub async fn list_steps(&self, query: &StepQuery) -> Result<Vec<ManualStep>> {
        self.store.list_steps(query).await
    }

    /// Creates a manual step.
    pub async fn create_step(&self, draft: StepDraft) -> Result<ManualStep> {
        let mut draft = draft;
        require(&draft.required_fields())?;
        draft.fund_abbr = TagSet::parse(draft.fund_abbr.as_deref()).to_column();
        let step = self.store.insert_step(&draft).await?;
        tracing::info!(chunk_id = step.chunk_id, "manual step created");
        self.regenerate(render::for_step(&step));
        Ok(step)
    }

    /// Replaces a manual step.
    pub async fn update_step(&self, step: ManualStep) -> Result<ManualStep> {
        let mut step = step;
        require(&step.required_fields())?;
        step.fund_abbr = step.fund_tags().to_column();
        let source = SourceRef::new(SourceKind::Manual, step.chunk_id);
        self.replace(&source, WriteOp::UpdateStep(step.clone())).await?;
        tracing::info!(chunk_id = step.chunk_id, "manual step updated");
        self.regenerate(render::for_step(&step));
        Ok(step)
    }

    /// Deletes a manual step.
    pub async fn delete_step(&self, chunk_id: i32) -> Result<()> {
        let source = SourceRef::new(SourceKind::Manual, chunk_id);
        self.remove(&source, WriteOp::DeleteStep { chunk_id }, "manual step")
            .await
    }

    /// Scenarios matching `query`.
    pub async fn list_scenarios(&self, query: &ScenarioQuery) -> Result<Vec<Scenario>> {
        self.store.list_scenarios(query).await
    }

    /// Creates a scenario.
    pub async fn create_scenario(&self, draft: ScenarioDraft) -> Result<Scenario> {
        require(&[
            ("scenario_name", &draft.scenario_name),
            ("scenario", &draft.scenario),
        ])?;
        let scenario = self.store.insert_scenario(&draft).await?;
        tracing::info!(id = scenario.id, "scenario created");
        self.regenerate(render::for_scenario(&scenario));
        Ok(scenario)
    }

    /// Replaces a scenario.
    pub async fn update_scenario(&self, scenario: Scenario) -> Result<Scenario> {
        require(&[
            ("scenario_name", &scenario.scenario_name),
            ("scenario", &scenario.scenario),
        ])?;
        let source = SourceRef::new(SourceKind::Scenario, scenario.id);
        self.replace(&source, WriteOp::UpdateScenario(scenario.clone()))
            .await?;
        tracing::info!(id = scenario.id, "scenario updated");
        self.regenerate(render::for_scenario(&scenario));
        Ok(scenario)
    }

    /// Deletes a scenario.
    pub async fn delete_scenario(&self, id: i32) -> Result<()> {
        let source = SourceRef::new(SourceKind::Scenario, id);
        self.remove(&source, WriteOp::DeleteScenario { id }, "scenario")
            .await
    }

    /// Terms whose word matches `search`, plus every word type in use.
    pub async fn list_terms(&self, search: Option<&str>) -> Result<TermListing> {
        let search = search.map(str::trim).filter(|text| !text.is_empty());
        Ok(TermListing {
            terms: self.store.list_terms(search).await?,
            types: self.store.term_types().await?,
        })
    }

    /// Creates a term under a freshly generated `W-NNN` id.
    pub async fn create_term(&self, draft: TermDraft) -> Result<Term> {
        require(&[
            ("word", &draft.word),
            ("meaning", &draft.meaning),
            ("word_type", &draft.word_type),
        ])?;
        let term = self
            .insert_generated(IdSequence::Term, |word_id| {
                let term = draft.clone().into_term(word_id);
                let source = SourceRef::new(SourceKind::Term, &term.word_id);
                (WriteOp::InsertTerm(term.clone()), source, term)
            })
            .await?;
        tracing::info!(word_id = %term.word_id, "term created");
        self.regenerate(render::for_term(&term));
        Ok(term)
    }

    /// Replaces a term.
    pub async fn update_term(&self, term: Term) -> Result<Term> {
        require(&[
            ("word", &term.word),
            ("meaning", &term.meaning),
            ("word_type", &term.word_type),
        ])?;
        let source = SourceRef::new(SourceKind::Term, &term.word_id);
        self.replace(&source, WriteOp::UpdateTerm(term.clone())).await?;
        tracing::info!(word_id = %term.word_id, "term updated");
        self.regenerate(render::for_term(&term));
        Ok(term)
    }

    /// Deletes a term.
    pub async fn delete_term(&self, word_id: &str) -> Result<()> {
        let source = SourceRef::new(SourceKind::Term, word_id);
        let op = WriteOp::DeleteTerm {
            word_id: word_id.to_string(),
        };
        self.remove(&source, op, "term").await
    }

    /// Every FAQ.
    pub async fn list_faqs(&self) -> Result<Vec<Faq>> {
        self.store.list_faqs().await
    }

    /// Creates a FAQ.
    pub async fn create_faq(&self, draft: FaqDraft) -> Result<Faq> {
        self.store.insert_faq(&draft).await
    }

    /// Replaces a FAQ.
    pub async fn update_faq(&self, faq: Faq) -> Result<Faq> {
        self.store
            .update_faq(&faq)
            .await?
            .ok_or_else(|| KbError::not_found("faq", faq.id))
    }

    /// Deletes a FAQ.
    pub async fn delete_faq(&self, id: i32) -> Result<()> {
        match self.store.delete_faq(id).await? {
            0 => Err(KbError::not_found("faq", id)),
            _ => Ok(()),
        }
    }

    /// Commits `[invalidate(source), update]`; a missing row aborts both.
    async fn replace(&self, source: &SourceRef, update: WriteOp) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.push(self.index.invalidation(source));
        batch.push(update);
        self.store.commit(batch).await?;
        Ok(())
    }

    /// Commits `[invalidate(source), delete]` and reports a missing row after
    /// the stale embeddings are gone.
    async fn remove(&self, source: &SourceRef, delete: WriteOp, entity: &'static str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.push(self.index.invalidation(source));
        let slot = batch.push(delete);
        let outcome = self.store.commit(batch).await?;
        if outcome.rows(slot) == 0 {
            return Err(KbError::not_found(entity, source.id()));
        }
        tracing::info!(source = %source, "record deleted");
        Ok(())
    }

    /// Inserts a row whose id comes from `sequence`, retrying on collisions.
    ///
    /// `build` turns a candidate id into the insert op, the embedding address
    /// under that id and the value to return. Embeddings left behind under a
    /// reused id are cleared in the same batch.
    async fn insert_generated<T, F>(&self, sequence: IdSequence, mut build: F) -> Result<T>
    where
        F: FnMut(String) -> (WriteOp, SourceRef, T),
    {
        let mut attempt = 1;
        loop {
            let max = self.store.max_sequence(sequence).await?;
            let (insert, source, value) = build(sequence.next_after(max));
            let mut batch = WriteBatch::new();
            batch.push(self.index.invalidation(&source));
            batch.push(insert);
            match self.store.commit(batch).await {
                Ok(_) => return Ok(value),
                Err(err) if err.is_duplicate_key() && attempt < self.id_attempts => {
                    tracing::warn!(source = %source, attempt, "generated id collided; retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn regenerate(&self, request: RegenerationRequest) {
        self.dispatcher.dispatch(request);
    }
}

fn validate_fund(fund_abbr: &str, fund_name_th: &Option<String>) -> Result<String> {
    let tokens = TagSet::parse(Some(fund_abbr));
    if tokens.len() != 1 {
        return Err(KbError::validation(
            "fund_abbr must be a single token without spaces or commas",
        ));
    }
    require(&[("fund_name_th", fund_name_th)])?;
    Ok(tokens.serialize())
}

fn require(fields: &[(&'static str, &Option<String>)]) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| present(value).is_none())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(KbError::validation(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )))
    }
}
