//! Postgres-backed [`RecordStore`].

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Row, Transaction};

use super::{contains_pattern, BatchOutcome, RecordStore, WriteBatch, WriteOp};
use crate::embedding::TableName;
use crate::error::{KbError, Result};
use crate::ids::IdSequence;
use crate::model::{
    Faq, FaqDraft, Fund, FundQuery, FundStatus, ManualStep, Scenario, ScenarioDraft,
    ScenarioQuery, StepDraft, StepQuery, Term,
};

const FUND_COLUMNS: &str = "fund_id, fund_abbr, fund_name_th, fund_name_en, fiscal_year, \
     source_agency, start_period, end_period, status";
const STEP_COLUMNS: &str = "chunk_id, document_title, category_main, category_sub, step_number, \
     topic, chunk_content, fund_abbr, section, data_type";
const SCENARIO_COLUMNS: &str = "id, scenario_name, tag, scenario, solution";
const TERM_COLUMNS: &str = "word_id, word, meaning, word_type";
const FAQ_COLUMNS: &str = "id, question, answer";

const SCHEMA_DDL: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS funds (
        fund_id TEXT PRIMARY KEY,
        fund_abbr TEXT NOT NULL,
        fund_name_th TEXT,
        fund_name_en TEXT,
        fiscal_year INTEGER,
        source_agency TEXT,
        start_period DATE,
        end_period DATE,
        status TEXT NOT NULL DEFAULT 'enable'
    )",
    "CREATE TABLE IF NOT EXISTS manual (
        chunk_id SERIAL PRIMARY KEY,
        document_title TEXT,
        category_main TEXT,
        category_sub TEXT,
        step_number INTEGER,
        topic TEXT,
        chunk_content TEXT,
        fund_abbr TEXT,
        section TEXT,
        data_type TEXT
    )",
    "CREATE TABLE IF NOT EXISTS scenario (
        id SERIAL PRIMARY KEY,
        scenario_name TEXT,
        tag TEXT,
        scenario TEXT,
        solution TEXT
    )",
    "CREATE TABLE IF NOT EXISTS term (
        word_id TEXT PRIMARY KEY,
        word TEXT,
        meaning TEXT,
        word_type TEXT
    )",
    "CREATE TABLE IF NOT EXISTS faq (
        id SERIAL PRIMARY KEY,
        question TEXT,
        answer TEXT
    )",
];

/// Store over a single Postgres connection.
///
/// The connection is serialized behind a mutex; each call holds it for the
/// duration of one statement or one transaction.
pub struct PgStore {
    client: Mutex<Option<Client>>,
    connection: Mutex<Option<JoinHandle<()>>>,
    embedding_table: TableName,
}

impl PgStore {
    /// Opens the connection and spawns its driver task.
    pub async fn connect(config: &Config, embedding_table: TableName) -> anyhow::Result<Self> {
        let (client, connection) = config
            .connect(NoTls)
            .await
            .context("failed to connect to Postgres")?;
        let handle = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self {
            client: Mutex::new(Some(client)),
            connection: Mutex::new(Some(handle)),
            embedding_table,
        })
    }

    /// Embedding table targeted by invalidations.
    pub fn embedding_table(&self) -> &TableName {
        &self.embedding_table
    }

    /// Drops the client and waits for the connection task to finish.
    ///
    /// Calls made after `close` fail with an internal error.
    pub async fn close(&self) {
        self.client.lock().await.take();
        if let Some(handle) = self.connection.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "postgres connection task ended abnormally");
            }
        }
    }

    /// Creates the administrative tables when missing.
    pub async fn prepare_schema(&self) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        let client = connected(&guard)?;
        for ddl in SCHEMA_DDL {
            client
                .batch_execute(ddl)
                .await
                .context("failed to create administrative table")?;
        }
        Ok(())
    }

    /// Creates an expression index over the flat embedding address.
    pub async fn ensure_embedding_address_index(&self) -> anyhow::Result<()> {
        let guard = self.client.lock().await;
        let client = connected(&guard)?;
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} \
             ((metadata->>'source_table'), (metadata->>'source_id'))",
            self.embedding_table.address_index_name(),
            self.embedding_table.qualified()
        );
        client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("failed to index {}", self.embedding_table.qualified()))?;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let guard = self.client.lock().await;
        let client = connected(&guard)?;
        Ok(client.query(sql, params).await?)
    }

    async fn query_opt(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Row>> {
        let guard = self.client.lock().await;
        let client = connected(&guard)?;
        Ok(client.query_opt(sql, params).await?)
    }

    async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        let guard = self.client.lock().await;
        let client = connected(&guard)?;
        Ok(client.query_one(sql, params).await?)
    }
}

fn connected<'a>(guard: &'a MutexGuard<'_, Option<Client>>) -> anyhow::Result<&'a Client> {
    Option::as_ref(guard).ok_or_else(|| anyhow!("postgres store is closed"))
}

fn text_params(values: &[String]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|value| value as &(dyn ToSql + Sync)).collect()
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn list_funds(&self, query: &FundQuery) -> Result<Vec<Fund>> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(search) = &query.search {
            values.push(contains_pattern(search));
            let n = values.len();
            conditions.push(format!(
                "(fund_abbr ILIKE ${n} OR fund_name_th ILIKE ${n} OR source_agency ILIKE ${n})"
            ));
        }
        for status in &query.statuses {
            values.push(status.as_str().to_string());
            conditions.push(format!("status = ${}", values.len()));
        }
        let sql = format!(
            "SELECT {FUND_COLUMNS} FROM funds{} ORDER BY fund_id",
            where_clause(&conditions)
        );
        let rows = self.query(&sql, &text_params(&values)).await?;
        rows.iter().map(fund_from_row).collect()
    }

    async fn fund(&self, fund_id: &str) -> Result<Option<Fund>> {
        let sql = format!("SELECT {FUND_COLUMNS} FROM funds WHERE fund_id = $1");
        self.query_opt(&sql, &[&fund_id])
            .await?
            .as_ref()
            .map(fund_from_row)
            .transpose()
    }

    async fn max_sequence(&self, sequence: IdSequence) -> Result<Option<u32>> {
        let column = sequence.column();
        // digits start after `<prefix>-`; SUBSTRING positions are 1-based
        let offset = sequence.prefix().len() + 2;
        let sql = format!(
            "SELECT MAX(CAST(SUBSTRING({column} FROM {offset}) AS BIGINT)) FROM {} WHERE {column} ~ $1",
            sequence.table()
        );
        let pattern = format!("^{}-[0-9]+$", sequence.prefix());
        let row = self.query_one(&sql, &[&pattern]).await?;
        let max: Option<i64> = row.try_get(0)?;
        max.map(|value| {
            u32::try_from(value)
                .map_err(|_| KbError::Internal(anyhow!("{} sequence {value} overflows", sequence.table())))
        })
        .transpose()
    }

    async fn list_steps(&self, query: &StepQuery) -> Result<Vec<ManualStep>> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(search) = &query.search {
            values.push(contains_pattern(search));
            let n = values.len();
            let any = [
                "document_title",
                "category_main",
                "category_sub",
                "topic",
                "section",
                "chunk_content",
                "fund_abbr",
                "data_type",
            ]
            .iter()
            .map(|column| format!("{column} ILIKE ${n}"))
            .collect::<Vec<_>>()
            .join(" OR ");
            conditions.push(format!("({any})"));
        }
        if let Some(title) = &query.document_title {
            values.push(title.clone());
            conditions.push(format!("document_title = ${}", values.len()));
        }
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM manual{} ORDER BY chunk_id",
            where_clause(&conditions)
        );
        let rows = self.query(&sql, &text_params(&values)).await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn step(&self, chunk_id: i32) -> Result<Option<ManualStep>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM manual WHERE chunk_id = $1");
        self.query_opt(&sql, &[&chunk_id])
            .await?
            .as_ref()
            .map(step_from_row)
            .transpose()
    }

    async fn steps_mentioning(&self, needle: &str) -> Result<Vec<ManualStep>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM manual WHERE fund_abbr LIKE $1 ORDER BY chunk_id"
        );
        let pattern = contains_pattern(needle);
        let rows = self.query(&sql, &[&pattern]).await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn insert_step(&self, draft: &StepDraft) -> Result<ManualStep> {
        let sql = format!(
            "INSERT INTO manual (document_title, category_main, category_sub, step_number, \
             topic, chunk_content, fund_abbr, section, data_type) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {STEP_COLUMNS}"
        );
        let row = self
            .query_one(
                &sql,
                &[
                    &draft.document_title,
                    &draft.category_main,
                    &draft.category_sub,
                    &draft.step_number,
                    &draft.topic,
                    &draft.chunk_content,
                    &draft.fund_abbr,
                    &draft.section,
                    &draft.data_type,
                ],
            )
            .await?;
        step_from_row(&row)
    }

    async fn list_scenarios(&self, query: &ScenarioQuery) -> Result<Vec<Scenario>> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(search) = &query.search {
            values.push(contains_pattern(search));
            let n = values.len();
            conditions.push(format!("(scenario_name ILIKE ${n} OR scenario ILIKE ${n})"));
        }
        if let Some(tag) = &query.tag {
            values.push(tag.clone());
            conditions.push(format!("tag = ${}", values.len()));
        }
        let sql = format!(
            "SELECT {SCENARIO_COLUMNS} FROM scenario{} ORDER BY id",
            where_clause(&conditions)
        );
        let rows = self.query(&sql, &text_params(&values)).await?;
        rows.iter().map(scenario_from_row).collect()
    }

    async fn scenario(&self, id: i32) -> Result<Option<Scenario>> {
        let sql = format!("SELECT {SCENARIO_COLUMNS} FROM scenario WHERE id = $1");
        self.query_opt(&sql, &[&id])
            .await?
            .as_ref()
            .map(scenario_from_row)
            .transpose()
    }

    async fn insert_scenario(&self, draft: &ScenarioDraft) -> Result<Scenario> {
        let sql = format!(
            "INSERT INTO scenario (scenario_name, tag, scenario, solution) \
             VALUES ($1, $2, $3, $4) RETURNING {SCENARIO_COLUMNS}"
        );
        let row = self
            .query_one(
                &sql,
                &[&draft.scenario_name, &draft.tag, &draft.scenario, &draft.solution],
            )
            .await?;
        scenario_from_row(&row)
    }

    async fn list_terms(&self, search: Option<&str>) -> Result<Vec<Term>> {
        let rows = match search {
            Some(search) => {
                let sql =
                    format!("SELECT {TERM_COLUMNS} FROM term WHERE word ILIKE $1 ORDER BY word_id");
                let pattern = contains_pattern(search);
                self.query(&sql, &[&pattern]).await?
            }
            None => {
                let sql = format!("SELECT {TERM_COLUMNS} FROM term ORDER BY word_id");
                self.query(&sql, &[]).await?
            }
        };
        rows.iter().map(term_from_row).collect()
    }

    async fn term_types(&self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT DISTINCT word_type FROM term \
                 WHERE word_type IS NOT NULL AND word_type <> '' ORDER BY word_type",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(KbError::from))
            .collect()
    }

    async fn term(&self, word_id: &str) -> Result<Option<Term>> {
        let sql = format!("SELECT {TERM_COLUMNS} FROM term WHERE word_id = $1");
        self.query_opt(&sql, &[&word_id])
            .await?
            .as_ref()
            .map(term_from_row)
            .transpose()
    }

    async fn list_faqs(&self) -> Result<Vec<Faq>> {
        let sql = format!("SELECT {FAQ_COLUMNS} FROM faq ORDER BY id");
        let rows = self.query(&sql, &[]).await?;
        rows.iter().map(faq_from_row).collect()
    }

    async fn insert_faq(&self, draft: &FaqDraft) -> Result<Faq> {
        let sql = format!(
            "INSERT INTO faq (question, answer) VALUES ($1, $2) RETURNING {FAQ_COLUMNS}"
        );
        let row = self.query_one(&sql, &[&draft.question, &draft.answer]).await?;
        faq_from_row(&row)
    }

    async fn update_faq(&self, faq: &Faq) -> Result<Option<Faq>> {
        let sql = format!(
            "UPDATE faq SET question = $2, answer = $3 WHERE id = $1 RETURNING {FAQ_COLUMNS}"
        );
        self.query_opt(&sql, &[&faq.id, &faq.question, &faq.answer])
            .await?
            .as_ref()
            .map(faq_from_row)
            .transpose()
    }

    async fn delete_faq(&self, id: i32) -> Result<u64> {
        let guard = self.client.lock().await;
        let client = connected(&guard)?;
        Ok(client.execute("DELETE FROM faq WHERE id = $1", &[&id]).await?)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<BatchOutcome> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| anyhow!("postgres store is closed"))?;
        let transaction = client.transaction().await?;
        let mut rows = Vec::with_capacity(batch.len());
        for op in batch {
            // an early return drops the transaction, which rolls it back
            rows.push(apply(&transaction, &self.embedding_table, op).await?);
        }
        transaction.commit().await?;
        Ok(BatchOutcome::new(rows))
    }
}

async fn apply(tx: &Transaction<'_>, embedding_table: &TableName, op: WriteOp) -> Result<u64> {
    match op {
        WriteOp::InsertFund(fund) => {
            let status = fund.status.as_str();
            tx.execute(
                "INSERT INTO funds (fund_id, fund_abbr, fund_name_th, fund_name_en, fiscal_year, \
                 source_agency, start_period, end_period, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &fund.fund_id,
                    &fund.fund_abbr,
                    &fund.fund_name_th,
                    &fund.fund_name_en,
                    &fund.fiscal_year,
                    &fund.source_agency,
                    &fund.start_period,
                    &fund.end_period,
                    &status,
                ],
            )
            .await
            .map_err(|err| insert_error(err, "fund", &fund.fund_id))
        }
        WriteOp::UpdateFund(fund) => {
            let status = fund.status.as_str();
            let rows = tx
                .execute(
                    "UPDATE funds SET fund_abbr = $2, fund_name_th = $3, fund_name_en = $4, \
                     fiscal_year = $5, source_agency = $6, start_period = $7, end_period = $8, \
                     status = $9 WHERE fund_id = $1",
                    &[
                        &fund.fund_id,
                        &fund.fund_abbr,
                        &fund.fund_name_th,
                        &fund.fund_name_en,
                        &fund.fiscal_year,
                        &fund.source_agency,
                        &fund.start_period,
                        &fund.end_period,
                        &status,
                    ],
                )
                .await?;
            require_row(rows, "fund", &fund.fund_id)
        }
        WriteOp::DeleteFund { fund_id } => Ok(tx
            .execute("DELETE FROM funds WHERE fund_id = $1", &[&fund_id])
            .await?),
        WriteOp::UpdateStep(step) => {
            let rows = tx
                .execute(
                    "UPDATE manual SET document_title = $2, category_main = $3, \
                     category_sub = $4, step_number = $5, topic = $6, chunk_content = $7, \
                     fund_abbr = $8, section = $9, data_type = $10 WHERE chunk_id = $1",
                    &[
                        &step.chunk_id,
                        &step.document_title,
                        &step.category_main,
                        &step.category_sub,
                        &step.step_number,
                        &step.topic,
                        &step.chunk_content,
                        &step.fund_abbr,
                        &step.section,
                        &step.data_type,
                    ],
                )
                .await?;
            require_row(rows, "manual step", step.chunk_id)
        }
        WriteOp::SetStepFunds {
            chunk_id,
            fund_abbr,
        } => {
            let rows = tx
                .execute(
                    "UPDATE manual SET fund_abbr = $2 WHERE chunk_id = $1",
                    &[&chunk_id, &fund_abbr],
                )
                .await?;
            require_row(rows, "manual step", chunk_id)
        }
        WriteOp::DeleteStep { chunk_id } => Ok(tx
            .execute("DELETE FROM manual WHERE chunk_id = $1", &[&chunk_id])
            .await?),
        WriteOp::UpdateScenario(scenario) => {
            let rows = tx
                .execute(
                    "UPDATE scenario SET scenario_name = $2, tag = $3, scenario = $4, \
                     solution = $5 WHERE id = $1",
                    &[
                        &scenario.id,
                        &scenario.scenario_name,
                        &scenario.tag,
                        &scenario.scenario,
                        &scenario.solution,
                    ],
                )
                .await?;
            require_row(rows, "scenario", scenario.id)
        }
        WriteOp::DeleteScenario { id } => Ok(tx
            .execute("DELETE FROM scenario WHERE id = $1", &[&id])
            .await?),
        WriteOp::InsertTerm(term) => tx
            .execute(
                "INSERT INTO term (word_id, word, meaning, word_type) VALUES ($1, $2, $3, $4)",
                &[&term.word_id, &term.word, &term.meaning, &term.word_type],
            )
            .await
            .map_err(|err| insert_error(err, "term", &term.word_id)),
        WriteOp::UpdateTerm(term) => {
            let rows = tx
                .execute(
                    "UPDATE term SET word = $2, meaning = $3, word_type = $4 WHERE word_id = $1",
                    &[&term.word_id, &term.word, &term.meaning, &term.word_type],
                )
                .await?;
            require_row(rows, "term", &term.word_id)
        }
        WriteOp::DeleteTerm { word_id } => Ok(tx
            .execute("DELETE FROM term WHERE word_id = $1", &[&word_id])
            .await?),
        WriteOp::InvalidateEmbeddings(address) => {
            let (predicate, values) = address.sql_predicate(1);
            let sql = format!(
                "DELETE FROM {} WHERE {predicate}",
                embedding_table.qualified()
            );
            let rows = tx
                .execute(sql.as_str(), &text_params(&values))
                .await
                .with_context(|| format!("failed to invalidate embeddings of {}", address.source()))?;
            Ok(rows)
        }
    }
}

fn require_row(rows: u64, entity: &'static str, id: impl ToString) -> Result<u64> {
    if rows == 0 {
        Err(KbError::not_found(entity, id))
    } else {
        Ok(rows)
    }
}

fn insert_error(err: tokio_postgres::Error, entity: &'static str, id: &str) -> KbError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        KbError::DuplicateKey {
            entity,
            id: id.to_string(),
        }
    } else {
        KbError::from(err)
    }
}

fn fund_from_row(row: &Row) -> Result<Fund> {
    let fund_abbr: Option<String> = row.try_get("fund_abbr")?;
    let status: Option<String> = row.try_get("status")?;
    Ok(Fund {
        fund_id: row.try_get("fund_id")?,
        fund_abbr: fund_abbr.unwrap_or_default(),
        fund_name_th: row.try_get("fund_name_th")?,
        fund_name_en: row.try_get("fund_name_en")?,
        fiscal_year: row.try_get("fiscal_year")?,
        source_agency: row.try_get("source_agency")?,
        start_period: row.try_get("start_period")?,
        end_period: row.try_get("end_period")?,
        status: FundStatus::from_column(status.as_deref()),
    })
}

fn step_from_row(row: &Row) -> Result<ManualStep> {
    Ok(ManualStep {
        chunk_id: row.try_get("chunk_id")?,
        document_title: row.try_get("document_title")?,
        category_main: row.try_get("category_main")?,
        category_sub: row.try_get("category_sub")?,
        step_number: row.try_get("step_number")?,
        topic: row.try_get("topic")?,
        chunk_content: row.try_get("chunk_content")?,
        fund_abbr: row.try_get("fund_abbr")?,
        section: row.try_get("section")?,
        data_type: row.try_get("data_type")?,
    })
}

fn scenario_from_row(row: &Row) -> Result<Scenario> {
    Ok(Scenario {
        id: row.try_get("id")?,
        scenario_name: row.try_get("scenario_name")?,
        tag: row.try_get("tag")?,
        scenario: row.try_get("scenario")?,
        solution: row.try_get("solution")?,
    })
}

fn term_from_row(row: &Row) -> Result<Term> {
    Ok(Term {
        word_id: row.try_get("word_id")?,
        word: row.try_get("word")?,
        meaning: row.try_get("meaning")?,
        word_type: row.try_get("word_type")?,
    })
}

fn faq_from_row(row: &Row) -> Result<Faq> {
    Ok(Faq {
        id: row.try_get("id")?,
        question: row.try_get("question")?,
        answer: row.try_get("answer")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_joins_conditions() {
        assert_eq!(where_clause(&[]), "");
        assert_eq!(
            where_clause(&["a = $1".to_string(), "b = $2".to_string()]),
            " WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn schema_covers_every_table() {
        for table in ["funds", "manual", "scenario", "term", "faq"] {
            let marker = format!("CREATE TABLE IF NOT EXISTS {table} (");
            assert!(SCHEMA_DDL.iter().any(|ddl| ddl.contains(&marker)), "{table}");
        }
    }
}
