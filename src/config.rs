//! Command-line and environment configuration shared by the binaries.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use tokio_postgres::Config as PgConfig;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::coordinator::DEFAULT_ID_ATTEMPTS;
use crate::embedding::{EmbeddingIndex, TableName};
use crate::regen::{DisabledDispatcher, Envelope, Regenerate, WebhookDispatcher};

/// Postgres connection and embedding table location.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection string (postgres://...); overrides the DB_* settings
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Postgres host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Postgres port
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Postgres user
    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Postgres password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    /// Postgres database name
    #[arg(long, env = "DB_NAME", default_value = "postgres")]
    pub db_name: String,

    /// Schema holding the embedding table
    #[arg(long, env = "KBADMIN_EMBEDDING_SCHEMA", default_value = "public")]
    pub embedding_schema: String,

    /// Embedding table written by the regeneration pipeline
    #[arg(long, env = "KBADMIN_EMBEDDING_TABLE", default_value = "embedding")]
    pub embedding_table: String,
}

impl DatabaseArgs {
    /// Connection settings, from the URL when given.
    pub fn pg_config(&self) -> Result<PgConfig> {
        if let Some(url) = &self.database_url {
            return PgConfig::from_str(url).context("invalid DATABASE_URL");
        }
        let mut config = PgConfig::new();
        config
            .host(&self.db_host)
            .port(self.db_port)
            .user(&self.db_user)
            .dbname(&self.db_name);
        if let Some(password) = &self.db_password {
            config.password(password);
        }
        Ok(config)
    }

    /// Quoted embedding table reference.
    pub fn embedding_table(&self) -> Result<TableName> {
        TableName::new(&self.embedding_schema, &self.embedding_table)
    }
}

/// Regeneration webhook settings.
#[derive(Args, Debug, Clone)]
pub struct WebhookArgs {
    /// Endpoint receiving regeneration requests; dispatch is disabled when unset
    #[arg(long, env = "KBADMIN_WEBHOOK_URL")]
    pub webhook_url: Option<Url>,

    /// Seconds before a webhook request is abandoned
    #[arg(long, env = "KBADMIN_WEBHOOK_TIMEOUT_SECS", default_value_t = 10)]
    pub webhook_timeout_secs: u64,

    /// Maximum concurrent webhook requests
    #[arg(long, env = "KBADMIN_WEBHOOK_MAX_IN_FLIGHT", default_value_t = 16)]
    pub webhook_max_in_flight: usize,

    /// Request body layout
    #[arg(long, env = "KBADMIN_WEBHOOK_ENVELOPE", value_enum, default_value = "bare")]
    pub webhook_envelope: Envelope,
}

impl WebhookArgs {
    /// Builds the configured dispatcher.
    pub fn build_dispatcher(&self) -> Result<Arc<dyn Regenerate>> {
        let Some(url) = self.webhook_url.clone() else {
            tracing::info!("no webhook configured; regeneration requests are dropped");
            return Ok(Arc::new(DisabledDispatcher));
        };
        tracing::info!(endpoint = %url, envelope = ?self.webhook_envelope, "regeneration webhook enabled");
        let dispatcher = WebhookDispatcher::new(
            url,
            self.webhook_envelope,
            Duration::from_secs(self.webhook_timeout_secs.max(1)),
            self.webhook_max_in_flight,
        )?;
        Ok(Arc::new(dispatcher))
    }
}

/// Reference-integrity knobs.
#[derive(Args, Debug, Clone)]
pub struct IntegrityArgs {
    /// Also delete embeddings addressed through the legacy nested metadata shape
    #[arg(
        long,
        env = "KBADMIN_LEGACY_EMBEDDING_CLEANUP",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub legacy_embedding_cleanup: bool,

    /// Attempts when a generated F-/W- id collides with a concurrent insert
    #[arg(long, env = "KBADMIN_ID_ATTEMPTS", default_value_t = DEFAULT_ID_ATTEMPTS)]
    pub id_attempts: usize,
}

impl IntegrityArgs {
    /// Invalidation settings.
    pub fn embedding_index(&self) -> EmbeddingIndex {
        EmbeddingIndex::new(self.legacy_embedding_cleanup)
    }
}

/// Installs the global `tracing` subscriber (`RUST_LOG`, default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        webhook: WebhookArgs,
        #[command(flatten)]
        integrity: IntegrityArgs,
    }

    #[test]
    fn discrete_settings_build_a_config() {
        let database = DatabaseArgs {
            database_url: None,
            db_host: "db.internal".into(),
            db_port: 6543,
            db_user: "kb".into(),
            db_password: Some("secret".into()),
            db_name: "kb".into(),
            embedding_schema: "public".into(),
            embedding_table: "documents".into(),
        };
        let config = database.pg_config().expect("config");
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_user(), Some("kb"));
        assert_eq!(config.get_dbname(), Some("kb"));
        assert_eq!(
            database.embedding_table().expect("table").qualified(),
            "\"public\".\"documents\""
        );
    }

    #[test]
    fn url_overrides_discrete_settings() {
        let cli = TestCli::parse_from([
            "test",
            "--database-url",
            "postgres://admin@example.com:5433/kb",
            "--db-port",
            "1",
        ]);
        let config = cli.database.pg_config().expect("config");
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_user(), Some("admin"));
    }

    #[test]
    fn integrity_defaults_and_overrides() {
        let cli = TestCli::parse_from(["test"]);
        assert!(cli.integrity.embedding_index().legacy_cleanup());
        assert_eq!(cli.integrity.id_attempts, DEFAULT_ID_ATTEMPTS);
        assert_eq!(cli.webhook.webhook_envelope, Envelope::Bare);

        let cli = TestCli::parse_from([
            "test",
            "--legacy-embedding-cleanup",
            "false",
            "--webhook-envelope",
            "n8n",
        ]);
        assert!(!cli.integrity.embedding_index().legacy_cleanup());
        assert_eq!(cli.webhook.webhook_envelope, Envelope::N8n);
    }
}
