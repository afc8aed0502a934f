use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kbadmin::config::{init_tracing, DatabaseArgs, IntegrityArgs, WebhookArgs};
use kbadmin::{api, Coordinator, PgStore};

#[derive(Parser, Debug)]
#[command(
    name = "kbadmin-api",
    about = "HTTP API for knowledge-base records with embedding invalidation"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "KBADMIN_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Create the administrative tables when missing.
    #[arg(long, env = "KBADMIN_PREPARE_SCHEMA", default_value_t = false)]
    prepare_schema: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    webhook: WebhookArgs,

    #[command(flatten)]
    integrity: IntegrityArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = ApiCli::parse();

    let store = Arc::new(
        PgStore::connect(&cli.database.pg_config()?, cli.database.embedding_table()?).await?,
    );
    if cli.prepare_schema {
        store.prepare_schema().await?;
    }
    let dispatcher = cli.webhook.build_dispatcher()?;
    let coordinator = Arc::new(
        Coordinator::new(store.clone(), cli.integrity.embedding_index(), dispatcher)
            .with_id_attempts(cli.integrity.id_attempts),
    );
    let app = api::router(coordinator.clone());

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, embedding_table = %store.embedding_table().qualified(), "kbadmin-api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;

    tracing::info!("draining regeneration requests");
    coordinator.dispatcher().drain().await;
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
