use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbadmin::config::{init_tracing, DatabaseArgs, IntegrityArgs, WebhookArgs};
use kbadmin::{Coordinator, KbError, PgStore, SourceKind, SourceRef};

#[derive(Parser, Debug)]
#[command(
    name = "kbadmin-ctl",
    about = "Operator commands for knowledge-base reference integrity"
)]
struct CtlCli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    webhook: WebhookArgs,

    #[command(flatten)]
    integrity: IntegrityArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the administrative tables if missing
    Prepare {
        /// Also index the embedding table on its flat source address
        #[arg(long, default_value_t = false)]
        with_embedding_index: bool,
    },
    /// List the manual steps that reference a fund
    Dependents {
        /// Fund id (F-NNN)
        fund_id: String,
    },
    /// Delete a fund, previewing dependents unless --force is given
    DeleteFund {
        /// Fund id (F-NNN)
        fund_id: String,
        /// Rewrite or delete dependent steps instead of stopping
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Delete every embedding row of one record
    Invalidate {
        /// Record kind (funds, manual, scenario, term)
        kind: SourceKind,
        /// Record id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = CtlCli::parse();

    let store = Arc::new(
        PgStore::connect(&cli.database.pg_config()?, cli.database.embedding_table()?).await?,
    );
    let dispatcher = cli.webhook.build_dispatcher()?;
    let coordinator = Coordinator::new(store.clone(), cli.integrity.embedding_index(), dispatcher)
        .with_id_attempts(cli.integrity.id_attempts);

    let outcome = run(&cli.command, &coordinator, &store).await;
    coordinator.dispatcher().drain().await;
    store.close().await;
    outcome
}

async fn run(command: &Command, coordinator: &Coordinator, store: &PgStore) -> Result<()> {
    match command {
        Command::Prepare {
            with_embedding_index,
        } => {
            store.prepare_schema().await?;
            println!("Administrative tables are ready.");
            if *with_embedding_index {
                store.ensure_embedding_address_index().await?;
                println!(
                    "Address index ready on {}.",
                    store.embedding_table().qualified()
                );
            }
        }
        Command::Dependents { fund_id } => {
            let preview = coordinator
                .fund_dependents(fund_id)
                .await
                .with_context(|| format!("failed to resolve dependents of {fund_id}"))?;
            println!(
                "{} ({}) is referenced by {} step{}.",
                fund_id,
                preview.fund_abbr,
                preview.steps.len(),
                if preview.steps.len() == 1 { "" } else { "s" }
            );
            for step in &preview.steps {
                println!(
                    "  #{:<6} {} / step {} / {} [{}]",
                    step.chunk_id,
                    step.document_title.as_deref().unwrap_or("-"),
                    step.step_number
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    step.topic.as_deref().unwrap_or("-"),
                    step.fund_abbr.as_deref().unwrap_or("")
                );
            }
        }
        Command::DeleteFund { fund_id, force } => {
            match coordinator.delete_fund(fund_id, *force).await {
                Ok(deletion) => println!(
                    "Deleted {}: {} step(s) removed, {} step(s) rewritten.",
                    deletion.fund_id,
                    deletion.deleted_steps.len(),
                    deletion.updated_steps.len()
                ),
                Err(KbError::Conflict(conflict)) => {
                    println!(
                        "{} ({}) is still referenced by {} step(s); re-run with --force to cascade:",
                        fund_id,
                        conflict.fund_abbr,
                        conflict.steps.len()
                    );
                    for step in &conflict.steps {
                        println!(
                            "  #{} {}",
                            step.chunk_id,
                            step.fund_abbr.as_deref().unwrap_or("")
                        );
                    }
                    anyhow::bail!("fund deletion blocked by dependents");
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!("failed to delete {fund_id}")))
                }
            }
        }
        Command::Invalidate { kind, id } => {
            let source = SourceRef::new(*kind, id);
            let removed = coordinator.invalidate(&source).await?;
            println!(
                "Removed {} embedding row{} for {}.",
                removed,
                if removed == 1 { "" } else { "s" },
                source
            );
        }
    }
    Ok(())
}
