use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use recon_core::{Identifiers, OverwritePolicy, RecordKind, WorkspaceId};
use recon_sync::{CancellationFlag, EnrichRequest, RecordTarget};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Reconcile CRM records against CoreSignal profiles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Scope {
    /// Workspace whose records are processed.
    #[arg(long)]
    workspace: String,
    /// `person` or `company`.
    #[arg(long, default_value = "person")]
    kind: RecordKind,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enrich every live record of one kind in a workspace.
    Enrich {
        #[command(flatten)]
        scope: Scope,
        /// fillEmptyOnly, alwaysOverwrite or neverOverwrite.
        #[arg(long)]
        policy: Option<OverwritePolicy>,
        #[arg(long)]
        limit: Option<usize>,
        /// Continue after the last saved checkpoint.
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Replay provider answers from a fixture bundle.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Enrich a single record, by id or by identifier.
    EnrichOne {
        #[command(flatten)]
        scope: Scope,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        linkedin_url: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        website: Option<String>,
        #[arg(long)]
        policy: Option<OverwritePolicy>,
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Move legacy enrichment keys into the canonical attribute bag.
    Normalize {
        #[command(flatten)]
        scope: Scope,
    },
    Migrate,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Enrich {
            scope,
            policy,
            limit,
            resume,
            concurrency,
            fixtures,
        } => {
            let cancel = CancellationFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight records");
                    on_signal.cancel();
                }
            });

            let request = EnrichRequest {
                workspace_id: WorkspaceId::new(scope.workspace),
                kind: scope.kind,
                policy,
                limit,
                resume,
                concurrency,
                fixtures,
            };
            let output = recon_sync::run_enrichment_from_env(request, cancel).await?;
            let summary = &output.summary;
            println!(
                "enrichment complete: run_id={} processed={} retry_rounds={} cancelled={} reports={}",
                summary.run_id,
                summary.processed,
                summary.retry_rounds,
                summary.cancelled,
                output.reports_dir.display()
            );
            for (outcome, count) in &summary.counts {
                println!("  {outcome}: {count}");
            }
            if let Some(checkpoint) = &summary.checkpoint {
                println!("checkpoint saved after {checkpoint}; rerun with --resume to continue");
            }
        }
        Commands::EnrichOne {
            scope,
            id,
            linkedin_url,
            email,
            website,
            policy,
            fixtures,
        } => {
            let target = match id {
                Some(id) => RecordTarget::Id(id),
                None if linkedin_url.is_none() && email.is_none() && website.is_none() => {
                    bail!("pass --id or at least one of --linkedin-url, --email, --website")
                }
                None => RecordTarget::Identifiers(Identifiers {
                    linkedin_url,
                    email,
                    website,
                    ..Default::default()
                }),
            };
            let report = recon_sync::enrich_one_from_env(
                WorkspaceId::new(scope.workspace),
                scope.kind,
                target,
                policy,
                fixtures,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Normalize { scope } => {
            let summary =
                recon_sync::normalize_from_env(WorkspaceId::new(scope.workspace), scope.kind)
                    .await?;
            println!(
                "normalize complete: scanned={} migrated={} failed={}",
                summary.scanned,
                summary.migrated.len(),
                summary.failed.len()
            );
        }
        Commands::Migrate => {
            recon_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
