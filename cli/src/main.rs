//! Approvals admin CLI - inspect and drive approval chains directly against the database

use anyhow::Result;
use approvals::approval::ApprovalEngine;
use approvals::models::ApproverRef;
use approvals::store::{NewStep, Store};
use approvals::MIGRATOR;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "approvals-cli")]
#[command(about = "Admin CLI for the artifact approval engine")]
#[command(version)]
struct Cli {
    /// SQLite connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:approvals.db?mode=rwc")]
    database_url: String,

    /// Do not run embedded migrations before the command
    #[arg(long, env = "SKIP_MIGRATIONS")]
    skip_migrations: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a decision on the artifact's pending step
    Decide {
        #[arg(short, long)]
        artifact: Uuid,

        /// User casting the vote (an approver or their delegate)
        #[arg(long)]
        actor: Uuid,

        /// `approved` or `rejected`
        #[arg(short, long)]
        decision: String,

        #[arg(short, long)]
        reason: Option<String>,

        /// Refuse unless this step is still the pending one
        #[arg(short, long)]
        step: Option<Uuid>,
    },

    /// Show chain progress
    Progress {
        #[arg(short, long)]
        artifact: Uuid,

        /// Also report whether this user may act
        #[arg(short, long)]
        caller: Option<Uuid>,
    },

    /// Check whether a user may decide right now
    CanAct {
        #[arg(short, long)]
        artifact: Uuid,

        #[arg(long)]
        actor: Uuid,
    },

    /// List decisions of the artifact's current chain
    Decisions {
        #[arg(short, long)]
        artifact: Uuid,
    },

    /// Re-apply the pending step's stored tally
    Reconcile {
        #[arg(short, long)]
        artifact: Uuid,
    },

    /// Create a demo artifact with a two-step chain
    SeedDemo,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "approvals_cli=info,approvals=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&cli.database_url)
        .await?;
    if !cli.skip_migrations {
        MIGRATOR.run(&pool).await?;
    }
    let engine = ApprovalEngine::new(Store::new(pool));

    match cli.command {
        Commands::Decide {
            artifact,
            actor,
            decision,
            reason,
            step,
        } => {
            let reason = reason.as_deref();
            let outcome = match step {
                Some(step) => {
                    engine
                        .decide_on_step(artifact, step, actor, &decision, reason)
                        .await?
                }
                None => engine.decide(artifact, actor, &decision, reason).await?,
            };
            print_json(&outcome)
        }
        Commands::Progress { artifact, caller } => {
            print_json(&engine.get_progress(artifact, caller).await?)
        }
        Commands::CanAct { artifact, actor } => print_json(&engine.can_act(artifact, actor).await?),
        Commands::Decisions { artifact } => print_json(&engine.list_decisions(artifact).await?),
        Commands::Reconcile { artifact } => print_json(&engine.reconcile(artifact).await?),
        Commands::SeedDemo => run_seed_demo(engine.store()).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct DemoSeed {
    artifact_id: Uuid,
    chain_id: Uuid,
    reviewers: Vec<Uuid>,
    signer: Uuid,
    deputy: Uuid,
}

/// Step 1 needs two of three reviewers (one bound through membership) and
/// tolerates no rejection; step 2 is a single signer covered by a deputy.
async fn run_seed_demo(store: &Store) -> Result<()> {
    let project_id = Uuid::new_v4();
    let reviewers: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let signer = Uuid::new_v4();
    let deputy = Uuid::new_v4();

    let member = store.add_member(project_id, reviewers[0]).await?;
    let artifact = store.create_artifact(project_id, "Demo proposal").await?;

    let review = NewStep::new("Peer review")
        .min_approvals(2)
        .max_rejections(0)
        .approver(ApproverRef::Member(member))
        .approver(ApproverRef::User(reviewers[1]))
        .approver(ApproverRef::User(reviewers[2]));
    let sign_off = NewStep::new("Sign-off").approver(ApproverRef::User(signer));

    let (chain, _) = store
        .provision_chain(artifact.id, &[review, sign_off])
        .await?;
    store.add_delegation(signer, deputy, None, None).await?;

    tracing::info!(artifact_id = %artifact.id, "Seeded demo chain");

    print_json(&DemoSeed {
        artifact_id: artifact.id,
        chain_id: chain.id,
        reviewers,
        signer,
        deputy,
    })
}
