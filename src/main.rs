//! Millwright service binary.
//!
//! `serve` starts the full service: database, credential refresher,
//! channel adapters, and the HTTP API. `run` executes a single code-track
//! run from the command line, which is handy for local pipeline work
//! without a channel in front.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use millwright::config::AppConfig;
use millwright::credentials::refresh::TokenRefresher;
use millwright::credentials::{CredentialStore, TokenCipher};
use millwright::ingress::chatwork::ChatworkAdapter;
use millwright::ingress::slack::SlackAdapter;
use millwright::ingress::ChannelAdapter;
use millwright::logging;
use millwright::persist::Database;
use millwright::providers::router::ModelRouter;
use millwright::runs::stages::RunStageContext;
use millwright::runs::{RunController, StartRunParams};
use millwright::saas::AdapterRegistry;
use millwright::sandbox::docker::DockerWorkspaceFactory;
use millwright::sandbox::local::LocalWorkspaceFactory;
use millwright::sandbox::WorkspaceFactory;
use millwright::server::{self, AppState};
use millwright::tasks::{TaskController, TaskStageContext};
use millwright::vcs::GitCliPublisher;

#[derive(Parser)]
#[command(name = "millwright", about = "Multi-tenant agent orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the service (default).
    Serve,
    /// Execute one code-track run and print the outcome.
    Run {
        /// Requirement text.
        requirement: String,
        /// Tenant to run as.
        #[arg(long, default_value = "local")]
        tenant: String,
        /// Genre hint for classification.
        #[arg(long)]
        genre: Option<String>,
        /// Emit rule-improvement candidates.
        #[arg(long)]
        improve_rules: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Local development convenience; missing .env files are fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Run {
            requirement,
            tenant,
            genre,
            improve_rules,
        } => run_once(requirement, tenant, genre, improve_rules).await,
    }
}

async fn serve() -> Result<()> {
    let config = AppConfig::load()?;
    let _logging_guard = logging::init_production(Path::new(&config.paths.logs_dir))?;
    info!("millwright starting");

    let (state, refresher) = build_app(&config).await?;

    // Single background refresher; aborted when the process exits.
    let refresher_handle = refresher.spawn();

    let result = server::serve(state, &config.server.bind).await;
    refresher_handle.abort();
    result
}

async fn run_once(
    requirement: String,
    tenant: String,
    genre: Option<String>,
    improve_rules: bool,
) -> Result<()> {
    logging::init_cli();
    let config = AppConfig::load()?;
    let (state, _refresher) = build_app(&config).await?;

    let final_state = state
        .runs
        .start_run(StartRunParams {
            tenant_id: tenant,
            requirement,
            genre,
            emit_rule_improvements: improve_rules,
            origin_event_id: None,
        })
        .await?;

    println!("run_id: {}", final_state.run_id);
    println!("status: {}", final_state.status);
    if !final_state.mr_url.is_empty() {
        println!("merge request: {}", final_state.mr_url);
    }
    if !final_state.output_subdir.is_empty() {
        println!("output: {}", final_state.output_subdir);
    }
    for error in &final_state.error_logs {
        println!("error: {error}");
    }
    println!(
        "tokens: {} in / {} out",
        final_state.total_input_tokens, final_state.total_output_tokens
    );
    Ok(())
}

/// Wire every component from configuration.
async fn build_app(config: &AppConfig) -> Result<(Arc<AppState>, TokenRefresher)> {
    let db = Database::open(Path::new(&config.paths.database))
        .await
        .context("failed to open database")?;

    let cipher = TokenCipher::from_key(config.credentials.encryption_key.as_deref())?;
    let store = CredentialStore::new(db.clone(), cipher);
    let refresher = TokenRefresher::new(
        store.clone(),
        config.credentials.refresh_interval(),
        config.credentials.refresh_buffer(),
    );

    let models = ModelRouter::from_config(&config.llm);

    let workspaces: Arc<dyn WorkspaceFactory> =
        match DockerWorkspaceFactory::connect(config.sandbox.clone()) {
            Ok(factory) => Arc::new(factory),
            Err(e) => {
                warn!(error = %e, "docker unavailable; falling back to the local workspace");
                Arc::new(LocalWorkspaceFactory)
            }
        };

    let vcs = Arc::new(GitCliPublisher::new(
        PathBuf::from(&config.paths.workspace_root),
        "origin",
    ));

    let run_ctx = Arc::new(RunStageContext {
        models: models.clone(),
        workspaces,
        vcs,
        pipeline: config.pipeline.clone(),
        sandbox: config.sandbox.clone(),
    });
    let runs = Arc::new(RunController::new(
        run_ctx,
        db.clone(),
        config.cost.clone(),
        config.paths.workspace_root.clone(),
        config.paths.rules_dir.clone(),
    ));

    // SaaS adapters register here as integrations are linked in. The
    // registry starts empty in the open-core build.
    let adapters = AdapterRegistry::new();

    let task_ctx = Arc::new(TaskStageContext {
        models,
        adapters,
        store,
        refresher: refresher.clone(),
        db: db.clone(),
        pipeline: config.pipeline.clone(),
        rules_dir: PathBuf::from(&config.paths.workspace_root).join(&config.paths.rules_dir),
    });
    let tasks = Arc::new(TaskController::new(task_ctx, config.learning.rule_threshold));

    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    channels.insert("slack".to_owned(), Arc::new(SlackAdapter::new(None)));
    channels.insert(
        "chatwork".to_owned(),
        Arc::new(ChatworkAdapter::new(None, None)),
    );

    let state = Arc::new(AppState {
        db,
        runs,
        tasks,
        channels,
    });
    Ok((state, refresher))
}
