//! SaaS track: instruction → plan → approval → execution → report.

use std::path::PathBuf;

use crate::config::PipelineConfig;
use crate::credentials::refresh::TokenRefresher;
use crate::credentials::CredentialStore;
use crate::persist::Database;
use crate::providers::router::ModelRouter;
use crate::saas::AdapterRegistry;

pub mod controller;
pub mod executor;
pub mod learning;
pub mod planner;
pub mod reporter;
pub mod state;

pub use controller::{CreateTaskParams, TaskController};
pub use state::{TaskDelta, TaskState};

/// Services and limits shared by the SaaS-track stages.
pub struct TaskStageContext {
    pub models: ModelRouter,
    pub adapters: AdapterRegistry,
    pub store: CredentialStore,
    pub refresher: TokenRefresher,
    pub db: Database,
    pub pipeline: PipelineConfig,
    pub rules_dir: PathBuf,
}
