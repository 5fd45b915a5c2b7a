//! Build orchestration: per-app pipelines fanned out under a bounded
//! concurrency ceiling, with per-job failure isolation.

pub mod job;
pub mod orchestrator;

pub use job::{BuildSkip, JobOutcome};
pub use orchestrator::{Orchestrator, RunSummary};

use std::sync::Arc;

use crate::core::config::Config;
use crate::io::fetch::Fetcher;
use crate::patch::SourceResolver;
use crate::ui::Reporter;

/// Shared state every job sees. Cheap to clone; nothing here is mutated by
/// jobs except through their own cache-keyed files.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub fetcher: Fetcher,
    pub resolver: SourceResolver,
    pub reporter: Arc<dyn Reporter>,
}

impl Context {
    pub fn new(config: Config, fetcher: Fetcher, reporter: Arc<dyn Reporter>) -> Self {
        let resolver = SourceResolver::new(fetcher.clone(), crate::bin_path().join("bundles"));
        Self {
            config: Arc::new(config),
            fetcher,
            resolver,
            reporter,
        }
    }
}
