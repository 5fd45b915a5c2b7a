//! Concurrent scheduling of app builds.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::config::{Config, TargetArch};
use crate::io::fetch::{FetchError, Fetcher};
use crate::run::job::{self, JobOutcome};
use crate::run::Context;
use crate::types::{AppName, Version};
use crate::ui::{BuildLog, Reporter};

/// What a finished run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub built: Vec<(AppName, TargetArch, Version, std::path::PathBuf)>,
    pub skipped: Vec<(AppName, TargetArch, String)>,
}

impl RunSummary {
    /// The run hard-fails only when nothing at all was produced.
    pub fn produced_output(&self) -> bool {
        !self.built.is_empty()
    }
}

pub struct Orchestrator {
    ctx: Context,
    ceiling: usize,
}

impl Orchestrator {
    pub fn new(config: Config, reporter: Arc<dyn Reporter>) -> Result<Self, FetchError> {
        for dir in [
            crate::temp_path(),
            crate::build_path(),
            crate::logs_path(),
            crate::bin_path(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let fetcher = Fetcher::new(crate::bin_path())?;
        // Termux-style environments cannot afford parallel patcher JVMs.
        let ceiling = if std::env::var_os("TERMUX_VERSION").is_some() {
            1
        } else {
            config.parallel_jobs.max(1)
        };
        let ctx = Context::new(config, fetcher, reporter);
        Ok(Self { ctx, ceiling })
    }

    /// Assemble an orchestrator from pre-built parts. Used by tests that
    /// need a custom fetcher endpoint.
    pub fn with_context(ctx: Context, ceiling: usize) -> Self {
        Self {
            ctx,
            ceiling: ceiling.max(1),
        }
    }

    /// Run every enabled (app, arch) job under the concurrency ceiling and
    /// report the aggregate.
    pub async fn run(&self) -> RunSummary {
        let start = Instant::now();

        let mut tasks: Vec<_> = Vec::new();
        for app in self.ctx.config.enabled_apps() {
            for arch in app.arch.jobs() {
                let ctx = self.ctx.clone();
                let spec = app.clone();
                tasks.push(move || async move {
                    let outcome = job::run_job(&ctx, &spec, arch).await;
                    (spec.name.clone(), arch, outcome)
                });
            }
        }

        let outcomes = bounded_fan_out(self.ceiling, tasks).await;

        let mut summary = RunSummary::default();
        for (app, arch, outcome) in outcomes {
            match outcome {
                JobOutcome::Built { version, artifact } => {
                    summary.built.push((app, arch, version, artifact));
                }
                JobOutcome::Skipped { reason } => {
                    summary.skipped.push((app, arch, reason));
                }
            }
        }

        let log = BuildLog::new(crate::build_log_path());
        let built_lines: Vec<_> = summary
            .built
            .iter()
            .map(|(app, arch, version, _)| (app.clone(), *arch, version.clone()))
            .collect();
        if let Err(e) = log.write(&built_lines, &summary.skipped) {
            self.ctx.reporter.warning(&format!("build log unwritable: {e}"));
        }

        self.ctx.reporter.summary(
            summary.built.len(),
            summary.skipped.len(),
            start.elapsed().as_secs_f64(),
        );
        summary
    }
}

/// Run every task concurrently, never more than `ceiling` at once. Slots are
/// reclaimed as tasks finish; results arrive in completion order.
pub async fn bounded_fan_out<T, F, Fut>(ceiling: usize, tasks: Vec<F>) -> Vec<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(ceiling));
    let mut set: JoinSet<T> = JoinSet::new();

    for task in tasks {
        let semaphore = semaphore.clone();
        set.spawn(async move {
            // Closed only if the semaphore is dropped, which it never is here.
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore closed");
            task().await
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(res) = set.join_next().await {
        match res {
            Ok(value) => results.push(value),
            Err(e) => tracing::error!("job panicked: {e}"),
        }
    }
    results
}

/// Remove every generated temp/build/log artifact. Prebuilt caches under the
/// bin directory survive.
pub fn clean_artifacts() -> std::io::Result<()> {
    for dir in [crate::temp_path(), crate::build_path(), crate::logs_path()] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
    }
    Ok(())
}

/// Best-effort sweep of partial files after an interrupt.
pub fn sweep_temp_litter() {
    for dir in [
        crate::temp_path(),
        crate::build_path(),
        crate::bin_path(),
        crate::bin_path().join("bundles"),
    ] {
        sweep_dir(&dir);
    }
}

fn sweep_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(".tmp-")
            || name.ends_with(".part")
            || name.starts_with("merge-")
            || name.starts_with("opt-")
        {
            let path = entry.path();
            let _ = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
        }
    }
}
