//! Progress reporting, decoupled from the build engine.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::config::TargetArch;
use crate::types::{AppName, Version};

/// Reporter trait for dependency injection: the engine reports job progress
/// without being coupled to a specific output implementation.
pub trait Reporter: Send + Sync {
    fn building(&self, app: &AppName, arch: TargetArch);

    fn built(&self, app: &AppName, arch: TargetArch, version: &Version, artifact: &Path);

    fn skipped(&self, app: &AppName, arch: TargetArch, reason: &str);

    fn warning(&self, msg: &str);

    fn error(&self, msg: &str);

    /// Final run summary: totals plus elapsed wall time.
    fn summary(&self, built: usize, skipped: usize, elapsed_secs: f64);
}

/// Reporter writing through the tracing subscriber.
#[derive(Default)]
pub struct CliReporter;

impl Reporter for CliReporter {
    fn building(&self, app: &AppName, arch: TargetArch) {
        tracing::info!(%app, %arch, "building");
    }

    fn built(&self, app: &AppName, arch: TargetArch, version: &Version, artifact: &Path) {
        tracing::info!(%app, %arch, %version, artifact = %artifact.display(), "built");
    }

    fn skipped(&self, app: &AppName, arch: TargetArch, reason: &str) {
        tracing::error!(%app, %arch, "skipped: {reason}");
    }

    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    fn summary(&self, built: usize, skipped: usize, elapsed_secs: f64) {
        if skipped > 0 {
            tracing::warn!("{skipped} build(s) failed or were skipped");
        }
        tracing::info!("{built} artifact(s) built in {elapsed_secs:.1}s");
    }
}

/// Silent reporter for tests.
#[derive(Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn building(&self, _: &AppName, _: TargetArch) {}
    fn built(&self, _: &AppName, _: TargetArch, _: &Version, _: &Path) {}
    fn skipped(&self, _: &AppName, _: TargetArch, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn summary(&self, _: usize, _: usize, _: f64) {}
}

/// Plain-text build log: one success line per finished app, then an
/// aggregated skip summary.
pub struct BuildLog {
    path: PathBuf,
}

impl BuildLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write(
        &self,
        built: &[(AppName, TargetArch, Version)],
        skipped: &[(AppName, TargetArch, String)],
    ) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        writeln!(file, "## Build {stamp}")?;
        for (app, arch, version) in built {
            writeln!(file, "{app} ({arch}): {version}")?;
        }
        if !skipped.is_empty() {
            let names: Vec<String> = skipped
                .iter()
                .map(|(app, arch, _)| format!("{app} ({arch})"))
                .collect();
            writeln!(file, "Skipped: {}", names.join(", "))?;
        }
        writeln!(file)?;
        Ok(())
    }
}
