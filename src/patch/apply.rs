//! External patcher invocation.
//!
//! Arguments are built as a real vector of discrete tokens, one contributing
//! step at a time, and handed to the process spawner as-is. Nothing is ever
//! joined into a string and re-split.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

/// Environment override for the JVM used to run the patcher.
pub const JAVA_ENV: &str = "APKFORGE_JAVA";

/// Keystore picked up from the working directory when present.
pub const KEYSTORE_FILE: &str = "ks.keystore";
/// Patch options file picked up from the working directory when present.
pub const OPTIONS_FILE: &str = "options.json";

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("java executable not found")]
    JavaMissing,

    #[error("patcher exited with {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

/// One patcher run, assembled step by step.
#[derive(Debug, Clone)]
pub struct PatcherInvocation {
    cli: PathBuf,
    bundle: PathBuf,
    out: PathBuf,
    args: Vec<String>,
}

impl PatcherInvocation {
    pub fn new(cli: &Path, bundle: &Path, out: &Path) -> Self {
        Self {
            cli: cli.to_path_buf(),
            bundle: bundle.to_path_buf(),
            out: out.to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn exclude(&mut self, patch: &str) -> &mut Self {
        self.args.push("-d".to_string());
        self.args.push(patch.to_string());
        self
    }

    pub fn include(&mut self, patch: &str) -> &mut Self {
        self.args.push("-e".to_string());
        self.args.push(patch.to_string());
        self
    }

    pub fn exclusive(&mut self) -> &mut Self {
        self.args.push("--exclusive".to_string());
        self
    }

    /// Strip native libraries for every ABI except `keep`.
    pub fn rip_libs_except(&mut self, keep: &str) -> &mut Self {
        for abi in ["arm64-v8a", "armeabi-v7a", "x86_64", "x86"] {
            if abi != keep {
                self.args.push(format!("--rip-lib={abi}"));
            }
        }
        self
    }

    /// Free-form tokens from configuration, appended verbatim.
    pub fn passthrough(&mut self, tokens: &[String]) -> &mut Self {
        self.args.extend(tokens.iter().cloned());
        self
    }

    /// The full argument vector, stock package path last.
    pub fn argv(&self, stock: &Path) -> Vec<String> {
        let mut argv = vec![
            "-jar".to_string(),
            self.cli.to_string_lossy().into_owned(),
            "patch".to_string(),
            "-p".to_string(),
            self.bundle.to_string_lossy().into_owned(),
            "-o".to_string(),
            self.out.to_string_lossy().into_owned(),
        ];

        if Path::new(KEYSTORE_FILE).exists() {
            argv.push("--keystore".to_string());
            argv.push(KEYSTORE_FILE.to_string());
        }
        if Path::new(OPTIONS_FILE).exists() {
            argv.push("--options".to_string());
            argv.push(OPTIONS_FILE.to_string());
        }
        argv.push("--purge".to_string());

        argv.extend(self.args.iter().cloned());
        argv.push(stock.to_string_lossy().into_owned());
        argv
    }

    /// Run the external patcher against `stock`. Non-zero exit is an error;
    /// the caller decides whether that skips the build.
    pub async fn run(&self, stock: &Path) -> Result<(), PatchError> {
        let java = java_executable()?;
        let argv = self.argv(stock);

        tracing::info!(out = %self.out.display(), "patching");
        tracing::debug!(?argv, "patcher argv");

        let output = Command::new(java)
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(12)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(PatchError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: tail,
            });
        }
        Ok(())
    }

    /// Ask the patcher to enumerate patches applicable to a package.
    pub async fn list_patches(cli: &Path, bundle: &Path, package_id: &str) -> Result<String, PatchError> {
        let java = java_executable()?;
        let output = Command::new(java)
            .arg("-jar")
            .arg(cli)
            .arg("list-patches")
            .arg("--with-packages")
            .arg("--with-versions")
            .arg("-f")
            .arg(package_id)
            .arg(bundle)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(PatchError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn java_executable() -> Result<PathBuf, PatchError> {
    if let Ok(java) = std::env::var(JAVA_ENV) {
        if !java.is_empty() {
            return Ok(PathBuf::from(java));
        }
    }
    which::which("java").map_err(|_| PatchError::JavaMissing)
}
