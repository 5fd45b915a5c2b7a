//! apkforge - unattended APK patch builder
//!
//! Downloads stock Android packages, applies community patch bundles via the
//! external patcher CLI, optionally shrinks the result, and publishes final
//! artifacts to a build directory.
//!
//! # Architecture
//!
//! - **Closed source dispatch**: download sites are a closed enum
//!   (`dl::DownloadSource`), selected by explicit matching.
//! - **Tiered merge**: patch bundles from multiple sources merge in fixed
//!   precedence order; privacy sources always apply last.
//! - **Bounded fan-out**: one tokio task per (app, arch) job, gated by a
//!   semaphore sized from configuration.
//!
//! # Directory Layout
//!
//! ```text
//! ./
//! ├── temp/       # Per-job scratch + stock package cache
//! ├── build/      # Finalized artifacts, one per (app, arch)
//! ├── logs/       # Build log
//! └── bin/        # CLI/patch prebuilts + merged bundle cache
//! ```

pub mod core;
pub mod dl;
pub mod io;
pub mod optimize;
pub mod patch;
pub mod run;
pub mod types;
pub mod ui;

// Re-exports for convenience
pub use self::core::config;
pub use self::core::version;
pub use self::io::fetch as fetcher;

use std::path::PathBuf;

fn dir_from_env(var: &str, default: &str) -> PathBuf {
    if let Ok(val) = std::env::var(var) {
        return PathBuf::from(val);
    }
    PathBuf::from(default)
}

/// Scratch space and stock package cache: ./temp
pub fn temp_path() -> PathBuf {
    dir_from_env("APKFORGE_TEMP_DIR", "temp")
}

/// Finalized artifacts: ./build
pub fn build_path() -> PathBuf {
    dir_from_env("APKFORGE_BUILD_DIR", "build")
}

/// Build logs: ./logs
pub fn logs_path() -> PathBuf {
    dir_from_env("APKFORGE_LOGS_DIR", "logs")
}

/// Downloaded CLI/patch prebuilts and the merged bundle cache: ./bin
pub fn bin_path() -> PathBuf {
    dir_from_env("APKFORGE_BIN_DIR", "bin")
}

/// Build log file inside [`logs_path`].
pub fn build_log_path() -> PathBuf {
    logs_path().join("build.md")
}

/// Whether a previously built artifact may be reused instead of re-patching.
///
/// `APKFORGE_REBUILD=false` enables the skip; anything else forces a rebuild.
pub fn rebuild_disabled() -> bool {
    std::env::var("APKFORGE_REBUILD").is_ok_and(|v| v.eq_ignore_ascii_case("false"))
}

/// Extract the filename from a URL.
///
/// # Example
///
/// ```
/// use apkforge::filename_from_url;
///
/// assert_eq!(filename_from_url("https://example.com/path/app.apk"), "app.apk");
/// assert_eq!(filename_from_url(""), "");
/// ```
pub fn filename_from_url(url: &str) -> &str {
    url.split('/').next_back().unwrap_or("")
}

/// User Agent string
pub const USER_AGENT: &str = concat!("apkforge/", env!("CARGO_PKG_VERSION"));
