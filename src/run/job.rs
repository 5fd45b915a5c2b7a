//! One (app, architecture) build, start to finish.
//!
//! Steps are strictly sequential: probe sources, resolve patches, resolve
//! the version, download (or reuse the cached stock package), check the
//! signature, patch, optimize, finalize. Every recoverable error turns into
//! a skip at the job boundary; nothing here can affect sibling jobs.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::config::{AppBuildSpec, TargetArch, VersionPolicy};
use crate::core::version::{self, VersionError};
use crate::dl::{DlError, DownloadSource};
use crate::io::bundle;
use crate::patch::apply::{PatchError, PatcherInvocation};
use crate::patch::sources::ResolveError;
use crate::run::Context;
use crate::types::Version;

/// Patch auto-included for every build. An explicit user exclusion of the
/// same name suppresses it.
pub const AUTO_PRIVACY_PATCH: &str = "Remove tracking query parameter";

/// Why a build was skipped. Always soft: the run continues.
#[derive(Error, Debug)]
pub enum BuildSkip {
    #[error("no download source yielded a package id")]
    NoPackageId,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Download(#[from] DlError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum JobOutcome {
    Built { version: Version, artifact: PathBuf },
    Skipped { reason: String },
}

/// Run one job to its terminal state. Never panics the run; every error is
/// caught here and converted into a skip.
pub async fn run_job(ctx: &Context, spec: &AppBuildSpec, arch: TargetArch) -> JobOutcome {
    ctx.reporter.building(&spec.name, arch);

    match build(ctx, spec, arch).await {
        Ok((version, artifact)) => {
            ctx.reporter.built(&spec.name, arch, &version, &artifact);
            JobOutcome::Built { version, artifact }
        }
        Err(skip) => {
            let reason = skip.to_string();
            ctx.reporter.skipped(&spec.name, arch, &reason);
            JobOutcome::Skipped { reason }
        }
    }
}

async fn build(
    ctx: &Context,
    spec: &AppBuildSpec,
    arch: TargetArch,
) -> Result<(Version, PathBuf), BuildSkip> {
    // Source probing: first configured source with a usable package id wins.
    let mut chosen = None;
    for (kind, url) in spec.configured_sources() {
        let source = DownloadSource::new(kind, url);
        match source.probe(&ctx.fetcher).await {
            Ok(listing) => {
                if let Some(id) = source.package_id(&listing) {
                    chosen = Some((source, listing, id));
                    break;
                }
                tracing::warn!(app = %spec.name, %kind, "no package id in listing");
            }
            Err(e) => {
                tracing::warn!(app = %spec.name, %kind, "probe failed: {e}");
            }
        }
    }
    let (source, listing, package_id) = chosen.ok_or(BuildSkip::NoPackageId)?;

    // Patch resolution
    let artifacts = ctx
        .resolver
        .resolve(
            &ctx.config.patch_sources,
            &ctx.config.default_source,
            &spec.patch_sources,
        )
        .await?;

    // Version resolution
    let patch_listing = match &spec.version {
        VersionPolicy::Auto => {
            PatcherInvocation::list_patches(&artifacts.cli, &artifacts.bundle, &package_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(app = %spec.name, "patch listing unavailable: {e}");
                    String::new()
                })
        }
        _ => String::new(),
    };
    let available = source.version_list(&listing);
    let version = version::resolve_version(&spec.version, &package_id, &patch_listing, &available)?;

    let artifact_name = format!(
        "{}-{}-{}-{}.apk",
        spec.brand.to_lowercase(),
        spec.name,
        version,
        arch
    );
    let final_path = crate::build_path().join(&artifact_name);

    // Rebuild skip: reuse a previously patched artifact when permitted.
    if crate::rebuild_disabled() && final_path.exists() {
        tracing::info!(app = %spec.name, %version, "artifact exists, skipping re-patch");
        return Ok((version, final_path));
    }

    // Download, or stock cache hit.
    let stock = crate::temp_path().join(format!("{package_id}-{version}-{arch}.apk"));
    if spec.cache_apk && stock.exists() {
        tracing::info!(app = %spec.name, %version, "stock package cache hit");
    } else {
        source
            .download(
                &ctx.fetcher,
                &package_id,
                &version,
                &stock,
                arch.as_str(),
                &spec.dpi,
            )
            .await?;
    }

    // Signature check: best-effort, warn only.
    if let Some(expected) = &spec.expected_signature {
        check_signature(ctx, spec, &stock, expected);
    }

    // Patching
    let patched = crate::temp_path().join(format!("{}-{}-{}-patched.apk", spec.name, version, arch));
    let invocation = assemble_invocation(spec, arch, &artifacts.cli, &artifacts.bundle, &patched);
    invocation.run(&stock).await?;

    // Optimize into a partial file, then finalize atomically.
    tokio::fs::create_dir_all(crate::build_path()).await?;
    let part = crate::build_path().join(format!(".{artifact_name}.part"));
    let optimize_result = {
        let patched = patched.clone();
        let part = part.clone();
        let opt = spec.optimize.clone();
        tokio::task::spawn_blocking(move || crate::optimize::optimize(&patched, &part, &opt))
            .await
            .map_err(std::io::Error::other)?
    };
    if let Err(e) = optimize_result {
        ctx.reporter
            .warning(&format!("{}: optimization failed, shipping unoptimized: {e}", spec.name));
    }
    tokio::fs::rename(&part, &final_path).await?;

    let _ = tokio::fs::remove_file(&patched).await;
    if !spec.cache_apk {
        let _ = tokio::fs::remove_file(&stock).await;
    }

    Ok((version, final_path))
}

/// Build the patcher argument set for one job: exclusions first, then
/// inclusions, exclusivity, the auto-added privacy patch (unless the user
/// excluded it by name), architecture-library stripping, and finally the
/// free-form passthrough tokens.
fn assemble_invocation(
    spec: &AppBuildSpec,
    arch: TargetArch,
    cli: &std::path::Path,
    bundle: &std::path::Path,
    out: &std::path::Path,
) -> PatcherInvocation {
    let mut invocation = PatcherInvocation::new(cli, bundle, out);
    for patch in &spec.excluded_patches {
        invocation.exclude(patch);
    }
    for patch in &spec.included_patches {
        invocation.include(patch);
    }
    if spec.exclusive_patches {
        invocation.exclusive();
    }
    if !spec.excluded_patches.iter().any(|p| p == AUTO_PRIVACY_PATCH) {
        invocation.include(AUTO_PRIVACY_PATCH);
    }
    if spec.riplib {
        if let Some(abi) = arch.abi() {
            invocation.rip_libs_except(abi);
        }
    }
    invocation.passthrough(&spec.patcher_args);
    invocation
}

/// Compare the package's signing-certificate digest against the expected
/// value. Signature data is best-effort and optional; any outcome short of
/// a match is at most a warning.
fn check_signature(ctx: &Context, spec: &AppBuildSpec, stock: &std::path::Path, expected: &str) {
    let cert = bundle::list_entries(stock).ok().and_then(|entries| {
        entries.into_iter().find(|name| {
            name.starts_with("META-INF/")
                && (name.ends_with(".RSA") || name.ends_with(".DSA") || name.ends_with(".EC"))
        })
    });

    let Some(cert_name) = cert else {
        ctx.reporter
            .warning(&format!("{}: no signing certificate found", spec.name));
        return;
    };

    match bundle::read_entry(stock, &cert_name) {
        Ok(bytes) => {
            let digest = hex::encode(Sha256::digest(&bytes));
            if !digest.eq_ignore_ascii_case(expected) {
                ctx.reporter.warning(&format!(
                    "{}: signature mismatch (expected {expected}, got {digest})",
                    spec.name
                ));
            }
        }
        Err(e) => {
            ctx.reporter
                .warning(&format!("{}: signature unreadable: {e}", spec.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ArchSelector, OptimizeSpec};
    use crate::types::AppName;
    use std::path::Path;

    fn base_spec() -> AppBuildSpec {
        AppBuildSpec {
            name: AppName::new("app"),
            display_name: "App".to_string(),
            brand: "ReVanced".to_string(),
            version: VersionPolicy::Auto,
            arch: ArchSelector::All,
            dpi: "nodpi".to_string(),
            included_patches: Vec::new(),
            excluded_patches: Vec::new(),
            exclusive_patches: false,
            patcher_args: Vec::new(),
            archive_url: String::new(),
            apkmirror_url: "https://example.com".to_string(),
            uptodown_url: String::new(),
            enabled: true,
            optimize: OptimizeSpec::default(),
            patch_sources: Vec::new(),
            cache_apk: true,
            riplib: false,
            expected_signature: None,
        }
    }

    fn argv_for(spec: &AppBuildSpec, arch: TargetArch) -> Vec<String> {
        assemble_invocation(
            spec,
            arch,
            Path::new("cli.jar"),
            Path::new("bundle.rvp"),
            Path::new("out.apk"),
        )
        .argv(Path::new("stock.apk"))
    }

    #[test]
    fn test_privacy_patch_auto_included() {
        let argv = argv_for(&base_spec(), TargetArch::All);
        assert!(argv.contains(&AUTO_PRIVACY_PATCH.to_string()));
    }

    #[test]
    fn test_explicit_exclusion_suppresses_auto_include() {
        let mut spec = base_spec();
        spec.excluded_patches = vec![AUTO_PRIVACY_PATCH.to_string()];
        let argv = argv_for(&spec, TargetArch::All);

        let mentions = argv.iter().filter(|a| *a == AUTO_PRIVACY_PATCH).count();
        // Still named once, as the exclusion target, never as an inclusion.
        assert_eq!(mentions, 1);
        let pos = argv.iter().position(|a| a == AUTO_PRIVACY_PATCH).unwrap();
        assert_eq!(argv[pos - 1], "-d");
    }

    #[test]
    fn test_riplib_only_for_single_abi_targets() {
        let mut spec = base_spec();
        spec.riplib = true;

        let all = argv_for(&spec, TargetArch::All);
        assert!(!all.iter().any(|a| a.starts_with("--rip-lib")));

        let arm64 = argv_for(&spec, TargetArch::Arm64);
        assert!(arm64.contains(&"--rip-lib=armeabi-v7a".to_string()));
        assert!(!arm64.contains(&"--rip-lib=arm64-v8a".to_string()));
    }

    #[test]
    fn test_skip_reasons_render() {
        let skip = BuildSkip::NoPackageId;
        assert_eq!(skip.to_string(), "no download source yielded a package id");
    }
}
