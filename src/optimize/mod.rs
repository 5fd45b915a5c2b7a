//! Post-patch package optimization.
//!
//! Strips resource directories for unwanted languages and screen densities,
//! drops known-safe incidental files, repacks at the configured compression
//! level and optionally aligns the result. Optimization failure never blocks
//! producing an artifact: the unmodified input is copied to the output path
//! and the error is reported to the caller.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::config::OptimizeSpec;
use crate::io::bundle::{self, ArchiveError};

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

fn language_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // values-es, values-pt-rBR; not values-night, values-v21, values-w600dp
    RE.get_or_init(|| Regex::new(r"^values-([a-z]{2,3})(-r[A-Z]{2})?$").unwrap())
}

fn density_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|-)((?:l|m|h|x{1,3}h|tv)dpi)(?:-|$)").unwrap())
}

/// Incidental files safe to drop from any package.
const INCIDENTAL_FILES: &[&str] = &["DebugProbesKt.bin", "kotlin-tooling-metadata.json"];

/// Shrink and repackage `input` into `output` per `spec`.
///
/// Disabled specs copy the input through byte-identical. On any unpack or
/// repack failure the input is copied through as well, and the error is
/// returned so the caller can count the failure while still shipping a
/// usable artifact.
pub fn optimize(input: &Path, output: &Path, spec: &OptimizeSpec) -> Result<(), OptimizeError> {
    if !spec.enabled {
        fs::copy(input, output)?;
        return Ok(());
    }

    match optimize_inner(input, output, spec) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(input = %input.display(), "optimization failed, copying through: {e}");
            fs::copy(input, output)?;
            Err(e)
        }
    }
}

fn optimize_inner(input: &Path, output: &Path, spec: &OptimizeSpec) -> Result<(), OptimizeError> {
    let staging = tempfile::Builder::new()
        .prefix("opt-")
        .tempdir_in(output.parent().unwrap_or(Path::new(".")))?;

    bundle::extract_zip(input, staging.path())?;

    prune_resource_dirs(staging.path(), spec)?;
    prune_incidental_files(staging.path())?;

    bundle::pack_dir(staging.path(), output, spec.compression_level)?;

    if spec.align {
        align_in_place(output);
    }
    Ok(())
}

fn prune_resource_dirs(root: &Path, spec: &OptimizeSpec) -> Result<(), OptimizeError> {
    let mut doomed = Vec::new();

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        if !spec.keep_languages.is_empty() {
            if let Some(caps) = language_dir_re().captures(&name) {
                let lang = &caps[1];
                if !spec.keep_languages.iter().any(|k| k == lang) {
                    doomed.push(entry.path().to_path_buf());
                    continue;
                }
            }
        }

        if !spec.keep_densities.is_empty() {
            if let Some(caps) = density_re().captures(&name) {
                let density = &caps[1];
                if !spec.keep_densities.iter().any(|k| k == density) {
                    doomed.push(entry.path().to_path_buf());
                }
            }
        }
    }

    for dir in doomed {
        // An ancestor may already have been removed.
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
    }
    Ok(())
}

fn prune_incidental_files(root: &Path) -> Result<(), OptimizeError> {
    let mut doomed = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let is_incidental = INCIDENTAL_FILES.contains(&name.as_ref())
            || (name.ends_with(".version")
                && entry.path().parent().is_some_and(|p| p.ends_with("META-INF")));
        if is_incidental {
            doomed.push(entry.path().to_path_buf());
        }
    }
    for file in doomed {
        fs::remove_file(&file)?;
    }
    Ok(())
}

/// Run the external alignment tool, replacing `output` only on success. A
/// missing or failing aligner leaves the unaligned package in place.
fn align_in_place(output: &Path) {
    let Ok(zipalign) = which::which("zipalign") else {
        tracing::warn!("zipalign not found, skipping alignment");
        return;
    };

    let aligned = output.with_extension("aligned");
    let status = Command::new(zipalign)
        .arg("-f")
        .arg("4")
        .arg(output)
        .arg(&aligned)
        .status();

    match status {
        Ok(s) if s.success() => {
            if let Err(e) = fs::rename(&aligned, output) {
                tracing::warn!("failed to swap aligned package: {e}");
                let _ = fs::remove_file(&aligned);
            }
        }
        Ok(s) => {
            tracing::warn!("zipalign exited with {s}, keeping unaligned package");
            let _ = fs::remove_file(&aligned);
        }
        Err(e) => {
            tracing::warn!("zipalign failed to start: {e}");
            let _ = fs::remove_file(&aligned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bundle::{list_entries, write_archive};
    use tempfile::tempdir;

    fn spec(enabled: bool) -> OptimizeSpec {
        OptimizeSpec {
            enabled,
            keep_languages: Vec::new(),
            keep_densities: Vec::new(),
            align: false,
            compression_level: 6,
        }
    }

    #[test]
    fn test_disabled_copies_byte_identical() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        write_archive(&input, &[("classes.dex", b"dex")]).unwrap();

        let output = dir.path().join("out.apk");
        optimize(&input, &output, &spec(false)).unwrap();

        assert_eq!(fs::read(&input).unwrap(), fs::read(&output).unwrap());
    }

    #[test]
    fn test_language_pruning_keeps_neutral_and_kept() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        write_archive(
            &input,
            &[
                ("res/values/strings.xml", b"<x/>"),
                ("res/values-en/strings.xml", b"<x/>"),
                ("res/values-es/strings.xml", b"<x/>"),
                ("res/values-pt-rBR/strings.xml", b"<x/>"),
                ("res/values-night/styles.xml", b"<x/>"),
            ],
        )
        .unwrap();

        let mut s = spec(true);
        s.keep_languages = vec!["en".to_string()];
        let output = dir.path().join("out.apk");
        optimize(&input, &output, &s).unwrap();

        let names = list_entries(&output).unwrap();
        assert!(names.iter().any(|n| n.starts_with("res/values/")));
        assert!(names.iter().any(|n| n.starts_with("res/values-en/")));
        assert!(!names.iter().any(|n| n.starts_with("res/values-es/")));
        assert!(!names.iter().any(|n| n.starts_with("res/values-pt-rBR/")));
        // values-night is a mode qualifier, not a language
        assert!(names.iter().any(|n| n.starts_with("res/values-night/")));
    }

    #[test]
    fn test_density_pruning_keeps_neutral_and_kept() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        write_archive(
            &input,
            &[
                ("res/drawable/icon.png", b"png"),
                ("res/drawable-hdpi/icon.png", b"png"),
                ("res/drawable-xxhdpi/icon.png", b"png"),
                ("res/mipmap-xhdpi-v4/ic.png", b"png"),
            ],
        )
        .unwrap();

        let mut s = spec(true);
        s.keep_densities = vec!["xxhdpi".to_string()];
        let output = dir.path().join("out.apk");
        optimize(&input, &output, &s).unwrap();

        let names = list_entries(&output).unwrap();
        assert!(names.iter().any(|n| n.starts_with("res/drawable/")));
        assert!(names.iter().any(|n| n.starts_with("res/drawable-xxhdpi/")));
        assert!(!names.iter().any(|n| n.starts_with("res/drawable-hdpi/")));
        assert!(!names.iter().any(|n| n.starts_with("res/mipmap-xhdpi-v4/")));
    }

    #[test]
    fn test_incidental_files_dropped() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.apk");
        write_archive(
            &input,
            &[
                ("classes.dex", b"dex"),
                ("DebugProbesKt.bin", b"junk"),
                ("META-INF/androidx.core.version", b"1.0"),
            ],
        )
        .unwrap();

        let output = dir.path().join("out.apk");
        optimize(&input, &output, &spec(true)).unwrap();

        let names = list_entries(&output).unwrap();
        assert!(names.contains(&"classes.dex".to_string()));
        assert!(!names.contains(&"DebugProbesKt.bin".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".version")));
    }

    #[test]
    fn test_failure_falls_back_to_copy() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("not-a-zip.apk");
        fs::write(&input, b"garbage bytes").unwrap();

        let output = dir.path().join("out.apk");
        let err = optimize(&input, &output, &spec(true));

        assert!(err.is_err());
        assert_eq!(fs::read(&output).unwrap(), b"garbage bytes");
    }
}
