//! Multi-source patch resolution and bundle merging.
//!
//! Each logical source key resolves to a (CLI jar, patch bundle) pair. When
//! an app requests more than one source, the bundles merge into a single
//! archive in fixed tier order: Primary, then Secondary, then
//! PrivacyOverride. Later extraction overwrites same-named entries, so
//! privacy sources always win on conflict. That ordering is a correctness
//! invariant.
//!
//! Merged bundles are cached on disk keyed by a hash of the exact ordered
//! set of (key, repository, resolved tag) tuples; re-resolving the same set
//! never repeats the merge.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::config::PatchSourceEntry;
use crate::io::bundle::{self, ArchiveError};
use crate::io::fetch::{FetchError, Fetcher, PrebuiltKind};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("unknown patch source '{key}'")]
    UnknownPatchSource { key: String },

    #[error("patch source '{key}' has no source repository")]
    MissingSourceField { key: String },

    #[error("no patch sources resolved")]
    NoPatchSourcesResolved,

    #[error("no CLI artifact resolved")]
    NoCliResolved,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Precedence class governing merge order.
///
/// The derived `Ord` is the merge order: `Primary < Secondary <
/// PrivacyOverride`, and PrivacyOverride must always extract last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatchTier {
    Primary,
    Secondary,
    PrivacyOverride,
}

fn privacy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|[-_/])privacy").unwrap())
}

fn extended_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(revanced-patches-extended|revanced-extended|rvx|anddea|inotia)").unwrap()
    })
}

impl PatchTier {
    /// Classify a source by its logical key and resolved repository path.
    pub fn classify(key: &str, repo_path: &str) -> Self {
        if key == "privacy" || privacy_re().is_match(repo_path) {
            Self::PrivacyOverride
        } else if extended_re().is_match(repo_path) {
            Self::Primary
        } else {
            Self::Secondary
        }
    }
}

/// The CLI jar and patch bundle one build uses.
#[derive(Debug, Clone)]
pub struct ResolvedArtifacts {
    pub cli: PathBuf,
    pub bundle: PathBuf,
}

/// One source after fetching: where its bundle landed and which tier it
/// merges in.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub key: String,
    pub repo: String,
    pub tag: String,
    pub bundle: PathBuf,
    pub tier: PatchTier,
}

/// Resolves logical patch-source keys into concrete artifacts.
#[derive(Clone)]
pub struct SourceResolver {
    fetcher: Fetcher,
    bundle_cache_dir: PathBuf,
    merge_count: Arc<AtomicUsize>,
}

impl SourceResolver {
    pub fn new(fetcher: Fetcher, bundle_cache_dir: PathBuf) -> Self {
        Self {
            fetcher,
            bundle_cache_dir,
            merge_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many merges this resolver has performed. Cache hits do not count.
    pub fn merges_performed(&self) -> usize {
        self.merge_count.load(Ordering::SeqCst)
    }

    /// Resolve an ordered list of logical keys against the `PatchSources`
    /// section. An empty list means the run-wide default source.
    ///
    /// Individual sources that fail to fetch are logged and dropped; the
    /// resolution only errors when nothing resolves at all.
    pub async fn resolve(
        &self,
        sources: &BTreeMap<String, PatchSourceEntry>,
        default_source: &PatchSourceEntry,
        keys: &[String],
    ) -> Result<ResolvedArtifacts, ResolveError> {
        let mut entries: Vec<&PatchSourceEntry> = Vec::new();
        if keys.is_empty() {
            entries.push(default_source);
        } else {
            for key in keys {
                let entry = sources
                    .get(key)
                    .ok_or_else(|| ResolveError::UnknownPatchSource { key: key.clone() })?;
                if entry.patches.path.is_empty() {
                    return Err(ResolveError::MissingSourceField { key: key.clone() });
                }
                entries.push(entry);
            }
        }

        let mut cli: Option<PathBuf> = None;
        let mut resolved: Vec<ResolvedSource> = Vec::new();

        for entry in entries {
            // The first successfully resolved CLI serves the whole bundle.
            if cli.is_none() {
                match self.fetcher.fetch_prebuilt(&entry.cli, PrebuiltKind::Cli).await {
                    Ok(prebuilt) => cli = Some(prebuilt.path),
                    Err(e) => {
                        tracing::warn!(source = %entry.key, "CLI fetch failed: {e}");
                    }
                }
            }

            match self
                .fetcher
                .fetch_prebuilt(&entry.patches, PrebuiltKind::Patches)
                .await
            {
                Ok(prebuilt) => {
                    let tier = PatchTier::classify(&entry.key, &entry.patches.path);
                    resolved.push(ResolvedSource {
                        key: entry.key.clone(),
                        repo: entry.patches.path.clone(),
                        tag: prebuilt.tag,
                        bundle: prebuilt.path,
                        tier,
                    });
                }
                Err(e) => {
                    tracing::warn!(source = %entry.key, "patch fetch failed: {e}");
                }
            }
        }

        if resolved.is_empty() {
            return Err(ResolveError::NoPatchSourcesResolved);
        }
        let cli = cli.ok_or(ResolveError::NoCliResolved)?;

        let this = self.clone();
        let bundle = tokio::task::spawn_blocking(move || this.bundle_for(&resolved))
            .await
            .map_err(|e| std::io::Error::other(e))??;

        Ok(ResolvedArtifacts { cli, bundle })
    }

    /// Produce the single bundle for a resolved source set: pass-through for
    /// one source, cached tier-ordered merge otherwise.
    pub fn bundle_for(&self, resolved: &[ResolvedSource]) -> Result<PathBuf, ResolveError> {
        if resolved.len() == 1 {
            return Ok(resolved[0].bundle.clone());
        }

        let cache_key = merge_cache_key(resolved);
        let cached = self.bundle_cache_dir.join(format!("{cache_key}.rvp"));
        if cached.exists() {
            tracing::debug!(path = %cached.display(), "merged bundle cache hit");
            return Ok(cached);
        }

        // Stable sort: tier order decides, config order breaks ties.
        let mut ordered: Vec<&ResolvedSource> = resolved.iter().collect();
        ordered.sort_by_key(|s| s.tier);

        std::fs::create_dir_all(&self.bundle_cache_dir)?;
        let staging = tempfile::Builder::new()
            .prefix("merge-")
            .tempdir_in(&self.bundle_cache_dir)?;

        for source in &ordered {
            tracing::debug!(source = %source.key, tier = ?source.tier, "merging bundle");
            bundle::extract_zip(&source.bundle, staging.path())?;
        }

        self.merge_count.fetch_add(1, Ordering::SeqCst);
        bundle::pack_dir(staging.path(), &cached, 9)?;
        Ok(cached)
    }
}

/// Stable hash over the ordered (key, repository, resolved tag) tuples.
fn merge_cache_key(resolved: &[ResolvedSource]) -> String {
    let mut hasher = Sha256::new();
    for source in resolved {
        hasher.update(source.key.as_bytes());
        hasher.update([0]);
        hasher.update(source.repo.as_bytes());
        hasher.update([0]);
        hasher.update(source.tag.as_bytes());
        hasher.update([b'\n']);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bundle::{read_entry, write_archive};
    use tempfile::tempdir;

    fn resolver(dir: &std::path::Path) -> SourceResolver {
        let fetcher = Fetcher::with_options(
            dir.join("prebuilts"),
            "http://127.0.0.1:0".to_string(),
            None,
        )
        .unwrap();
        SourceResolver::new(fetcher, dir.join("bundles"))
    }

    fn source(dir: &std::path::Path, key: &str, repo: &str, entry: (&str, &[u8])) -> ResolvedSource {
        let bundle = dir.join(format!("{key}.rvp"));
        write_archive(&bundle, &[entry]).unwrap();
        ResolvedSource {
            key: key.to_string(),
            repo: repo.to_string(),
            tag: "v1".to_string(),
            bundle,
            tier: PatchTier::classify(key, repo),
        }
    }

    #[test]
    fn test_classify_tiers() {
        assert_eq!(
            PatchTier::classify("privacy", "someone/whatever"),
            PatchTier::PrivacyOverride
        );
        assert_eq!(
            PatchTier::classify("extra", "org/privacy-patches"),
            PatchTier::PrivacyOverride
        );
        assert_eq!(
            PatchTier::classify("main", "anddea/revanced-patches"),
            PatchTier::Primary
        );
        assert_eq!(
            PatchTier::classify("main", "inotia00/revanced-patches"),
            PatchTier::Primary
        );
        assert_eq!(
            PatchTier::classify("other", "somebody/some-patches"),
            PatchTier::Secondary
        );
    }

    #[test]
    fn test_single_source_skips_merge() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());
        let only = source(dir.path(), "solo", "a/b", ("p.txt", b"x"));

        let out = r.bundle_for(std::slice::from_ref(&only)).unwrap();
        assert_eq!(out, only.bundle);
        assert_eq!(r.merges_performed(), 0);
    }

    #[test]
    fn test_privacy_overrides_regardless_of_input_order() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());

        // privacy listed FIRST but must still apply last
        let privacy = source(
            dir.path(),
            "privacy",
            "org/privacy-patches",
            ("shared.json", b"privacy wins"),
        );
        let primary = source(
            dir.path(),
            "main",
            "anddea/revanced-patches",
            ("shared.json", b"primary"),
        );

        let merged = r.bundle_for(&[privacy, primary]).unwrap();
        assert_eq!(read_entry(&merged, "shared.json").unwrap(), b"privacy wins");
    }

    #[test]
    fn test_merge_order_primary_then_secondary_then_privacy() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());

        let secondary = source(dir.path(), "s", "x/some-patches", ("k", b"secondary"));
        let primary = source(dir.path(), "p", "anddea/revanced-patches", ("k", b"primary"));

        // With no privacy tier present, secondary still beats primary.
        let merged = r.bundle_for(&[secondary, primary]).unwrap();
        assert_eq!(read_entry(&merged, "k").unwrap(), b"secondary");
    }

    #[test]
    fn test_identical_inputs_hit_cache() {
        let dir = tempdir().unwrap();
        let r = resolver(dir.path());

        let a = source(dir.path(), "a", "x/one-patches", ("a.txt", b"a"));
        let b = source(dir.path(), "b", "y/two-patches", ("b.txt", b"b"));
        let set = vec![a, b];

        let first = r.bundle_for(&set).unwrap();
        let second = r.bundle_for(&set).unwrap();

        assert_eq!(first, second);
        assert_eq!(r.merges_performed(), 1, "second call must be a cache hit");
    }

    #[test]
    fn test_different_tags_get_different_cache_keys() {
        let dir = tempdir().unwrap();
        let a = source(dir.path(), "a", "x/one-patches", ("a.txt", b"a"));
        let mut b = a.clone();
        b.tag = "v2".to_string();

        assert_ne!(
            merge_cache_key(std::slice::from_ref(&a)),
            merge_cache_key(std::slice::from_ref(&b))
        );
    }
}
