//! Target version selection.
//!
//! Versions are compared by natural dot-numeric ordering, never
//! lexicographically: `1.10.0` beats `1.9.9`.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::core::config::VersionPolicy;
use crate::types::Version;

#[derive(Error, Debug)]
pub enum VersionError {
    /// Soft failure: the caller skips the app build, the run continues.
    #[error("no version resolved for {package_id}")]
    NoVersionResolved { package_id: String },
}

/// Compare two version strings segment-wise: numeric segments compare as
/// integers, anything else falls back to string comparison, and a missing
/// segment counts as zero.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-']);
    let mut right = b.split(['.', '-']);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Highest version by natural ordering.
pub fn highest<'a, I: IntoIterator<Item = &'a str>>(versions: I) -> Option<Version> {
    versions
        .into_iter()
        .filter(|v| !v.is_empty())
        .max_by(|a, b| natural_cmp(a, b))
        .map(Version::new)
}

fn version_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+(?:\.\d+)+(?:[.-][0-9A-Za-z]+)*)\s*(?:\(.*\))?\s*$").unwrap())
}

/// Highest version the patch listing declares compatibility with for
/// `package_id`.
///
/// The patcher's `list-patches` output groups compatible versions under the
/// package they apply to; only the blocks mentioning `package_id` count.
pub fn compatible_from_listing(listing: &str, package_id: &str) -> Option<Version> {
    let mut in_block = false;
    let mut candidates: Vec<&str> = Vec::new();

    for line in listing.lines() {
        let trimmed = line.trim();
        if trimmed.contains(package_id) {
            in_block = true;
            continue;
        }
        // A new package block closes the current one.
        if trimmed.starts_with("Package name:") || trimmed.starts_with("Compatible package:") {
            in_block = false;
            continue;
        }
        if !in_block {
            continue;
        }
        if let Some(caps) = version_line_re().captures(line) {
            if let Some(m) = caps.get(1) {
                candidates.push(m.as_str());
            }
        }
    }

    highest(candidates)
}

/// Pick the concrete target version for one build.
///
/// `available` is the chosen download source's version list; it backs the
/// `latest`/`beta` policies and the `auto` fallback. An exact policy is used
/// verbatim with no lookup.
pub fn resolve_version(
    policy: &VersionPolicy,
    package_id: &str,
    patch_listing: &str,
    available: &[String],
) -> Result<Version, VersionError> {
    let picked = match policy {
        VersionPolicy::Auto => compatible_from_listing(patch_listing, package_id)
            .or_else(|| highest(available.iter().map(String::as_str))),
        VersionPolicy::Latest | VersionPolicy::Beta => {
            highest(available.iter().map(String::as_str))
        }
        VersionPolicy::Exact(v) => Some(v.clone()),
    };

    picked.ok_or_else(|| VersionError::NoVersionResolved {
        package_id: package_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_ordering_not_lexicographic() {
        assert_eq!(natural_cmp("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(natural_cmp("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(natural_cmp("2.0", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_latest_picks_natural_max() {
        let available = vec![
            "1.2.0".to_string(),
            "1.10.0".to_string(),
            "1.9.9".to_string(),
        ];
        let v = resolve_version(
            &VersionPolicy::Latest,
            "com.example.app",
            "",
            &available,
        )
        .unwrap();
        assert_eq!(v, "1.10.0");
    }

    #[test]
    fn test_auto_from_patch_listing() {
        let listing = "\
Name: Some patch
Compatible packages:
	Package name: com.google.android.youtube
	Compatible versions:
		19.05.36
		19.09.36
Name: Other patch
Compatible packages:
	Package name: com.other.app
	Compatible versions:
		99.0.0
";
        let v = resolve_version(
            &VersionPolicy::Auto,
            "com.google.android.youtube",
            listing,
            &[],
        )
        .unwrap();
        assert_eq!(v, "19.09.36");
    }

    #[test]
    fn test_auto_falls_back_to_latest() {
        let available = vec!["2.0.1".to_string(), "2.1.0".to_string()];
        let v = resolve_version(&VersionPolicy::Auto, "com.example", "no versions here", &available)
            .unwrap();
        assert_eq!(v, "2.1.0");
    }

    #[test]
    fn test_exact_needs_no_lookup() {
        let v = resolve_version(
            &VersionPolicy::Exact("18.19.35".into()),
            "com.example",
            "",
            &[],
        )
        .unwrap();
        assert_eq!(v, "18.19.35");
    }

    #[test]
    fn test_no_version_resolved_is_error() {
        let err = resolve_version(&VersionPolicy::Latest, "com.example", "", &[]).unwrap_err();
        assert!(matches!(err, VersionError::NoVersionResolved { .. }));
    }
}
