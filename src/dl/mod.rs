//! Stock package download sources.
//!
//! Each site is one variant of a closed enum, selected by explicit matching.
//! The engine only relies on the uniform contract: probe a configured URL
//! once (memoized), extract a package id and a version list from the cached
//! response, and download one concrete version. Site adapters are
//! deliberately thin; the sites themselves are external collaborators and
//! their listing formats are reduced to the few fields the contract needs.

use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::io::fetch::{FetchError, Fetcher};

#[derive(Error, Debug)]
pub enum DlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Which download site a URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Archive,
    ApkMirror,
    Uptodown,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::ApkMirror => "apkmirror",
            Self::Uptodown => "uptodown",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A probed listing, cached for the process lifetime by the fetcher.
pub type ProbeResponse = Arc<String>;

/// One configured download source for one app.
#[derive(Debug, Clone)]
pub struct DownloadSource {
    pub kind: SourceKind,
    pub base_url: String,
}

fn archive_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // archive items name files "<package.id>-<version>.apk"
    RE.get_or_init(|| Regex::new(r#"([A-Za-z][\w]*(?:\.[\w]+)+)-(\d+(?:\.\d+)+)\.apk"#).unwrap())
}

fn package_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:appid=|package=|package-name["']?>|data-package=["'])([A-Za-z][\w]*(?:\.[\w]+)+)"#)
            .unwrap()
    })
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r">\s*(\d+(?:\.\d+)+)\s*<").unwrap())
}

impl DownloadSource {
    pub fn new(kind: SourceKind, base_url: &str) -> Self {
        Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the source's listing page, memoized per URL.
    pub async fn probe(&self, fetcher: &Fetcher) -> Result<ProbeResponse, DlError> {
        Ok(fetcher.probe(&self.base_url).await?)
    }

    /// Extract the package id from a probed listing. Empty result means the
    /// orchestrator moves on to the next configured source.
    pub fn package_id(&self, response: &str) -> Option<String> {
        match self.kind {
            SourceKind::Archive => archive_file_re()
                .captures(response)
                .map(|c| c[1].to_string()),
            SourceKind::ApkMirror | SourceKind::Uptodown => package_id_re()
                .captures(response)
                .map(|c| c[1].to_string()),
        }
    }

    /// Every version the probed listing offers, deduplicated, listing order.
    pub fn version_list(&self, response: &str) -> Vec<String> {
        let re = match self.kind {
            SourceKind::Archive => archive_file_re(),
            SourceKind::ApkMirror | SourceKind::Uptodown => version_re(),
        };
        let group = match self.kind {
            SourceKind::Archive => 2,
            _ => 1,
        };

        let mut seen = std::collections::HashSet::new();
        re.captures_iter(response)
            .filter_map(|c| c.get(group).map(|m| m.as_str().to_string()))
            .filter(|v| seen.insert(v.clone()))
            .collect()
    }

    /// URL for one concrete version, by each site's naming convention.
    pub fn version_url(&self, package_id: &str, version: &str, arch: &str, dpi: &str) -> String {
        match self.kind {
            SourceKind::Archive => {
                format!("{}/{}-{}.apk", self.base_url, package_id, version)
            }
            SourceKind::ApkMirror => {
                format!("{}/download/{}/{}/{}", self.base_url, version, arch, dpi)
            }
            SourceKind::Uptodown => format!("{}/download/{}", self.base_url, version),
        }
    }

    /// Download one version to `out`. Retry/backoff belongs to the fetcher;
    /// a failure here surfaces as a build-level skip.
    pub async fn download(
        &self,
        fetcher: &Fetcher,
        package_id: &str,
        version: &str,
        out: &Path,
        arch: &str,
        dpi: &str,
    ) -> Result<(), DlError> {
        let url = self.version_url(package_id, version, arch, dpi);
        tracing::info!(source = %self.kind, %url, "downloading stock package");
        fetcher.download(&url, out).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCHIVE_LISTING: &str = r#"
<a href="com.google.android.youtube-19.09.36.apk">com.google.android.youtube-19.09.36.apk</a>
<a href="com.google.android.youtube-19.05.36.apk">com.google.android.youtube-19.05.36.apk</a>
<a href="com.google.android.youtube-19.09.36.apk">dup</a>
"#;

    const MIRROR_LISTING: &str = r#"
<a href="/uploads/?appid=com.google.android.apps.youtube.music">music</a>
<span>7.03.52</span> <li>7.02.51</li>
<td> 7.03.52 </td>
"#;

    #[test]
    fn test_archive_package_id_and_versions() {
        let src = DownloadSource::new(SourceKind::Archive, "https://archive.org/download/item/");
        assert_eq!(
            src.package_id(ARCHIVE_LISTING).as_deref(),
            Some("com.google.android.youtube")
        );
        let versions = src.version_list(ARCHIVE_LISTING);
        assert_eq!(versions, vec!["19.09.36", "19.05.36"]);
    }

    #[test]
    fn test_apkmirror_package_id() {
        let src = DownloadSource::new(SourceKind::ApkMirror, "https://www.apkmirror.com/apk/x");
        assert_eq!(
            src.package_id(MIRROR_LISTING).as_deref(),
            Some("com.google.android.apps.youtube.music")
        );
    }

    #[test]
    fn test_version_markup_extraction() {
        let src = DownloadSource::new(SourceKind::Uptodown, "https://x.uptodown.com/android");
        let versions = src.version_list("<li>1.2.3</li><b> 1.2.4 </b><i>nope</i>");
        assert_eq!(versions, vec!["1.2.3", "1.2.4"]);
    }

    #[test]
    fn test_version_url_conventions() {
        let archive = DownloadSource::new(SourceKind::Archive, "https://archive.org/dl/item");
        assert_eq!(
            archive.version_url("com.app", "1.0.0", "all", "nodpi"),
            "https://archive.org/dl/item/com.app-1.0.0.apk"
        );

        let uptodown = DownloadSource::new(SourceKind::Uptodown, "https://x.uptodown.com/android/");
        assert_eq!(
            uptodown.version_url("com.app", "1.0.0", "all", "nodpi"),
            "https://x.uptodown.com/android/download/1.0.0"
        );
    }

    #[test]
    fn test_no_package_id_in_empty_listing() {
        let src = DownloadSource::new(SourceKind::ApkMirror, "https://example.com");
        assert_eq!(src.package_id("<html>nothing here</html>"), None);
    }
}
