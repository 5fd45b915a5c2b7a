//! Remote artifact retrieval.
//!
//! One shared [`Fetcher`] owns the HTTP client, the prebuilts cache directory
//! and the per-URL probe memo. All network calls go through the bounded
//! retry/backoff policy; all file writes are write-to-temp-then-rename so a
//! concurrent reader never observes a partial artifact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, header};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::types::RepoSpec;

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Unique temp-file suffix: concurrent writers of the same cache key must
/// never share a partial file, even within one process.
pub(crate) fn tmp_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "tmp-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Environment variable holding the remote-API auth token.
pub const TOKEN_ENV: &str = "APKFORGE_GH_TOKEN";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{url}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("{repo}: release has no matching {kind} asset")]
    NoAsset { repo: String, kind: &'static str },

    #[error("{url}: unexpected status {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// A cached prebuilt artifact and the release tag it came from.
#[derive(Debug, Clone)]
pub struct Prebuilt {
    pub path: PathBuf,
    pub tag: String,
}

/// Which prebuilt artifact a release asset is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrebuiltKind {
    Cli,
    Patches,
}

impl PrebuiltKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Patches => "patches",
        }
    }

    /// Select the matching asset from a release.
    fn pick<'a>(&self, assets: &'a [ReleaseAsset]) -> Option<&'a ReleaseAsset> {
        match self {
            // The patcher CLI ships as an -all.jar fat jar.
            Self::Cli => assets
                .iter()
                .find(|a| a.name.ends_with("-all.jar"))
                .or_else(|| assets.iter().find(|a| a.name.ends_with(".jar"))),
            // Patch bundles ship as .rvp since cli v5, .jar before that.
            Self::Patches => assets
                .iter()
                .find(|a| a.name.ends_with(".rvp"))
                .or_else(|| {
                    assets
                        .iter()
                        .find(|a| a.name.contains("patches") && a.name.ends_with(".jar"))
                }),
        }
    }
}

/// Shared artifact fetcher. Cheap to clone.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    api_base: String,
    prebuilts_dir: PathBuf,
    probe_memo: Arc<Mutex<HashMap<String, Arc<String>>>>,
}

impl Fetcher {
    /// Build a fetcher. A missing auth token degrades to anonymous rate
    /// limits and is logged, never fatal.
    pub fn new(prebuilts_dir: PathBuf) -> Result<Self, FetchError> {
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            tracing::warn!("{TOKEN_ENV} not set, using anonymous API rate limits");
        }
        Self::with_options(prebuilts_dir, "https://api.github.com".to_string(), token)
    }

    pub fn with_options(
        prebuilts_dir: PathBuf,
        api_base: String,
        token: Option<String>,
    ) -> Result<Self, FetchError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(crate::USER_AGENT),
        );
        if let Some(t) = token {
            if let Ok(value) = header::HeaderValue::from_str(&format!("Bearer {t}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_base,
            prebuilts_dir,
            probe_memo: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// GET a URL as text, retrying transient failures with exponential
    /// backoff (1s, 2s). 4xx responses are not retried.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut last = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if status.is_client_error() {
                        return Err(FetchError::Status {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    last = format!("status {status}");
                }
                Err(e) => last = e.to_string(),
            }

            if attempt < MAX_ATTEMPTS {
                let delay = Duration::from_secs(1 << (attempt - 1));
                tracing::debug!(url, attempt, "fetch failed ({last}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: MAX_ATTEMPTS,
            last,
        })
    }

    /// Memoized [`Self::get_text`]: each URL is fetched at most once per
    /// process lifetime.
    pub async fn probe(&self, url: &str) -> Result<Arc<String>, FetchError> {
        {
            let memo = self.probe_memo.lock().await;
            if let Some(cached) = memo.get(url) {
                return Ok(cached.clone());
            }
        }

        let text = Arc::new(self.get_text(url).await?);
        self.probe_memo
            .lock()
            .await
            .insert(url.to_string(), text.clone());
        Ok(text)
    }

    /// Stream a URL to `dest` atomically. The temp file lives next to the
    /// destination so the final rename never crosses filesystems.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dest.with_extension(tmp_suffix());

        let mut last = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_download(url, &tmp).await {
                Ok(()) => {
                    tokio::fs::rename(&tmp, dest).await?;
                    return Ok(());
                }
                Err(FetchError::Status { url, status }) if (400..500).contains(&status) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(FetchError::Status { url, status });
                }
                Err(e) => last = e.to_string(),
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
        }

        let _ = tokio::fs::remove_file(&tmp).await;
        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: MAX_ATTEMPTS,
            last,
        })
    }

    async fn try_download(&self, url: &str, tmp: &Path) -> Result<(), FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(tmp).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Fetch release metadata for a repository at `latest` or an exact tag.
    pub async fn release_for(&self, repo: &RepoSpec) -> Result<Release, FetchError> {
        let url = if repo.wants_latest() {
            format!("{}/repos/{}/releases/latest", self.api_base, repo.path)
        } else {
            format!(
                "{}/repos/{}/releases/tags/{}",
                self.api_base, repo.path, repo.version
            )
        };
        let text = self.get_text(&url).await?;
        serde_json::from_str(&text).map_err(|e| {
            FetchError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Download one prebuilt (CLI jar or patch bundle) into the prebuilts
    /// cache, keyed by (repository, resolved tag). Returns the cached path
    /// immediately when the artifact is already present.
    pub async fn fetch_prebuilt(
        &self,
        repo: &RepoSpec,
        kind: PrebuiltKind,
    ) -> Result<Prebuilt, FetchError> {
        let release = self.release_for(repo).await?;
        let asset = kind.pick(&release.assets).ok_or_else(|| FetchError::NoAsset {
            repo: repo.path.clone(),
            kind: kind.as_str(),
        })?;

        let dest = self.prebuilts_dir.join(format!(
            "{}-{}-{}",
            repo.path.replace('/', "-"),
            release.tag_name,
            asset.name
        ));
        if dest.exists() {
            tracing::debug!(path = %dest.display(), "prebuilt cache hit");
            return Ok(Prebuilt {
                path: dest,
                tag: release.tag_name,
            });
        }

        tracing::info!(repo = %repo.path, tag = %release.tag_name, asset = %asset.name, "fetching prebuilt");
        self.download(&asset.browser_download_url, &dest).await?;
        Ok(Prebuilt {
            path: dest,
            tag: release.tag_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_errors_retry_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/flaky")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let fetcher =
            Fetcher::with_options(std::env::temp_dir(), server.url(), None).unwrap();
        let err = fetcher
            .get_text(&format!("{}/flaky", server.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/gone")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let fetcher =
            Fetcher::with_options(std::env::temp_dir(), server.url(), None).unwrap();
        let err = fetcher
            .get_text(&format!("{}/gone", server.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_is_memoized() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("body")
            .expect(1)
            .create_async()
            .await;

        let fetcher =
            Fetcher::with_options(std::env::temp_dir(), server.url(), None).unwrap();
        let url = format!("{}/page", server.url());

        let first = fetcher.probe(&url).await.unwrap();
        let second = fetcher.probe(&url).await.unwrap();
        assert_eq!(*first, *second);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/blob")
            .with_status(200)
            .with_body(vec![7u8; 1024])
            .create_async()
            .await;

        let fetcher =
            Fetcher::with_options(dir.path().to_path_buf(), server.url(), None).unwrap();
        let dest = dir.path().join("blob.bin");
        fetcher
            .download(&format!("{}/blob", server.url()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap().len(), 1024);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "no temp files may remain");
    }

    #[tokio::test]
    async fn test_fetch_prebuilt_caches_by_repo_and_tag() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;

        let release_body = serde_json::json!({
            "tag_name": "v4.2.0",
            "assets": [
                {"name": "revanced-cli-4.2.0-all.jar",
                 "browser_download_url": format!("{}/dl/cli.jar", server.url())}
            ]
        });
        let _release = server
            .mock("GET", "/repos/revanced/revanced-cli/releases/latest")
            .with_status(200)
            .with_body(release_body.to_string())
            .create_async()
            .await;
        let dl = server
            .mock("GET", "/dl/cli.jar")
            .with_status(200)
            .with_body("jar bytes")
            .expect(1)
            .create_async()
            .await;

        let fetcher =
            Fetcher::with_options(dir.path().to_path_buf(), server.url(), None).unwrap();
        let repo = RepoSpec::new("revanced/revanced-cli", "latest");

        let first = fetcher.fetch_prebuilt(&repo, PrebuiltKind::Cli).await.unwrap();
        let second = fetcher.fetch_prebuilt(&repo, PrebuiltKind::Cli).await.unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(first.tag, "v4.2.0");
        dl.assert_async().await; // downloaded exactly once
    }
}
