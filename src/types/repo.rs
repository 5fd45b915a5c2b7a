/// An upstream repository reference with a requested version.
///
/// Written in configuration as `owner/repo` plus a version that is either a
/// release tag or the literal `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoSpec {
    pub path: String,
    pub version: String,
}

impl RepoSpec {
    pub fn new(path: &str, version: &str) -> Self {
        Self {
            path: path.trim().trim_matches('/').to_string(),
            version: version.trim().to_string(),
        }
    }

    /// Repository owner segment, if the path is well-formed.
    pub fn owner(&self) -> Option<&str> {
        self.path.split('/').next().filter(|s| !s.is_empty())
    }

    /// Repository name segment, if the path is well-formed.
    pub fn name(&self) -> Option<&str> {
        self.path.split('/').nth(1).filter(|s| !s.is_empty())
    }

    pub fn wants_latest(&self) -> bool {
        self.version.is_empty() || self.version == "latest"
    }

    /// Deterministic cache file stem for artifacts fetched from this repo.
    pub fn cache_stem(&self) -> String {
        let path = self.path.replace('/', "-");
        if self.wants_latest() {
            path
        } else {
            format!("{}-{}", path, self.version)
        }
    }
}

impl std::fmt::Display for RepoSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}
