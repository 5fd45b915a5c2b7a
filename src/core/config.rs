//! Declarative build configuration.
//!
//! The config file is one TOML document: root-level scalars set run-wide
//! defaults, the reserved `PatchSources` table names patch/CLI repositories,
//! and every other table describes one application build. Validation errors
//! here are fatal; they mean the operator must fix input, not that a build
//! transiently failed.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use toml::{Table, Value};

use crate::types::{AppName, RepoSpec, Version};

/// Publisher defaults used when a source entry omits its CLI repository.
pub const DEFAULT_CLI_REPO: &str = "revanced/revanced-cli";
pub const DEFAULT_PATCHES_REPO: &str = "revanced/revanced-patches";

/// Reserved table name holding named patch sources.
pub const PATCH_SOURCES_TABLE: &str = "PatchSources";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[{table}] {key}: invalid value '{value}': {reason}")]
    InvalidValue {
        table: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("[{table}]: missing required field '{key}'")]
    MissingField { table: String, key: String },

    #[error("[{table}]: no download source configured")]
    NoDownloadSource { table: String },

    #[error("[{table}] {key}: unbalanced quote in name list")]
    UnbalancedQuote { table: String, key: String },
}

/// How the target package version is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Highest version the patch bundle declares compatibility with.
    Auto,
    /// Highest version the download source offers.
    Latest,
    /// Highest version including pre-release channels.
    Beta,
    /// A literal version string, used verbatim.
    Exact(Version),
}

impl VersionPolicy {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "auto" => Self::Auto,
            "latest" => Self::Latest,
            "beta" => Self::Beta,
            other => Self::Exact(Version::new(other)),
        }
    }
}

impl std::fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Latest => write!(f, "latest"),
            Self::Beta => write!(f, "beta"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Which native-library ABI variants the build targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchSelector {
    /// Keep every ABI in one artifact.
    All,
    /// Build two artifacts, one per ABI.
    Both,
    Arm64,
    Arm32,
}

impl ArchSelector {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "all" => Some(Self::All),
            "both" => Some(Self::Both),
            "arm64-v8a" => Some(Self::Arm64),
            "arm-v7a" => Some(Self::Arm32),
            _ => None,
        }
    }

    /// The concrete ABIs this selector schedules, one job each.
    pub fn jobs(&self) -> Vec<TargetArch> {
        match self {
            Self::All => vec![TargetArch::All],
            Self::Both => vec![TargetArch::Arm64, TargetArch::Arm32],
            Self::Arm64 => vec![TargetArch::Arm64],
            Self::Arm32 => vec![TargetArch::Arm32],
        }
    }
}

/// A single job's concrete ABI target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    All,
    Arm64,
    Arm32,
}

impl TargetArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Arm64 => "arm64-v8a",
            Self::Arm32 => "arm-v7a",
        }
    }

    /// Native-library directory name for this target, when it names a
    /// single ABI.
    pub fn abi(&self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Arm64 => Some("arm64-v8a"),
            Self::Arm32 => Some("armeabi-v7a"),
        }
    }
}

impl std::fmt::Display for TargetArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named entry under `[PatchSources]`.
#[derive(Debug, Clone)]
pub struct PatchSourceEntry {
    pub key: String,
    pub patches: RepoSpec,
    pub cli: RepoSpec,
}

/// Post-patch shrink/repackage settings.
#[derive(Debug, Clone)]
pub struct OptimizeSpec {
    pub enabled: bool,
    /// Language suffixes to keep; empty list keeps everything.
    pub keep_languages: Vec<String>,
    /// Density buckets to keep; empty list keeps everything.
    pub keep_densities: Vec<String>,
    pub align: bool,
    /// Deflate level passed to the repacker, 0..=9.
    pub compression_level: u32,
}

impl Default for OptimizeSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            keep_languages: Vec::new(),
            keep_densities: Vec::new(),
            align: true,
            compression_level: 9,
        }
    }
}

/// Everything one application build needs, read once per config table and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct AppBuildSpec {
    pub name: AppName,
    pub display_name: String,
    pub brand: String,
    pub version: VersionPolicy,
    pub arch: ArchSelector,
    pub dpi: String,
    pub included_patches: Vec<String>,
    pub excluded_patches: Vec<String>,
    pub exclusive_patches: bool,
    pub patcher_args: Vec<String>,
    pub archive_url: String,
    pub apkmirror_url: String,
    pub uptodown_url: String,
    pub enabled: bool,
    pub optimize: OptimizeSpec,
    /// Logical keys into `[PatchSources]`; empty means the run default.
    pub patch_sources: Vec<String>,
    pub cache_apk: bool,
    pub riplib: bool,
    pub expected_signature: Option<String>,
}

impl AppBuildSpec {
    /// Download source URLs that are actually configured, in the fixed
    /// preference order archive, apkmirror, uptodown.
    pub fn configured_sources(&self) -> Vec<(crate::dl::SourceKind, &str)> {
        use crate::dl::SourceKind;
        let mut out = Vec::new();
        if !self.archive_url.is_empty() {
            out.push((SourceKind::Archive, self.archive_url.as_str()));
        }
        if !self.apkmirror_url.is_empty() {
            out.push((SourceKind::ApkMirror, self.apkmirror_url.as_str()));
        }
        if !self.uptodown_url.is_empty() {
            out.push((SourceKind::Uptodown, self.uptodown_url.as_str()));
        }
        out
    }
}

/// The whole parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub parallel_jobs: usize,
    pub brand: String,
    pub patch_sources: BTreeMap<String, PatchSourceEntry>,
    /// Source used when an app names no `patch-sources` list.
    pub default_source: PatchSourceEntry,
    pub apps: Vec<AppBuildSpec>,
}

impl Config {
    /// Load and validate a config file. Any error here aborts the run.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let root: Table = text.parse()?;

        let parallel_jobs = match root.get("parallel-jobs").and_then(Value::as_integer) {
            Some(n) if n >= 1 => n as usize,
            Some(_) | None => num_cpus::get(),
        };
        let brand = str_key(&root, "rv-brand").unwrap_or("ReVanced").to_string();
        let compression_level = int_key(&root, "compression-level").unwrap_or(9);

        let default_source = PatchSourceEntry {
            key: "default".to_string(),
            patches: RepoSpec::new(
                str_key(&root, "patches-source").unwrap_or(DEFAULT_PATCHES_REPO),
                str_key(&root, "patches-version").unwrap_or("latest"),
            ),
            cli: RepoSpec::new(
                str_key(&root, "cli-source").unwrap_or(DEFAULT_CLI_REPO),
                str_key(&root, "cli-version").unwrap_or("latest"),
            ),
        };

        let mut patch_sources = BTreeMap::new();
        if let Some(Value::Table(sources)) = root.get(PATCH_SOURCES_TABLE) {
            for (key, val) in sources {
                let table = val.as_table().ok_or_else(|| ConfigError::InvalidValue {
                    table: PATCH_SOURCES_TABLE.to_string(),
                    key: key.clone(),
                    value: val.to_string(),
                    reason: "expected a table".to_string(),
                })?;
                patch_sources.insert(key.clone(), parse_source_entry(key, table)?);
            }
        }

        let mut apps = Vec::new();
        for (name, val) in &root {
            if name == PATCH_SOURCES_TABLE {
                continue;
            }
            let Value::Table(table) = val else { continue };
            apps.push(parse_app(name, table, &brand, compression_level)?);
        }

        Ok(Self {
            parallel_jobs,
            brand,
            patch_sources,
            default_source,
            apps,
        })
    }

    /// Apps with their enable flag set.
    pub fn enabled_apps(&self) -> impl Iterator<Item = &AppBuildSpec> {
        self.apps.iter().filter(|a| a.enabled)
    }
}

fn parse_source_entry(key: &str, table: &Table) -> Result<PatchSourceEntry, ConfigError> {
    let source = str_key(table, "source").ok_or_else(|| ConfigError::MissingField {
        table: format!("{PATCH_SOURCES_TABLE}.{key}"),
        key: "source".to_string(),
    })?;

    Ok(PatchSourceEntry {
        key: key.to_string(),
        patches: RepoSpec::new(source, str_key(table, "version").unwrap_or("latest")),
        cli: RepoSpec::new(
            str_key(table, "cli-source").unwrap_or(DEFAULT_CLI_REPO),
            str_key(table, "cli-version").unwrap_or("latest"),
        ),
    })
}

fn parse_app(
    name: &str,
    table: &Table,
    brand: &str,
    default_compression: i64,
) -> Result<AppBuildSpec, ConfigError> {
    let version_raw = str_key(table, "version").unwrap_or("auto");
    let version = VersionPolicy::parse(version_raw);

    let arch_raw = str_key(table, "arch").unwrap_or("all");
    let arch = ArchSelector::parse(arch_raw).ok_or_else(|| ConfigError::InvalidValue {
        table: name.to_string(),
        key: "arch".to_string(),
        value: arch_raw.to_string(),
        reason: "expected one of: all, both, arm64-v8a, arm-v7a".to_string(),
    })?;

    let archive_url = str_key(table, "archive-dlurl").unwrap_or("").to_string();
    let apkmirror_url = str_key(table, "apkmirror-dlurl").unwrap_or("").to_string();
    let uptodown_url = str_key(table, "uptodown-dlurl").unwrap_or("").to_string();
    let enabled = bool_key(table, "enabled").unwrap_or(false);

    if enabled && archive_url.is_empty() && apkmirror_url.is_empty() && uptodown_url.is_empty() {
        return Err(ConfigError::NoDownloadSource {
            table: name.to_string(),
        });
    }

    let compression_level = int_key(table, "compression-level").unwrap_or(default_compression);
    if !(0..=9).contains(&compression_level) {
        return Err(ConfigError::InvalidValue {
            table: name.to_string(),
            key: "compression-level".to_string(),
            value: compression_level.to_string(),
            reason: "expected 0..=9".to_string(),
        });
    }

    let optimize = OptimizeSpec {
        enabled: bool_key(table, "optimize").unwrap_or(false),
        keep_languages: name_list(table, name, "keep-languages")?,
        keep_densities: name_list(table, name, "keep-densities")?,
        align: bool_key(table, "align").unwrap_or(true),
        compression_level: compression_level as u32,
    };

    Ok(AppBuildSpec {
        name: AppName::new(name),
        display_name: str_key(table, "app-name").unwrap_or(name).to_string(),
        brand: brand.to_string(),
        version,
        arch,
        dpi: str_key(table, "dpi").unwrap_or("nodpi").to_string(),
        included_patches: name_list(table, name, "included-patches")?,
        excluded_patches: name_list(table, name, "excluded-patches")?,
        exclusive_patches: bool_key(table, "exclusive-patches").unwrap_or(false),
        patcher_args: name_list(table, name, "patcher-args")?,
        archive_url,
        apkmirror_url,
        uptodown_url,
        enabled,
        optimize,
        patch_sources: name_list(table, name, "patch-sources")?,
        cache_apk: bool_key(table, "cache-apk").unwrap_or(true),
        riplib: bool_key(table, "riplib").unwrap_or(false),
        expected_signature: str_key(table, "expected-signature").map(str::to_string),
    })
}

fn str_key<'a>(table: &'a Table, key: &str) -> Option<&'a str> {
    table.get(key).and_then(Value::as_str)
}

fn bool_key(table: &Table, key: &str) -> Option<bool> {
    table.get(key).and_then(Value::as_bool)
}

fn int_key(table: &Table, key: &str) -> Option<i64> {
    table.get(key).and_then(Value::as_integer)
}

/// A name list is either a TOML array of strings or one string with
/// shell-style quoting (`"'patch one' other"`).
fn name_list(table: &Table, table_name: &str, key: &str) -> Result<Vec<String>, ConfigError> {
    match table.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()),
        Some(Value::String(s)) => {
            split_quoted(s).ok_or_else(|| ConfigError::UnbalancedQuote {
                table: table_name.to_string(),
                key: key.to_string(),
            })
        }
        Some(other) => Err(ConfigError::InvalidValue {
            table: table_name.to_string(),
            key: key.to_string(),
            value: other.to_string(),
            reason: "expected a string or array of strings".to_string(),
        }),
    }
}

/// Split a string on whitespace while honoring single/double quotes.
/// Returns None when a quote is left open.
pub fn split_quoted(s: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if quote.is_some() {
        return None;
    }
    if !current.is_empty() {
        out.push(current);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
parallel-jobs = 2
rv-brand = "ReVanced"
patches-source = "revanced/revanced-patches"

[PatchSources.extended]
source = "anddea/revanced-patches"
version = "latest"

[PatchSources.privacy]
source = "someone/privacy-patches"

[YouTube]
app-name = "YouTube"
enabled = true
version = "auto"
arch = "both"
apkmirror-dlurl = "https://www.apkmirror.com/apk/google-inc/youtube/"
excluded-patches = "'Custom branding' debugging"

[Music]
enabled = false
arch = "arm64-v8a"
uptodown-dlurl = "https://music.en.uptodown.com/android"
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.parallel_jobs, 2);
        assert_eq!(cfg.apps.len(), 2);
        assert_eq!(cfg.patch_sources.len(), 2);
        assert_eq!(cfg.enabled_apps().count(), 1);

        let yt = cfg.apps.iter().find(|a| a.name == AppName::new("YouTube")).unwrap();
        assert_eq!(yt.version, VersionPolicy::Auto);
        assert_eq!(yt.arch, ArchSelector::Both);
        assert_eq!(
            yt.excluded_patches,
            vec!["Custom branding".to_string(), "debugging".to_string()]
        );
    }

    #[test]
    fn test_source_entry_cli_default() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let privacy = &cfg.patch_sources["privacy"];
        assert_eq!(privacy.cli.path, DEFAULT_CLI_REPO);
        assert!(privacy.cli.wants_latest());
    }

    #[test]
    fn test_missing_source_field_is_fatal() {
        let text = "[PatchSources.broken]\nversion = \"latest\"\n";
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_invalid_arch_is_fatal() {
        let text = "[App]\nenabled = true\narch = \"mips\"\napkmirror-dlurl = \"x\"\n";
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_enabled_app_without_source_is_fatal() {
        let text = "[App]\nenabled = true\n";
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::NoDownloadSource { .. }));
    }

    #[test]
    fn test_unbalanced_quote_is_fatal() {
        let text = "[App]\nenabled = true\napkmirror-dlurl = \"x\"\nexcluded-patches = \"'oops\"\n";
        let err = Config::parse(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnbalancedQuote { .. }));
    }

    #[test]
    fn test_split_quoted() {
        assert_eq!(
            split_quoted("'a b' c \"d e\"").unwrap(),
            vec!["a b", "c", "d e"]
        );
        assert_eq!(split_quoted("").unwrap(), Vec::<String>::new());
        assert!(split_quoted("'open").is_none());
    }

    #[test]
    fn test_arch_jobs() {
        assert_eq!(ArchSelector::Both.jobs().len(), 2);
        assert_eq!(ArchSelector::All.jobs(), vec![TargetArch::All]);
    }

    #[test]
    fn test_version_policy_forms() {
        assert_eq!(VersionPolicy::parse("auto"), VersionPolicy::Auto);
        assert_eq!(VersionPolicy::parse("latest"), VersionPolicy::Latest);
        assert_eq!(VersionPolicy::parse("beta"), VersionPolicy::Beta);
        assert_eq!(
            VersionPolicy::parse("19.09.36"),
            VersionPolicy::Exact(Version::new("19.09.36"))
        );
    }
}
