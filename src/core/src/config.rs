//! Typed configuration snapshot for the sync engine.
//!
//! The YAML schema follows dotted paths (`sync.interval`, `sync.s3.*`,
//! `ecr.region`); every key has a default so a minimal file only needs to
//! list images. The loaded snapshot is immutable for the lifetime of a run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Synchronization settings and job list.
    #[serde(default)]
    pub sync: SyncSection,

    /// AWS ECR credential helper settings.
    #[serde(default)]
    pub ecr: EcrSettings,
}

/// The `sync` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncSection {
    /// Daemon loop period.
    #[serde(default = "default_interval", with = "duration_str")]
    pub interval: Duration,

    /// Retry attempts per operation; also the per-run image error cap.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Credential table matched against registry URLs.
    #[serde(default = "default_registries")]
    pub registries: Vec<RegistryEntry>,

    /// Image synchronization jobs.
    #[serde(default)]
    pub images: Vec<ImageSyncJob>,

    /// Object storage tuning.
    #[serde(default)]
    pub s3: S3Settings,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_errors: default_max_errors(),
            registries: default_registries(),
            images: Vec::new(),
            s3: S3Settings::default(),
        }
    }
}

/// One entry in the credential table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryEntry {
    /// Human-readable name, used only in logs.
    #[serde(default)]
    pub name: String,

    /// Registry URL (`docker.io`, `example.com:5000`) or, for bucket
    /// destinations, the `provider:locator:bucket` triplet.
    pub url: String,

    /// Credentials for this registry.
    #[serde(default)]
    pub auth: AuthEntry,
}

/// Credentials attached to a registry entry. All fields optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthEntry {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub token: String,

    /// Credential helper: `""`, `"ecr"`, or `"ecr-public"`.
    #[serde(default)]
    pub helper: String,
}

/// One image synchronization job, immutable for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageSyncJob {
    /// Source OCI reference without a tag.
    pub source: String,

    /// Ordered destination references (OCI or `provider:locator:bucket:repo`).
    pub targets: Vec<String>,

    /// Explicit tag subset. Literals pass through, `*` entries glob against
    /// the source listing, `@semver` keeps SemVer-parseable tags.
    /// Empty means all source tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Glob-matched tag names that are re-pushed even when present.
    #[serde(default)]
    pub mutable_tags: Vec<String>,

    /// Tag names never pushed.
    #[serde(default)]
    pub ignored_tags: Vec<String>,

    /// Delete destination tags absent from source, then sweep orphan blobs.
    #[serde(default)]
    pub purge: bool,
}

/// The `sync.s3` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct S3Settings {
    /// Bounded concurrency for blob and manifest uploads.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Bounded concurrency for tag purge and the orphan sweep.
    #[serde(default = "default_max_purge_concurrency")]
    pub max_purge_concurrency: usize,

    /// Seen-object cache tuning.
    #[serde(default)]
    pub object_cache: ObjectCacheSettings,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_purge_concurrency: default_max_purge_concurrency(),
            object_cache: ObjectCacheSettings::default(),
        }
    }
}

/// The `sync.s3.objectCache` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectCacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    #[serde(default = "default_cache_expiration", with = "duration_str")]
    pub expiration_time: Duration,
}

impl Default for ObjectCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            expiration_time: default_cache_expiration(),
        }
    }
}

/// The `ecr` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcrSettings {
    /// AWS region used by the `ecr` helper.
    #[serde(default = "default_ecr_region")]
    pub region: String,
}

impl Default for EcrSettings {
    fn default() -> Self {
        Self {
            region: default_ecr_region(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_errors() -> u32 {
    5
}

fn default_registries() -> Vec<RegistryEntry> {
    vec![RegistryEntry {
        name: "Docker Hub".to_string(),
        url: "docker.io".to_string(),
        auth: AuthEntry::default(),
    }]
}

fn default_max_concurrent_uploads() -> usize {
    10
}

fn default_max_purge_concurrency() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_expiration() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_ecr_region() -> String {
    "us-east-1".to_string()
}

impl SyncConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SyncError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: SyncConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the job list: a source is required and every job needs at
    /// least one target.
    pub fn validate(&self) -> Result<()> {
        for (i, job) in self.sync.images.iter().enumerate() {
            if job.source.is_empty() {
                return Err(SyncError::ConfigError(format!(
                    "images[{}]: source must not be empty",
                    i
                )));
            }
            if job.targets.is_empty() {
                return Err(SyncError::ConfigError(format!(
                    "images[{}] ({}): at least one target is required",
                    i, job.source
                )));
            }
        }
        for (i, registry) in self.sync.registries.iter().enumerate() {
            if registry.url.is_empty() {
                return Err(SyncError::ConfigError(format!(
                    "registries[{}]: url must not be empty",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Parse a duration string like `30m`, `90s`, `1h30m`, or `1d`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut matched_any = false;

    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("unexpected '{}' in duration '{}'", c, s));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", s))?;
        digits.clear();

        // "ms" needs a lookahead so "1m" and "1ms" both parse
        let unit_secs = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                total += Duration::from_millis(value);
                matched_any = true;
                continue;
            }
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(format!("unknown duration unit '{}' in '{}'", c, s)),
        };
        total += Duration::from_secs(value * unit_secs);
        matched_any = true;
    }

    if !digits.is_empty() {
        // Bare number means seconds
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", s))?;
        total += Duration::from_secs(value);
        matched_any = true;
    }

    if !matched_any {
        return Err(format!("could not parse duration '{}'", s));
    }
    Ok(total)
}

/// Render a duration in the same compact form the parser accepts.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        let millis = d.subsec_millis();
        return if millis > 0 {
            format!("{}ms", millis)
        } else {
            "0s".to_string()
        };
    }

    let mut out = String::new();
    for (unit, label) in [(24 * 60 * 60, "d"), (60 * 60, "h"), (60, "m"), (1, "s")] {
        if secs >= unit {
            out.push_str(&format!("{}{}", secs / unit, label));
            secs %= unit;
        }
    }
    out
}

/// Serde adapter for duration-string config values.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
