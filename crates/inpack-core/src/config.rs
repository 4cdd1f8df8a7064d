//! Build and deploy configuration.
//!
//! Values start at their defaults, are overridden from the environment
//! (`INPACK_*`), and finally from CLI flags by the binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use inpack_schema::CodecId;

use crate::codec::{CodecRegistry, GzipCodec, ZstdCodec};
use crate::unpack::MissingSourcePolicy;

/// Codec used when neither the artifact nor the catalog names one.
pub const ENV_DEFAULT_CODEC: &str = "INPACK_DEFAULT_CODEC";
/// zstd encoder level.
pub const ENV_ZSTD_LEVEL: &str = "INPACK_ZSTD_LEVEL";
/// Unpack worker count.
pub const ENV_WORKERS: &str = "INPACK_WORKERS";
/// How long commit waits for a locked target.
pub const ENV_COMMIT_TIMEOUT_SECS: &str = "INPACK_COMMIT_TIMEOUT_SECS";

/// Archive build settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Codec for artifacts without an explicit one.
    pub default_codec: CodecId,
    /// zstd level (1-22).
    pub zstd_level: i32,
    /// gzip level (0-9).
    pub gzip_level: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            default_codec: CodecId::default(),
            zstd_level: ZstdCodec::DEFAULT_LEVEL,
            gzip_level: GzipCodec::DEFAULT_LEVEL,
        }
    }
}

impl BuildConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `lookup`. Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(codec) = lookup(ENV_DEFAULT_CODEC).filter(|s| !s.is_empty()) {
            config.default_codec = CodecId::new(codec);
        }
        if let Some(level) = parse_var(&lookup, ENV_ZSTD_LEVEL) {
            config.zstd_level = level;
        }
        config
    }

    /// Codec registry configured with this build's encoder levels.
    pub fn registry(&self) -> CodecRegistry {
        CodecRegistry::with_levels(self.zstd_level, self.gzip_level)
    }
}

/// Deploy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    /// Parallel unpack workers (at least 1).
    pub workers: usize,
    /// Maximum wait for a locked target during commit.
    pub commit_timeout: Duration,
    /// Interval between lock checks during commit.
    pub lock_poll_interval: Duration,
    /// Defer a write to the commit phase when the target is unavailable
    /// instead of aborting the deploy.
    pub retry_unavailable: bool,
    /// Extra target template variables.
    pub variables: BTreeMap<String, String>,
    /// Source tree for loose entries; defaults to the archive's directory.
    pub loose_source: Option<PathBuf>,
    /// Answer given when a loose source file is missing.
    pub missing_loose_policy: MissingSourcePolicy,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            commit_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(100),
            retry_unavailable: true,
            variables: BTreeMap::new(),
            loose_source: None,
            missing_loose_policy: MissingSourcePolicy::Abort,
        }
    }
}

impl DeployConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through `lookup`. Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(workers) = parse_var::<usize>(&lookup, ENV_WORKERS) {
            config.workers = workers.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_COMMIT_TIMEOUT_SECS) {
            config.commit_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
