use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::lock::LockPolicy;
use crate::logging::LogFormat;

fn default_max_capacity() -> usize {
    1024
}

fn default_enabled() -> bool {
    true
}

fn default_lock_stall_check_secs() -> u64 {
    1
}

fn default_lock_abandon_secs() -> u64 {
    60
}

fn default_write_preferring() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Runtime configuration for the cache layer.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Root directory of the on-disk cache tree.
    pub root: PathBuf,
    /// Entry count above which the index evicts least-recently-used groups.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    /// Evict even groups that are currently locked.
    #[serde(default)]
    pub aggressive: bool,
    /// When false, every request bypasses the cache entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Serve stored responses without revalidation, tolerating staleness.
    #[serde(default)]
    pub disconnected: bool,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// How long a blocked lock waiter sleeps before scanning for abandoned
    /// grants.
    #[serde(default = "default_lock_stall_check_secs")]
    pub lock_stall_check_secs: u64,
    /// Age past which a held lock is presumed abandoned and force-released.
    #[serde(default = "default_lock_abandon_secs")]
    pub lock_abandon_secs: u64,
    /// Write-preferring lock admission (new readers queue behind a pending
    /// writer).
    #[serde(default = "default_write_preferring")]
    pub write_preferring: bool,
}

impl CacheSettings {
    /// Load from a TOML file with `CACHET__`-prefixed environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("CACHET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let settings: CacheSettings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults over a given cache root; the usual entry point for embedding.
    pub fn for_root(root: PathBuf) -> Self {
        Self {
            root,
            max_capacity: default_max_capacity(),
            aggressive: false,
            enabled: true,
            disconnected: false,
            log: default_log_format(),
            lock_stall_check_secs: default_lock_stall_check_secs(),
            lock_abandon_secs: default_lock_abandon_secs(),
            write_preferring: default_write_preferring(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_capacity > 0, "max_capacity must be greater than zero");
        ensure!(
            self.lock_stall_check_secs > 0,
            "lock_stall_check_secs must be greater than zero"
        );
        ensure!(
            self.lock_abandon_secs >= self.lock_stall_check_secs,
            "lock_abandon_secs must not be shorter than lock_stall_check_secs"
        );
        Ok(())
    }

    pub fn stall_check(&self) -> Duration {
        Duration::from_secs(self.lock_stall_check_secs)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.lock_abandon_secs)
    }

    pub fn lock_policy(&self) -> LockPolicy {
        if self.write_preferring {
            LockPolicy::WritePreferring
        } else {
            LockPolicy::ReadPreferring
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}
