//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Longest accepted timeout or retention, in seconds (100 years).
///
/// Timestamps are added to these durations, and `OffsetDateTime` cannot
/// represent dates past year 9999.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn check_duration(field: &str, secs: u64) -> Result<(), String> {
    if secs > MAX_DURATION_SECS {
        return Err(format!(
            "{field} {secs} exceeds maximum value {MAX_DURATION_SECS}"
        ));
    }
    Ok(())
}

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum size of a single chunk in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Ceiling on the sum of accepted chunk sizes for one upload.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Maximum number of chunks an upload may declare.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,
    /// Seconds without a new chunk after which an open upload expires.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_upload_size() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_SIZE
}

fn default_max_total_chunks() -> u32 {
    crate::DEFAULT_MAX_TOTAL_CHUNKS
}

fn default_upload_timeout_secs() -> u64 {
    86400 // 24 hours
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_chunk_size: default_max_chunk_size(),
            max_upload_size: default_max_upload_size(),
            max_total_chunks: default_max_total_chunks(),
            upload_timeout_secs: default_upload_timeout_secs(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Get the upload timeout as a Duration.
    pub fn upload_timeout(&self) -> Duration {
        Duration::seconds(self.upload_timeout_secs.min(MAX_DURATION_SECS) as i64)
    }

    /// Validate size limits and timeouts.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size == 0 {
            return Err("server.max_chunk_size must be greater than 0".to_string());
        }
        if self.max_upload_size == 0 {
            return Err("server.max_upload_size must be greater than 0".to_string());
        }
        if self.max_chunk_size > self.max_upload_size {
            return Err(format!(
                "server.max_chunk_size {} exceeds server.max_upload_size {}",
                self.max_chunk_size, self.max_upload_size
            ));
        }
        // Chunk bodies are buffered in memory and sized as usize.
        if usize::try_from(self.max_chunk_size).is_err() {
            return Err(format!(
                "server.max_chunk_size {} exceeds platform address space",
                self.max_chunk_size
            ));
        }
        if self.max_total_chunks == 0 {
            return Err("server.max_total_chunks must be greater than 0".to_string());
        }
        if self.upload_timeout_secs == 0 {
            return Err("server.upload_timeout_secs must be greater than 0".to_string());
        }
        check_duration("server.upload_timeout_secs", self.upload_timeout_secs)
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path cannot be empty".to_string())
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Run the periodic sweep (default: true).
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,
    /// Interval in seconds between sweeps.
    #[serde(default = "default_gc_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seconds an expired or failed session is kept before its chunks are deleted.
    #[serde(default = "default_gc_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Seconds a complete session record is kept for idempotent finalize.
    /// The artifact itself is never removed by the sweep.
    #[serde(default = "default_gc_complete_retention_secs")]
    pub complete_retention_secs: u64,
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_sweep_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_gc_grace_period_secs() -> u64 {
    3600 // 1 hour
}

fn default_gc_complete_retention_secs() -> u64 {
    86400 // 24 hours
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            sweep_interval_secs: default_gc_sweep_interval_secs(),
            grace_period_secs: default_gc_grace_period_secs(),
            complete_retention_secs: default_gc_complete_retention_secs(),
        }
    }
}

impl GcConfig {
    /// Get the grace period as a Duration.
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.grace_period_secs.min(MAX_DURATION_SECS) as i64)
    }

    /// Get the complete-session retention as a Duration.
    pub fn complete_retention(&self) -> Duration {
        Duration::seconds(self.complete_retention_secs.min(MAX_DURATION_SECS) as i64)
    }

    /// Get the sweep interval as a std::time::Duration.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate GC configuration for dangerous settings.
    pub fn validate(&self) -> Result<(), String> {
        // A zero period would make tokio::time::interval panic.
        if self.enabled && self.sweep_interval_secs == 0 {
            return Err("gc.sweep_interval_secs cannot be 0 when gc is enabled".to_string());
        }

        check_duration("gc.grace_period_secs", self.grace_period_secs)?;
        check_duration("gc.complete_retention_secs", self.complete_retention_secs)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Garbage collection configuration.
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Create a test configuration rooted at `storage_path`.
    ///
    /// **For testing only.** Small limits and no background sweep.
    pub fn for_testing(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            server: ServerConfig {
                max_chunk_size: 1024 * 1024,
                max_upload_size: 8 * 1024 * 1024,
                ..ServerConfig::default()
            },
            storage: StorageConfig::Filesystem {
                path: storage_path.into(),
            },
            gc: GcConfig {
                enabled: false,
                ..GcConfig::default()
            },
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.storage.validate()?;
        self.gc.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AppConfig::default().validate().unwrap();
        AppConfig::for_testing("/tmp/depot").validate().unwrap();
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_upload_size, 1024 * 1024 * 1024);
        assert_eq!(config.max_chunk_size, 32 * 1024 * 1024);
        assert!(config.metrics_enabled);
        assert_eq!(config.upload_timeout(), Duration::hours(24));
    }

    #[test]
    fn test_server_config_rejects_chunk_larger_than_upload() {
        let config = ServerConfig {
            max_chunk_size: 10,
            max_upload_size: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_rejects_zero_limits() {
        for config in [
            ServerConfig {
                max_total_chunks: 0,
                ..Default::default()
            },
            ServerConfig {
                upload_timeout_secs: 0,
                ..Default::default()
            },
            ServerConfig {
                max_chunk_size: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_gc_config_rejects_zero_interval_only_when_enabled() {
        let mut config = GcConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gc_config_rejects_overflowing_grace_period() {
        let config = GcConfig {
            grace_period_secs: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_capped_at_a_century() {
        let server = ServerConfig {
            upload_timeout_secs: 10_000_000_000_000,
            ..Default::default()
        };
        assert!(server.validate().is_err());

        let at_limit = ServerConfig {
            upload_timeout_secs: MAX_DURATION_SECS,
            ..Default::default()
        };
        assert!(at_limit.validate().is_ok());

        let gc = GcConfig {
            complete_retention_secs: MAX_DURATION_SECS + 1,
            ..Default::default()
        };
        assert!(gc.validate().is_err());

        // Accessors saturate even when validation was skipped.
        assert_eq!(
            server.upload_timeout(),
            Duration::seconds(MAX_DURATION_SECS as i64)
        );
    }

    #[test]
    fn test_app_config_deserialize_partial() {
        let json = r#"{"server": {"bind": "0.0.0.0:9000"}, "storage": {"type": "filesystem", "path": "/srv/depot"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.max_upload_size, crate::DEFAULT_MAX_UPLOAD_SIZE);
        assert!(config.gc.enabled);
        match config.storage {
            StorageConfig::Filesystem { path } => assert_eq!(path, PathBuf::from("/srv/depot")),
        }
    }
}
