//! Framecast - depth/RGB/IR frame streaming server
//!
//! Frames handed over by a camera driver callback are copied into a bounded
//! queue and streamed to TCP clients using a fixed 48-byte header protocol.

pub mod capture;
pub mod client;
pub mod codec;
pub mod error;
pub mod pipeline;
pub mod server;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{NormalizedFrame, Plane, PlaneKind, RawFrame, RawPlane};
pub use error::{Error, Result};
pub use server::{Distribution, ServerConfig, ServerStats, StreamServer};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix for configuration overrides (`FRAMECAST__SERVER__PORT=9000`)
pub const ENV_PREFIX: &str = "FRAMECAST";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

/// Synthetic frame source used when no camera driver is attached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub depth: bool,
    pub rgb: bool,
    pub ir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Throughput report interval, 0 disables it
    pub stats_interval_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: 30,
            width: 640,
            height: 480,
            depth: true,
            rgb: true,
            ir: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "framecast=info".into(),
            stats_interval_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply `FRAMECAST__*`
    /// environment overrides. Missing keys fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder =
                builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from TOML text (no environment overrides)
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.server.queue_capacity, 10);
        assert_eq!(config.server.distribution, Distribution::Shared);
        assert!(config.source.enabled);
    }

    #[test]
    fn partial_toml_overrides_only_given_keys() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9100
            distribution = "broadcast"
            write_timeout_ms = 250

            [source]
            ir = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.distribution, Distribution::Broadcast);
        assert_eq!(config.server.write_timeout_ms, Some(250));
        assert_eq!(config.server.idle_wait_ms, 10);
        assert!(config.source.ir);
        assert_eq!(config.source.fps, 30);
        assert_eq!(config.logging.stats_interval_secs, 5);
    }
}
