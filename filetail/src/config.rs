//! Configuration types for the file target.
//!
//! All types have serde support so an embedding agent can deserialize them
//! from its own scrape config, and `Default` impls matching the documented
//! defaults (10s sync period, 250ms poll frequency).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconciliation and checkpoint cadence for a single [`Target`](crate::target::Target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// How often `sync()` re-diffs the filesystem against the active
    /// reader/watch sets. Also the Tailer checkpoint interval.
    #[serde(with = "humantime_serde", default = "default_sync_period")]
    pub sync_period: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            sync_period: default_sync_period(),
        }
    }
}

fn default_sync_period() -> Duration {
    Duration::from_secs(10)
}

/// Poll-mode fallback tuning for filesystems where inotify/FSEvents-style
/// watches are unreliable (e.g. some network mounts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(with = "humantime_serde", default = "default_poll_frequency")]
    pub min_poll_frequency: Duration,
    #[serde(with = "humantime_serde", default = "default_poll_frequency")]
    pub max_poll_frequency: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            min_poll_frequency: default_poll_frequency(),
            max_poll_frequency: default_poll_frequency(),
        }
    }
}

fn default_poll_frequency() -> Duration {
    Duration::from_millis(250)
}

/// Line re-encoding applied before handing a line to the Sink.
///
/// `None` at the `Target` call site means passthrough; only UTF-8 is
/// implemented today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Utf8,
}

/// Snapshot compression format recognized by the Decompressor reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionFormat {
    Gz,
    Z,
    Bz2,
}

/// Switches a matched path from the Tailer reader to the one-shot
/// Decompressor reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompressionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default)]
    pub initial_delay: Duration,
    #[serde(default = "default_format")]
    pub format: CompressionFormat,
}

impl Default for DecompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::ZERO,
            format: default_format(),
        }
    }
}

fn default_format() -> CompressionFormat {
    CompressionFormat::Gz
}

/// Minimal `humantime`-backed serde adapter, since `humantime` itself only
/// provides `Display`/`FromStr`, not a serde module.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_10s_and_250ms() {
        assert_eq!(TargetConfig::default().sync_period, Duration::from_secs(10));
        let watch = WatchConfig::default();
        assert_eq!(watch.min_poll_frequency, Duration::from_millis(250));
        assert_eq!(watch.max_poll_frequency, Duration::from_millis(250));
        assert!(!DecompressionConfig::default().enabled);
    }

    #[test]
    fn target_config_roundtrips_through_json() {
        let cfg = TargetConfig {
            sync_period: Duration::from_secs(30),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TargetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
