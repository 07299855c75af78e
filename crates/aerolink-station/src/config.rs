//! Station configuration.
//!
//! The TOML file is read into `*Input` structs where every field is
//! optional, then resolved into the runtime config types with defaults
//! filled in and values checked.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use aerolink_transport::queue::DEFAULT_QUEUE_CAPACITY;
use aerolink_transport::receiver::ReceiverConfig;

use crate::adaptation::{KeyframeConfig, QualityConfig};
use crate::net::interface::{Capabilities, InterfaceConfig, InterfaceKind};
use crate::net::selector::{RadioLink, UplinkDatarate};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("interface '{name}': {reason}")]
    Interface { name: String, reason: String },
    #[error("link {id}: {reason}")]
    Link { id: usize, reason: String },
    #[error("telemetry: {0}")]
    Telemetry(String),
}

// ─── Input ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StationConfigInput {
    pub version: u32,
    pub receiver: ReceiverConfigInput,
    pub quality: QualityConfigInput,
    pub keyframe: KeyframeConfigInput,
    pub interfaces: Vec<InterfaceConfigInput>,
    pub links: Vec<LinkConfigInput>,
    pub telemetry: TelemetryConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub retransmissions: Option<bool>,
    pub retry_timeout_ms: Option<u64>,
    pub silence_request_ms: Option<u64>,
    pub link_lost_timeout_ms: Option<u64>,
    pub uplink_lost_timeout_ms: Option<u64>,
    pub fallback_window_ms: Option<u32>,
    pub max_segments_per_request: Option<usize>,
    pub stats_slice_ms: Option<u64>,
    pub stats_slices: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub stream: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QualityConfigInput {
    pub change_strength: Option<u8>,
    pub update_interval_ms: Option<u64>,
    pub high_levels: Option<u32>,
    pub medium_levels: Option<u32>,
    pub low_levels: Option<u32>,
    pub profile_base_fec: Option<[u8; 3]>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyframeConfigInput {
    pub change_strength: Option<u8>,
    pub max_interval_ms: Option<u32>,
    pub fixed_interval_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InterfaceConfigInput {
    pub name: String,
    pub kind: Option<String>,
    pub air_rate_bps: Option<u32>,
    pub bind: Option<String>,
    pub peer: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub preferred_tx: Option<u32>,
    pub link: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkConfigInput {
    pub id: Option<usize>,
    pub capabilities: Option<Vec<String>>,
    pub uplink_datarate: Option<String>,
    pub fixed_datarate: Option<i32>,
    pub video_datarate: Option<i32>,
    pub ht40: Option<bool>,
    pub profile_datarates: Option<[i32; 3]>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigInput {
    pub core_stats_ms: Option<u64>,
    pub stats_log_secs: Option<u64>,
    pub metrics_bind: Option<String>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// A radio interface plus the UDP endpoints standing in for the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSpec {
    pub config: InterfaceConfig,
    pub bind: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Cadence of core stats snapshots.
    pub core_stats_interval: Duration,
    /// Cadence of the one-line stats log.
    pub stats_log_interval: Duration,
    pub metrics_bind: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            core_stats_interval: Duration::from_millis(50),
            stats_log_interval: Duration::from_secs(5),
            metrics_bind: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StationConfig {
    pub version: u32,
    pub receiver: ReceiverConfig,
    pub queue_capacity: usize,
    pub quality: QualityConfig,
    pub keyframe: KeyframeConfig,
    pub interfaces: Vec<InterfaceSpec>,
    pub links: Vec<RadioLink>,
    pub telemetry: TelemetryConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            version: CONFIG_VERSION,
            receiver: ReceiverConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            quality: QualityConfig::default(),
            keyframe: KeyframeConfig::default(),
            interfaces: Vec::new(),
            links: vec![RadioLink::new(0)],
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn parse_addr(raw: Option<String>) -> Result<Option<SocketAddr>, String> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| format!("bad address '{s}': {e}")),
    }
}

impl ReceiverConfigInput {
    fn resolve(self) -> (ReceiverConfig, usize) {
        let d = ReceiverConfig::default();
        let ms = Duration::from_millis;
        let receiver = ReceiverConfig {
            retransmissions_enabled: self.retransmissions.unwrap_or(d.retransmissions_enabled),
            retry_timeout: self.retry_timeout_ms.map(ms).unwrap_or(d.retry_timeout),
            silence_request: self.silence_request_ms.map(ms).unwrap_or(d.silence_request),
            link_lost_timeout: self.link_lost_timeout_ms.map(ms).unwrap_or(d.link_lost_timeout),
            uplink_lost_timeout: self
                .uplink_lost_timeout_ms
                .map(ms)
                .unwrap_or(d.uplink_lost_timeout)
                .max(Duration::from_millis(500)),
            fallback_window_ms: self.fallback_window_ms.unwrap_or(d.fallback_window_ms).max(20),
            max_segments_per_request: self
                .max_segments_per_request
                .unwrap_or(d.max_segments_per_request)
                .clamp(1, d.max_segments_per_request),
            max_output_per_call: d.max_output_per_call,
            stats_slice: self.stats_slice_ms.map(ms).unwrap_or(d.stats_slice),
            stats_slices: self.stats_slices.unwrap_or(d.stats_slices).max(1),
            stream: self.stream.unwrap_or(d.stream),
        };
        let queue = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY).max(8);
        (receiver, queue)
    }
}

impl QualityConfigInput {
    fn resolve(self, stream: u8) -> QualityConfig {
        let d = QualityConfig::default();
        QualityConfig {
            change_strength: self.change_strength.unwrap_or(d.change_strength).min(10),
            update_interval: self
                .update_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.update_interval),
            high_levels: self.high_levels.unwrap_or(d.high_levels),
            medium_levels: self.medium_levels.unwrap_or(d.medium_levels),
            low_levels: self.low_levels.unwrap_or(d.low_levels),
            profile_base_fec: self.profile_base_fec.unwrap_or(d.profile_base_fec),
            stream,
            ..d
        }
    }
}

impl KeyframeConfigInput {
    fn resolve(self, stream: u8) -> KeyframeConfig {
        let d = KeyframeConfig::default();
        KeyframeConfig {
            change_strength: self.change_strength.unwrap_or(d.change_strength).min(10),
            max_interval_ms: self.max_interval_ms.unwrap_or(d.max_interval_ms),
            fixed_interval_ms: self.fixed_interval_ms.filter(|ms| *ms > 0),
            stream,
            ..d
        }
    }
}

impl InterfaceConfigInput {
    fn resolve(self) -> Result<InterfaceSpec, ConfigError> {
        let name = self.name.trim().to_string();
        let err = |reason: String| ConfigError::Interface {
            name: name.clone(),
            reason,
        };
        let kind = match self.kind.as_deref().map(str::trim) {
            None | Some("wifi") => InterfaceKind::Wifi,
            Some("serial") => {
                let air_rate_bps = self
                    .air_rate_bps
                    .filter(|r| *r > 0)
                    .ok_or_else(|| err("serial interface needs air_rate_bps".into()))?;
                InterfaceKind::Serial { air_rate_bps }
            }
            Some(other) => return Err(err(format!("unknown kind '{other}'"))),
        };
        let capabilities = match self.capabilities {
            Some(names) => Capabilities::parse(&names).map_err(&err)?,
            None => Capabilities::all_traffic(),
        };
        let bind = parse_addr(self.bind).map_err(&err)?;
        let peer = parse_addr(self.peer).map_err(&err)?;
        Ok(InterfaceSpec {
            config: InterfaceConfig {
                name: name.clone(),
                kind,
                capabilities,
                preferred_tx: self.preferred_tx.unwrap_or(0),
                link: Some(self.link.unwrap_or(0)),
            },
            bind,
            peer,
        })
    }
}

impl LinkConfigInput {
    fn resolve(self, id: usize) -> Result<RadioLink, ConfigError> {
        let err = |reason: String| ConfigError::Link { id, reason };
        let mut link = RadioLink::new(id);
        if let Some(names) = self.capabilities {
            link.capabilities = Capabilities::parse(&names).map_err(&err)?;
        }
        link.uplink = match self.uplink_datarate.as_deref().map(str::trim) {
            None | Some("auto") => UplinkDatarate::Auto,
            Some("lowest") => UplinkDatarate::Lowest,
            Some("same-as-video") => UplinkDatarate::SameAsVideo,
            Some("fixed") => UplinkDatarate::Fixed(
                self.fixed_datarate
                    .filter(|r| *r != 0)
                    .ok_or_else(|| err("fixed uplink needs fixed_datarate".into()))?,
            ),
            Some(other) => return Err(err(format!("unknown uplink datarate '{other}'"))),
        };
        if let Some(rate) = self.video_datarate {
            link.video_datarate = rate;
        }
        link.ht40 = self.ht40.unwrap_or(false);
        link.profile_datarates = self.profile_datarates.unwrap_or([0; 3]);
        Ok(link)
    }
}

impl StationConfigInput {
    pub fn resolve(self) -> Result<StationConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let (receiver, queue_capacity) = self.receiver.resolve();
        let quality = self.quality.resolve(receiver.stream);
        let keyframe = self.keyframe.resolve(receiver.stream);

        let mut used = HashSet::new();
        let mut links = Vec::new();
        for (idx, input) in self.links.into_iter().enumerate() {
            let id = input.id.unwrap_or(idx);
            if !used.insert(id) {
                tracing::warn!(link = id, "duplicate radio link id, ignoring");
                continue;
            }
            links.push(input.resolve(id)?);
        }
        if links.is_empty() {
            links.push(RadioLink::new(0));
            used.insert(0);
        }

        let mut names = HashSet::new();
        let mut interfaces = Vec::new();
        for input in self.interfaces {
            if input.name.trim().is_empty() {
                continue;
            }
            let spec = input.resolve()?;
            if !names.insert(spec.config.name.clone()) {
                return Err(ConfigError::Interface {
                    name: spec.config.name,
                    reason: "duplicate name".into(),
                });
            }
            if let Some(link) = spec.config.link
                && !used.contains(&link)
            {
                return Err(ConfigError::Interface {
                    name: spec.config.name,
                    reason: format!("assigned to unknown link {link}"),
                });
            }
            interfaces.push(spec);
        }

        let d = TelemetryConfig::default();
        let telemetry = TelemetryConfig {
            core_stats_interval: self
                .telemetry
                .core_stats_ms
                .map(Duration::from_millis)
                .unwrap_or(d.core_stats_interval)
                .max(Duration::from_millis(10)),
            stats_log_interval: self
                .telemetry
                .stats_log_secs
                .map(Duration::from_secs)
                .unwrap_or(d.stats_log_interval),
            metrics_bind: parse_addr(self.telemetry.metrics_bind).map_err(ConfigError::Telemetry)?,
        };

        Ok(StationConfig {
            version,
            receiver,
            queue_capacity,
            quality,
            keyframe,
            interfaces,
            links,
            telemetry,
        })
    }
}

impl StationConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(StationConfig::default());
        }
        let parsed: StationConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
