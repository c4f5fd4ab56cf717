//! Configuration for the light gateway
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::fs;

use crate::compositor::BlendMode;
use crate::device::{Capabilities, DeviceKind, DeviceTuning, TransportId};

pub use watcher::{ConfigUpdate, ConfigWatcher};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub compositor: CompositorConfig,
}

/// One device entry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: DeviceKind,
    pub transport: TransportId,
    pub unit_count: u16,

    #[serde(default = "default_color_depth")]
    pub color_depth_bits: u8,
    #[serde(default)]
    pub velocity_sensitive: bool,
    #[serde(default)]
    pub animation_modes: Vec<String>,

    /// Grid hardware variant name, e.g. "launchpad-mk3"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    // Transport addressing; which fields apply depends on `transport`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_input_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_output_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,

    /// Blend mode for this device's composited output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blend_mode: Option<BlendMode>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: usize,
}

/// Compositor configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CompositorConfig {
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default = "default_frame_ttl")]
    pub frame_ttl_ms: u64,
    #[serde(default)]
    pub default_blend: BlendMode,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            frame_ttl_ms: default_frame_ttl(),
            default_blend: BlendMode::default(),
        }
    }
}

impl DeviceConfig {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            color_depth_bits: self.color_depth_bits,
            velocity_sensitive: self.velocity_sensitive,
            animation_modes: self.animation_modes.clone(),
        }
    }

    pub fn tuning(&self) -> DeviceTuning {
        DeviceTuning {
            batch_size: self.batch_size,
            flush_interval_ms: self.flush_interval_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            reconnect_max_delay_ms: self.reconnect_max_delay_ms,
            queue_high_water: self.queue_high_water,
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            anyhow::bail!("At least one device must be defined");
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                anyhow::bail!("Device id cannot be empty");
            }
            if !ids.insert(&device.id) {
                anyhow::bail!("Duplicate device id '{}'", device.id);
            }
            device.validate()?;
        }

        if self.compositor.tick_hz == 0 || self.compositor.tick_hz > 120 {
            anyhow::bail!(
                "compositor tick_hz {} is out of range (1-120)",
                self.compositor.tick_hz
            );
        }

        Ok(())
    }
}

impl DeviceConfig {
    fn validate(&self) -> Result<()> {
        if self.unit_count == 0 {
            anyhow::bail!("Device '{}' unit_count cannot be zero", self.id);
        }

        match self.color_depth_bits {
            1..=8 => {}
            other => anyhow::bail!(
                "Device '{}' has invalid color_depth_bits {} (must be 1-8)",
                self.id,
                other
            ),
        }

        match self.transport {
            TransportId::SysexMidi => {
                if self.midi_input_port.is_none() || self.midi_output_port.is_none() {
                    anyhow::bail!(
                        "Device '{}' uses sysex-midi and requires midi_input_port and midi_output_port",
                        self.id
                    );
                }
                if let Some(name) = &self.variant {
                    if crate::transport::GridVariant::from_name(name).is_none() {
                        anyhow::bail!("Device '{}' has unknown variant '{}'", self.id, name);
                    }
                }
            }
            TransportId::HttpJson => {
                if self.host.is_none() {
                    anyhow::bail!("Device '{}' uses http-json and requires host", self.id);
                }
            }
            TransportId::UdpWarls => {
                if self.udp_addr.is_none() {
                    anyhow::bail!("Device '{}' uses udp-warls and requires udp_addr", self.id);
                }
            }
            TransportId::RelaySocket => {
                if self.relay_url.is_none() {
                    anyhow::bail!(
                        "Device '{}' uses relay-socket and requires relay_url",
                        self.id
                    );
                }
            }
        }

        if self.reconnect_base_delay_ms == 0 {
            anyhow::bail!(
                "Device '{}' reconnect_base_delay_ms cannot be zero",
                self.id
            );
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            anyhow::bail!(
                "Device '{}' reconnect_max_delay_ms must be >= reconnect_base_delay_ms",
                self.id
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("Device '{}' batch_size cannot be zero", self.id);
        }

        Ok(())
    }
}

// Default value functions
fn default_color_depth() -> u8 {
    8
}
fn default_batch_size() -> usize {
    12
}
fn default_flush_interval() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    5_000
}
fn default_max_reconnect_attempts() -> u32 {
    8
}
fn default_reconnect_base_delay() -> u64 {
    100
}
fn default_reconnect_max_delay() -> u64 {
    2_000
}
fn default_queue_high_water() -> usize {
    256
}
fn default_tick_hz() -> u32 {
    30
}
fn default_frame_ttl() -> u64 {
    2_000
}
