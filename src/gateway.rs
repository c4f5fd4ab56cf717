//! Gateway facade
//!
//! Owns the compositor, the device sessions, and the event bus, and exposes
//! the one API software modules talk to. Everything behind it is actors;
//! the facade just routes.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::color::Rgb;
use crate::compositor::{BlendMode, Compositor, CompositorHandle, CompositorSettings, Frame};
use crate::config::{AppConfig, DeviceConfig};
use crate::device::{
    build_link, ConnectionStatus, Device, DeviceCounters, DeviceHandle, DeviceWorker, LinkSpec,
    TransportId, TransportLink,
};
use crate::events::{CoreEvent, EventBus};
use crate::queue::Priority;
use crate::transport::{EncodeError, GridVariant, TransportCodec};

/// Fault taxonomy for the gateway
///
/// Transport and connection faults are resolved inside the device sessions
/// (retry, backoff, shedding) and never propagate to producers, which only
/// observe `ConnectionChange` events. The facade surfaces
/// [`GatewayError::DeviceUnreachable`] directly; the other variants appear
/// in session diagnostics.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no device '{0}' is registered")]
    DeviceUnreachable(String),

    #[error("device '{device_id}' did not complete its handshake in time")]
    ConnectionTimeout { device_id: String },

    #[error("encode failed: {0}")]
    TransportEncode(#[from] EncodeError),

    #[error("device '{device_id}' update queue is above high water")]
    QueueOverflow { device_id: String },
}

/// The running gateway
pub struct Gateway {
    devices: RwLock<HashMap<String, DeviceHandle>>,
    compositor: CompositorHandle,
    event_bus: Arc<EventBus>,
}

fn link_spec(cfg: &DeviceConfig) -> Result<LinkSpec> {
    match cfg.transport {
        TransportId::SysexMidi => Ok(LinkSpec::Midi {
            input_port: cfg
                .midi_input_port
                .clone()
                .ok_or_else(|| anyhow!("device '{}' missing midi_input_port", cfg.id))?,
            output_port: cfg
                .midi_output_port
                .clone()
                .ok_or_else(|| anyhow!("device '{}' missing midi_output_port", cfg.id))?,
        }),
        TransportId::HttpJson => Ok(LinkSpec::Http {
            base_url: cfg
                .host
                .clone()
                .ok_or_else(|| anyhow!("device '{}' missing host", cfg.id))?,
        }),
        TransportId::UdpWarls => Ok(LinkSpec::Udp {
            addr: cfg
                .udp_addr
                .clone()
                .ok_or_else(|| anyhow!("device '{}' missing udp_addr", cfg.id))?,
        }),
        TransportId::RelaySocket => Ok(LinkSpec::Relay {
            url: cfg
                .relay_url
                .clone()
                .ok_or_else(|| anyhow!("device '{}' missing relay_url", cfg.id))?,
        }),
    }
}

fn codec_for(cfg: &DeviceConfig) -> TransportCodec {
    let variant = cfg.variant.as_deref().and_then(GridVariant::from_name);
    TransportCodec::for_transport(cfg.transport, &cfg.id, variant)
}

fn device_for(cfg: &DeviceConfig) -> Device {
    Device {
        id: cfg.id.clone(),
        kind: cfg.kind,
        transport: cfg.transport,
        unit_count: cfg.unit_count,
        capabilities: cfg.capabilities(),
    }
}

impl Gateway {
    /// Build and start the gateway from a loaded config.
    pub async fn from_config(config: &AppConfig) -> Result<Arc<Self>> {
        let event_bus = Arc::new(EventBus::new());
        let settings = CompositorSettings {
            tick_hz: config.compositor.tick_hz,
            frame_ttl_ms: config.compositor.frame_ttl_ms,
            default_blend: config.compositor.default_blend,
        };
        let compositor = Compositor::spawn(settings, event_bus.clone());

        let gateway = Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            compositor,
            event_bus,
        });

        for cfg in &config.devices {
            let link = build_link(&link_spec(cfg)?);
            gateway.add_device(cfg, link).await;
        }

        info!(devices = config.devices.len(), "Gateway started");
        Ok(gateway)
    }

    /// Start a session for one device with a caller-supplied link.
    ///
    /// The normal path goes through [`Gateway::from_config`]; this entry
    /// point exists so tests can attach in-memory links.
    pub async fn add_device(&self, cfg: &DeviceConfig, link: Box<dyn TransportLink>) {
        let device = device_for(cfg);
        let channel_max = device.capabilities.channel_max();
        let handle = DeviceWorker::spawn(
            device,
            codec_for(cfg),
            link,
            cfg.tuning(),
            self.event_bus.clone(),
        );

        self.compositor.register_device(
            &cfg.id,
            cfg.unit_count,
            channel_max,
            cfg.blend_mode,
            handle.clone(),
        );
        self.devices.write().await.insert(cfg.id.clone(), handle);
        info!(device_id = cfg.id, "Device added");
    }

    pub async fn remove_device(&self, device_id: &str) {
        if let Some(handle) = self.devices.write().await.remove(device_id) {
            self.compositor.unregister_device(device_id);
            handle.shutdown();
            info!(device_id, "Device removed");
        }
    }

    /// Submit a module's frame to the compositor.
    pub fn submit_frame(&self, frame: Frame) {
        self.compositor.submit_frame(frame);
    }

    pub fn withdraw_frame(&self, module_id: &str, device_id: &str) {
        self.compositor.withdraw_frame(module_id, device_id);
    }

    pub fn set_blend_mode(&self, device_id: &str, mode: BlendMode) {
        self.compositor.set_blend_mode(device_id, mode);
    }

    /// Direct single-unit update, bypassing the compositor (cursor overlays
    /// and other latency-sensitive writers).
    pub async fn request_update(
        &self,
        device_id: &str,
        unit_index: u16,
        color: Rgb,
        priority: Priority,
    ) -> Result<(), GatewayError> {
        let devices = self.devices.read().await;
        let handle = devices
            .get(device_id)
            .ok_or_else(|| GatewayError::DeviceUnreachable(device_id.to_string()))?;
        handle.request_update(unit_index, color, priority);
        Ok(())
    }

    pub async fn retry_now(&self, device_id: &str) -> Result<(), GatewayError> {
        let devices = self.devices.read().await;
        let handle = devices
            .get(device_id)
            .ok_or_else(|| GatewayError::DeviceUnreachable(device_id.to_string()))?;
        handle.retry_now();
        Ok(())
    }

    pub async fn device_status(&self, device_id: &str) -> Option<ConnectionStatus> {
        let handle = self.devices.read().await.get(device_id)?.clone();
        handle.status().await
    }

    pub async fn device_counters(&self, device_id: &str) -> Option<DeviceCounters> {
        let handle = self.devices.read().await.get(device_id)?.clone();
        handle.counters().await
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Subscribe to gateway events (input, connection changes, composited
    /// frames). Slow subscribers lose events rather than stalling the core.
    pub fn subscribe(&self, capacity: usize) -> tokio::sync::mpsc::Receiver<CoreEvent> {
        self.event_bus.subscribe(capacity)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Apply a reloaded config: retune surviving devices, add new ones,
    /// drop removed ones. Transport changes on a live device need a restart
    /// and are only logged.
    pub async fn apply_config(&self, config: &AppConfig) -> Result<()> {
        let existing: Vec<String> = self.device_ids().await;

        for cfg in &config.devices {
            if existing.contains(&cfg.id) {
                let devices = self.devices.read().await;
                if let Some(handle) = devices.get(&cfg.id) {
                    handle.update_tuning(cfg.tuning());
                }
                if let Some(mode) = cfg.blend_mode {
                    self.compositor.set_blend_mode(&cfg.id, mode);
                }
            } else {
                match link_spec(cfg) {
                    Ok(spec) => self.add_device(cfg, build_link(&spec)).await,
                    Err(e) => warn!(device_id = cfg.id, error = %e, "Skipping new device"),
                }
            }
        }

        for id in existing {
            if !config.devices.iter().any(|d| d.id == id) {
                self.remove_device(&id).await;
            }
        }

        info!("Configuration applied");
        Ok(())
    }

    /// Stop every session and the compositor.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        for handle in self.devices.write().await.drain().map(|(_, h)| h) {
            handle.shutdown();
        }
        self.compositor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, MockLink};
    use crate::transport::GridVariant;
    use std::time::Duration;

    fn grid_cfg(id: &str) -> DeviceConfig {
        let yaml = format!(
            r#"
id: {id}
kind: grid-controller
transport: sysex-midi
unit_count: 8
color_depth_bits: 6
velocity_sensitive: true
variant: launchpad-pro
midi_input_port: "Pad"
midi_output_port: "Pad"
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    async fn started_gateway() -> (Arc<Gateway>, crate::device::MockLinkController) {
        let event_bus = Arc::new(EventBus::new());
        let compositor = Compositor::spawn(
            CompositorSettings {
                tick_hz: 100,
                ..Default::default()
            },
            event_bus.clone(),
        );
        let gateway = Arc::new(Gateway {
            devices: RwLock::new(HashMap::new()),
            compositor,
            event_bus,
        });

        let (link, ctl) = MockLink::new();
        ctl.impersonate(GridVariant::LAUNCH_PRO);
        gateway.add_device(&grid_cfg("pads"), Box::new(link)).await;
        (gateway, ctl)
    }

    async fn wait_connected(gateway: &Gateway, id: &str) {
        for _ in 0..400 {
            if gateway.device_status(id).await == Some(ConnectionStatus::Connected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} never connected");
    }

    #[test]
    fn test_codec_selection_honors_variant() {
        let cfg = grid_cfg("pads");
        assert!(matches!(
            codec_for(&cfg),
            TransportCodec::GridSysex(v) if v == GridVariant::LAUNCH_PRO
        ));
        assert_eq!(device_for(&cfg).kind, DeviceKind::GridController);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_flows_from_module_to_wire() {
        let (gateway, ctl) = started_gateway().await;
        wait_connected(&gateway, "pads").await;
        let baseline = ctl.sent_count();

        gateway.submit_frame(Frame::new("seq", "pads", vec![Rgb::new(63, 0, 0); 8]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = ctl.sent();
        assert!(sent.len() > baseline, "nothing reached the wire");
        let frame = sent.last().unwrap();
        assert_eq!(frame[6], 0x0B); // LED batch command
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_event_reaches_subscriber() {
        let (gateway, ctl) = started_gateway().await;
        let mut events = gateway.subscribe(16);
        wait_connected(&gateway, "pads").await;

        ctl.push_inbound(vec![0x90, 3, 90]);
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out")
                .expect("bus open")
            {
                CoreEvent::Input(input) => {
                    assert_eq!(input.device_id, "pads");
                    assert_eq!(input.unit_index, 3);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_unreachable() {
        let (gateway, _ctl) = started_gateway().await;
        let err = gateway
            .request_update("ghost", 0, Rgb::BLACK, Priority::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeviceUnreachable(ref id) if id == "ghost"));
        assert!(gateway.retry_now("ghost").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_stops_session() {
        let (gateway, _ctl) = started_gateway().await;
        wait_connected(&gateway, "pads").await;

        gateway.remove_device("pads").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(gateway.device_status("pads").await.is_none());
        assert!(gateway.device_ids().await.is_empty());
    }
}
