//! Frame compositor actor
//!
//! Multiple software modules each submit full frames for a device; the
//! compositor folds them into a single output frame per device on a fixed
//! tick and hands the result to the device session. Frames expire after a
//! TTL so a crashed module cannot freeze its contribution on the hardware.

pub mod blend;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::color::Rgb;
use crate::device::DeviceHandle;
use crate::events::{now_ms, CoreEvent, EventBus};
use std::sync::Arc;

pub use blend::BlendMode;

/// One module's full-frame contribution for one device
#[derive(Debug, Clone)]
pub struct Frame {
    /// Submitting module; one live frame per (module, device) pair
    pub module_id: String,
    pub device_id: String,
    /// One color per unit, in the device's native channel domain
    pub pixels: Vec<Rgb>,
    /// Overrides the device blend mode for this frame's fold step
    pub blend_hint: Option<BlendMode>,
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(module_id: &str, device_id: &str, pixels: Vec<Rgb>) -> Self {
        Self {
            module_id: module_id.to_string(),
            device_id: device_id.to_string(),
            pixels,
            blend_hint: None,
            timestamp_ms: now_ms(),
        }
    }
}

/// Compositor tuning, normally sourced from config
#[derive(Debug, Clone)]
pub struct CompositorSettings {
    pub tick_hz: u32,
    pub frame_ttl_ms: u64,
    pub default_blend: BlendMode,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            tick_hz: 30,
            frame_ttl_ms: 2_000,
            default_blend: BlendMode::Max,
        }
    }
}

/// Commands accepted by the compositor actor
pub enum CompositorCommand {
    RegisterDevice {
        device_id: String,
        unit_count: u16,
        channel_max: u8,
        blend: Option<BlendMode>,
        handle: DeviceHandle,
    },
    UnregisterDevice {
        device_id: String,
    },
    SubmitFrame(Frame),
    WithdrawFrame {
        module_id: String,
        device_id: String,
    },
    SetBlendMode {
        device_id: String,
        mode: BlendMode,
    },
    GetComposited {
        device_id: String,
        response: oneshot::Sender<Option<Vec<Rgb>>>,
    },
    Shutdown,
}

impl std::fmt::Debug for CompositorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegisterDevice { device_id, unit_count, .. } => f
                .debug_struct("RegisterDevice")
                .field("device_id", device_id)
                .field("unit_count", unit_count)
                .finish(),
            Self::UnregisterDevice { device_id } => f
                .debug_struct("UnregisterDevice")
                .field("device_id", device_id)
                .finish(),
            Self::SubmitFrame(frame) => f
                .debug_struct("SubmitFrame")
                .field("module_id", &frame.module_id)
                .field("device_id", &frame.device_id)
                .field("pixels", &frame.pixels.len())
                .finish(),
            Self::WithdrawFrame { module_id, device_id } => f
                .debug_struct("WithdrawFrame")
                .field("module_id", module_id)
                .field("device_id", device_id)
                .finish(),
            Self::SetBlendMode { device_id, mode } => f
                .debug_struct("SetBlendMode")
                .field("device_id", device_id)
                .field("mode", mode)
                .finish(),
            Self::GetComposited { device_id, .. } => f
                .debug_struct("GetComposited")
                .field("device_id", device_id)
                .finish(),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct ActiveFrame {
    pixels: Vec<Rgb>,
    blend_hint: Option<BlendMode>,
    received_at: Instant,
}

struct DeviceSlot {
    unit_count: u16,
    channel_max: u8,
    blend: BlendMode,
    handle: DeviceHandle,
    /// Live frames keyed by module id
    frames: HashMap<String, ActiveFrame>,
    /// Last frame pushed to the session; pushes are skipped when unchanged
    last_output: Option<Vec<Rgb>>,
    dirty: bool,
}

/// Actor owning all per-device frame sets. Commands mutate the sets; the
/// tick folds them and pushes changed output downstream.
pub struct Compositor {
    devices: HashMap<String, DeviceSlot>,
    settings: CompositorSettings,
    command_rx: mpsc::UnboundedReceiver<CompositorCommand>,
    event_bus: Arc<EventBus>,
}

impl Compositor {
    /// Spawn the compositor and return a handle to it.
    pub fn spawn(settings: CompositorSettings, event_bus: Arc<EventBus>) -> CompositorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = Compositor {
            devices: HashMap::new(),
            settings,
            command_rx: cmd_rx,
            event_bus,
        };
        tokio::spawn(actor.run());
        info!("Compositor spawned");
        CompositorHandle::new(cmd_tx)
    }

    async fn run(mut self) {
        let tick = Duration::from_millis(1_000 / u64::from(self.settings.tick_hz.max(1)));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(CompositorCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = interval.tick() => {
                    self.composite_all();
                }
            }
        }

        info!("Compositor run loop terminated");
    }

    fn handle_command(&mut self, cmd: CompositorCommand) {
        trace!(?cmd, "Processing command");
        match cmd {
            CompositorCommand::RegisterDevice {
                device_id,
                unit_count,
                channel_max,
                blend,
                handle,
            } => {
                debug!(device_id, unit_count, "Device registered with compositor");
                self.devices.insert(
                    device_id,
                    DeviceSlot {
                        unit_count,
                        channel_max,
                        blend: blend.unwrap_or(self.settings.default_blend),
                        handle,
                        frames: HashMap::new(),
                        last_output: None,
                        dirty: false,
                    },
                );
            }
            CompositorCommand::UnregisterDevice { device_id } => {
                self.devices.remove(&device_id);
                debug!(device_id, "Device unregistered from compositor");
            }
            CompositorCommand::SubmitFrame(frame) => self.handle_submit(frame),
            CompositorCommand::WithdrawFrame { module_id, device_id } => {
                if let Some(slot) = self.devices.get_mut(&device_id) {
                    if slot.frames.remove(&module_id).is_some() {
                        slot.dirty = true;
                    }
                }
            }
            CompositorCommand::SetBlendMode { device_id, mode } => {
                if let Some(slot) = self.devices.get_mut(&device_id) {
                    slot.blend = mode;
                    slot.dirty = true;
                }
            }
            CompositorCommand::GetComposited { device_id, response } => {
                let snapshot = self
                    .devices
                    .get(&device_id)
                    .and_then(|slot| slot.last_output.clone());
                let _ = response.send(snapshot);
            }
            CompositorCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_submit(&mut self, frame: Frame) {
        let Some(slot) = self.devices.get_mut(&frame.device_id) else {
            warn!(device_id = frame.device_id, "Frame for unknown device dropped");
            return;
        };

        let mut pixels = frame.pixels;
        // Short frames are padded with black, long ones truncated; the unit
        // count is the hardware's, not the module's.
        pixels.resize(slot.unit_count as usize, Rgb::BLACK);
        for p in &mut pixels {
            *p = p.clamp_to(slot.channel_max);
        }

        slot.frames.insert(
            frame.module_id,
            ActiveFrame {
                pixels,
                blend_hint: frame.blend_hint,
                received_at: Instant::now(),
            },
        );
        slot.dirty = true;
    }

    fn composite_all(&mut self) {
        let ttl = Duration::from_millis(self.settings.frame_ttl_ms);
        let mut composited: Vec<(String, u16)> = Vec::new();

        for (device_id, slot) in &mut self.devices {
            let before = slot.frames.len();
            slot.frames.retain(|_, f| f.received_at.elapsed() < ttl);
            if slot.frames.len() != before {
                debug!(
                    device_id,
                    expired = before - slot.frames.len(),
                    "Expired stale frames"
                );
                slot.dirty = true;
            }

            if !slot.dirty {
                continue;
            }
            slot.dirty = false;

            let output = Self::fold(slot);
            if slot.last_output.as_ref() == Some(&output) {
                continue;
            }

            slot.handle.apply_frame(output.clone());
            slot.last_output = Some(output);
            composited.push((device_id.clone(), slot.unit_count));
        }

        for (device_id, unit_count) in composited {
            self.event_bus.publish(CoreEvent::FrameComposited {
                device_id,
                unit_count,
            });
        }
    }

    /// Fold the live frames into one output frame.
    ///
    /// Frames fold in module-id order so the result is a pure function of
    /// the live set. A single frame passes through untouched. With no frames
    /// the device goes dark.
    fn fold(slot: &DeviceSlot) -> Vec<Rgb> {
        let mut ids: Vec<&String> = slot.frames.keys().collect();
        ids.sort();

        let mut iter = ids.into_iter();
        let Some(first) = iter.next() else {
            return vec![Rgb::BLACK; slot.unit_count as usize];
        };

        let mut out = slot.frames[first].pixels.clone();
        for id in iter {
            let frame = &slot.frames[id];
            let mode = frame.blend_hint.unwrap_or(slot.blend);
            for (o, p) in out.iter_mut().zip(frame.pixels.iter()) {
                *o = mode.blend(*o, *p, slot.channel_max);
            }
        }
        out
    }
}

/// Handle for interacting with the compositor actor
///
/// Frame submission is fire-and-forget; snapshot queries await a oneshot
/// response.
#[derive(Clone)]
pub struct CompositorHandle {
    cmd_tx: mpsc::UnboundedSender<CompositorCommand>,
}

impl CompositorHandle {
    pub fn new(cmd_tx: mpsc::UnboundedSender<CompositorCommand>) -> Self {
        Self { cmd_tx }
    }

    pub fn register_device(
        &self,
        device_id: &str,
        unit_count: u16,
        channel_max: u8,
        blend: Option<BlendMode>,
        handle: DeviceHandle,
    ) {
        let _ = self.cmd_tx.send(CompositorCommand::RegisterDevice {
            device_id: device_id.to_string(),
            unit_count,
            channel_max,
            blend,
            handle,
        });
    }

    pub fn unregister_device(&self, device_id: &str) {
        let _ = self.cmd_tx.send(CompositorCommand::UnregisterDevice {
            device_id: device_id.to_string(),
        });
    }

    /// Submit or replace a module's frame for a device.
    pub fn submit_frame(&self, frame: Frame) {
        let _ = self.cmd_tx.send(CompositorCommand::SubmitFrame(frame));
    }

    /// Remove a module's contribution immediately instead of waiting for
    /// the TTL.
    pub fn withdraw_frame(&self, module_id: &str, device_id: &str) {
        let _ = self.cmd_tx.send(CompositorCommand::WithdrawFrame {
            module_id: module_id.to_string(),
            device_id: device_id.to_string(),
        });
    }

    pub fn set_blend_mode(&self, device_id: &str, mode: BlendMode) {
        let _ = self.cmd_tx.send(CompositorCommand::SetBlendMode {
            device_id: device_id.to_string(),
            mode,
        });
    }

    /// Last composited output for a device, if any tick has produced one.
    pub async fn composited(&self, device_id: &str) -> Option<Vec<Rgb>> {
        let (response_tx, response_rx) = oneshot::channel();
        let cmd = CompositorCommand::GetComposited {
            device_id: device_id.to_string(),
            response: response_tx,
        };
        if self.cmd_tx.send(cmd).is_err() {
            return None;
        }
        response_rx.await.ok().flatten()
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(CompositorCommand::Shutdown);
    }
}
