//! DeviceHandle - public API for a device session actor
//!
//! Wraps the session's command channel. Hot path methods are
//! fire-and-forget; queries await a oneshot response. All methods are
//! non-blocking for the caller.

use tokio::sync::{mpsc, oneshot};

use crate::color::Rgb;
use crate::queue::Priority;

use super::commands::{DeviceCommand, DeviceCounters, DeviceTuning};
use super::ConnectionStatus;

/// Handle for one device session
#[derive(Clone)]
pub struct DeviceHandle {
    device_id: String,
    cmd_tx: mpsc::UnboundedSender<DeviceCommand>,
}

impl DeviceHandle {
    pub fn new(device_id: String, cmd_tx: mpsc::UnboundedSender<DeviceCommand>) -> Self {
        Self { device_id, cmd_tx }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Request a color for one unit (diffed and throttled by the session).
    pub fn request_update(&self, unit_index: u16, color: Rgb, priority: Priority) {
        let _ = self.cmd_tx.send(DeviceCommand::RequestUpdate {
            unit_index,
            color,
            priority,
        });
    }

    /// Replace the desired state of every unit with a composited frame.
    pub fn apply_frame(&self, buffer: Vec<Rgb>) {
        let _ = self.cmd_tx.send(DeviceCommand::ApplyFrame { buffer });
    }

    /// Kick a stale or erroring session back into its connect cycle.
    pub fn retry_now(&self) {
        let _ = self.cmd_tx.send(DeviceCommand::RetryNow);
    }

    /// Swap in new tuning values (config hot reload).
    pub fn update_tuning(&self, tuning: DeviceTuning) {
        let _ = self.cmd_tx.send(DeviceCommand::UpdateTuning(tuning));
    }

    pub async fn status(&self) -> Option<ConnectionStatus> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DeviceCommand::GetStatus { response: tx })
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    /// Colors the session believes are resident on the hardware.
    pub async fn unit_colors(&self) -> Option<Vec<Rgb>> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DeviceCommand::GetUnitColors { response: tx })
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn counters(&self) -> Option<DeviceCounters> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DeviceCommand::GetCounters { response: tx })
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    /// Whether the session task is still running.
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(DeviceCommand::Shutdown);
    }
}
