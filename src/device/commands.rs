//! Command set and tuning knobs for device session actors

use tokio::sync::oneshot;

use crate::color::Rgb;
use crate::queue::Priority;

use super::ConnectionStatus;

/// Commands accepted by a device session actor
///
/// Hot path commands carry no response channel; queries answer over a
/// oneshot.
pub enum DeviceCommand {
    /// Desired color for one unit, routed through the diff queue
    RequestUpdate {
        unit_index: u16,
        color: Rgb,
        priority: Priority,
    },
    /// Full composited frame replacing the desired state of every unit
    ApplyFrame { buffer: Vec<Rgb> },
    /// Operator-initiated reconnect; revives stale sessions
    RetryNow,
    /// Replace the session tuning (config hot reload)
    UpdateTuning(DeviceTuning),
    GetStatus {
        response: oneshot::Sender<ConnectionStatus>,
    },
    GetUnitColors {
        response: oneshot::Sender<Vec<Rgb>>,
    },
    GetCounters {
        response: oneshot::Sender<DeviceCounters>,
    },
    Shutdown,
}

impl std::fmt::Debug for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestUpdate {
                unit_index,
                color,
                priority,
            } => f
                .debug_struct("RequestUpdate")
                .field("unit_index", unit_index)
                .field("color", color)
                .field("priority", priority)
                .finish(),
            Self::ApplyFrame { buffer } => f
                .debug_struct("ApplyFrame")
                .field("units", &buffer.len())
                .finish(),
            Self::RetryNow => write!(f, "RetryNow"),
            Self::UpdateTuning(t) => f.debug_tuple("UpdateTuning").field(t).finish(),
            Self::GetStatus { .. } => write!(f, "GetStatus"),
            Self::GetUnitColors { .. } => write!(f, "GetUnitColors"),
            Self::GetCounters { .. } => write!(f, "GetCounters"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Diagnostic counters kept by every session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    /// Wire sends that succeeded
    pub sends: u64,
    /// Low-priority updates shed by queue backpressure
    pub dropped_low_priority: u64,
    /// Updates refused while the device was down
    pub dropped_disconnected: u64,
    /// Inbound packets that failed to decode
    pub decode_errors: u64,
    /// Connection attempts, successful or not
    pub connect_attempts: u64,
}

/// Per-session tuning, sourced from config and replaceable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTuning {
    /// Units per flushed wire batch
    pub batch_size: usize,
    /// Interval between queue flushes
    pub flush_interval_ms: u64,
    /// Interval between keep-alive probes
    pub heartbeat_interval_ms: u64,
    /// Reconnect attempts before the session parks itself as stale
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Pending-queue depth past which low-priority updates are shed
    pub queue_high_water: usize,
}

impl Default for DeviceTuning {
    fn default() -> Self {
        Self {
            batch_size: 12,
            flush_interval_ms: 5,
            heartbeat_interval_ms: 5_000,
            max_reconnect_attempts: 8,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 2_000,
            queue_high_water: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_debug_omits_channels_and_buffers() {
        let (tx, _rx) = oneshot::channel();
        assert_eq!(format!("{:?}", DeviceCommand::GetStatus { response: tx }), "GetStatus");

        let cmd = DeviceCommand::ApplyFrame {
            buffer: vec![Rgb::BLACK; 64],
        };
        assert_eq!(format!("{cmd:?}"), "ApplyFrame { units: 64 }");
    }
}
