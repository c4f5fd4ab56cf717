//! Device session actor
//!
//! One task per device owning the link, the codec, and the update queue.
//! The session runs the connection state machine:
//!
//! ```text
//! Connecting -> Connected <-> Error -> (backoff) -> Connecting
//!                                  \-> Stale (attempt cap reached, parked
//!                                       until RetryNow)
//! ```
//!
//! While connected it flushes the queue on a short interval, probes the
//! device on the heartbeat interval, and decodes inbound packets into input
//! events. Desired state survives every transition; after a reconnect the
//! full resident state is replayed through the normal throttled path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::events::{CoreEvent, EventBus};
use crate::gateway::GatewayError;
use crate::queue::{Priority, UpdateOutcome, UpdateQueue};
use crate::transport::{warls, LedUpdate, TransportCodec, WireMode};

use super::commands::{DeviceCommand, DeviceCounters, DeviceTuning};
use super::handle::DeviceHandle;
use super::link::TransportLink;
use super::{ConnectionStatus, Device};

/// Cap on one connection attempt, handshake included
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive unanswered heartbeats before the link is declared dead
const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Reconnect delay for a zero-based attempt index: exponential from the base,
/// capped at the max.
pub fn backoff_delay(tuning: &DeviceTuning, attempt_index: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
    let ms = tuning
        .reconnect_base_delay_ms
        .saturating_mul(factor)
        .min(tuning.reconnect_max_delay_ms);
    Duration::from_millis(ms)
}

enum CommandFlow {
    Continue,
    /// Tuning changed; timers must be rebuilt
    Retune,
    /// RetryNow accepted; restart the connect cycle
    Reconnect,
    Exit,
}

enum Flow {
    Continue,
    Exit,
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The session actor. Spawn with [`DeviceWorker::spawn`]; interact through
/// the returned [`DeviceHandle`].
pub struct DeviceWorker {
    device: Device,
    codec: TransportCodec,
    link: Box<dyn TransportLink>,
    tuning: DeviceTuning,
    queue: UpdateQueue,
    status: ConnectionStatus,
    attempt: u32,
    counters: DeviceCounters,
    command_rx: mpsc::UnboundedReceiver<DeviceCommand>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    event_bus: Arc<EventBus>,
    heartbeat_misses: u32,
    awaiting_heartbeat_reply: bool,
}

impl DeviceWorker {
    pub fn spawn(
        device: Device,
        codec: TransportCodec,
        link: Box<dyn TransportLink>,
        tuning: DeviceTuning,
        event_bus: Arc<EventBus>,
    ) -> DeviceHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::new(device.id.clone(), cmd_tx);

        let worker = DeviceWorker {
            queue: UpdateQueue::new(device.unit_count, tuning.queue_high_water),
            device,
            codec,
            link,
            tuning,
            status: ConnectionStatus::Idle,
            attempt: 0,
            counters: DeviceCounters::default(),
            command_rx: cmd_rx,
            inbound_rx: None,
            event_bus,
            heartbeat_misses: 0,
            awaiting_heartbeat_reply: false,
        };
        tokio::spawn(worker.run());
        handle
    }

    async fn run(mut self) {
        info!(device_id = self.device.id, "Device session started");
        self.set_status(ConnectionStatus::Connecting);

        loop {
            let flow = match self.status {
                ConnectionStatus::Connecting => {
                    self.connect_once().await;
                    Flow::Continue
                }
                ConnectionStatus::Connected => self.connected_phase().await,
                ConnectionStatus::Error => self.backoff_phase().await,
                ConnectionStatus::Idle
                | ConnectionStatus::Stale
                | ConnectionStatus::Disconnected => self.parked_phase().await,
            };
            if matches!(flow, Flow::Exit) {
                break;
            }
        }

        self.link.close().await;
        self.set_status(ConnectionStatus::Disconnected);
        info!(
            device_id = self.device.id,
            sends = self.counters.sends,
            "Device session terminated"
        );
    }

    /// One connection attempt: open the link, run the identity handshake,
    /// then replay resident state.
    async fn connect_once(&mut self) {
        self.counters.connect_attempts += 1;
        trace!(
            device_id = self.device.id,
            attempt = self.attempt,
            "Connecting"
        );

        let result = match timeout(CONNECT_TIMEOUT, self.establish()).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::ConnectionTimeout {
                device_id: self.device.id.clone(),
            }
            .into()),
        };

        match result {
            Ok(()) => {
                self.attempt = 0;
                self.heartbeat_misses = 0;
                self.awaiting_heartbeat_reply = false;
                // The hardware may have rebooted; replay everything we know
                self.queue.requeue_all_resident();
                info!(device_id = self.device.id, "Device connected");
                self.set_status(ConnectionStatus::Connected);
            }
            Err(e) => {
                self.link.close().await;
                self.inbound_rx = None;
                self.attempt += 1;
                warn!(
                    device_id = self.device.id,
                    attempt = self.attempt,
                    error = %e,
                    "Connection attempt failed"
                );
                if self.attempt >= self.tuning.max_reconnect_attempts {
                    warn!(
                        device_id = self.device.id,
                        "Reconnect attempts exhausted, parking session as stale"
                    );
                    self.set_status(ConnectionStatus::Stale);
                } else {
                    self.set_status(ConnectionStatus::Error);
                }
            }
        }
    }

    async fn establish(&mut self) -> anyhow::Result<()> {
        self.link.open().await?;
        self.inbound_rx = self.link.take_inbound();

        match &self.codec {
            // In-band handshake with a required reply
            TransportCodec::GridSysex(_) => {
                let request = self
                    .codec
                    .encode_handshake()
                    .expect("grid codecs always handshake");
                self.link.send(&request).await?;

                let rx = self
                    .inbound_rx
                    .as_mut()
                    .ok_or_else(|| anyhow::anyhow!("link has no inbound stream"))?;
                loop {
                    let bytes = rx
                        .recv()
                        .await
                        .ok_or_else(|| anyhow::anyhow!("inbound closed during handshake"))?;
                    if self.codec.is_handshake_reply(&bytes) {
                        break;
                    }
                    // Unrelated traffic during the handshake is not an error
                }
            }
            // Out-of-band identity probe
            TransportCodec::WledJson => {
                let body = self.link.probe().await?;
                self.codec.verify_identity(&body, self.device.unit_count)?;
            }
            // Hello is fire-and-forget; the bridge answers asynchronously
            TransportCodec::Relay { .. } => {
                if let Some(hello) = self.codec.encode_handshake() {
                    self.link.send(&hello).await?;
                }
            }
            // Connectionless; an open socket is as good as it gets
            TransportCodec::Warls => {}
        }
        Ok(())
    }

    async fn connected_phase(&mut self) -> Flow {
        let flush_period = Duration::from_millis(self.tuning.flush_interval_ms.max(1));
        let hb_period = Duration::from_millis(self.tuning.heartbeat_interval_ms.max(100));
        let mut flush = interval_at(Instant::now() + flush_period, flush_period);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = interval_at(Instant::now() + hb_period, hb_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { return Flow::Exit };
                    match self.handle_command(cmd) {
                        CommandFlow::Exit => return Flow::Exit,
                        CommandFlow::Retune => return Flow::Continue,
                        CommandFlow::Reconnect | CommandFlow::Continue => {}
                    }
                }
                _ = flush.tick(), if !self.queue.is_empty() => {
                    if !self.flush_pending().await {
                        self.fail_link("send failed").await;
                        return Flow::Continue;
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.run_heartbeat().await {
                        self.fail_link("heartbeat lost").await;
                        return Flow::Continue;
                    }
                }
                bytes = recv_opt(&mut self.inbound_rx) => {
                    match bytes {
                        Some(bytes) => self.on_inbound(&bytes),
                        None => {
                            self.fail_link("inbound stream closed").await;
                            return Flow::Continue;
                        }
                    }
                }
            }
        }
    }

    async fn backoff_phase(&mut self) -> Flow {
        let delay = backoff_delay(&self.tuning, self.attempt.saturating_sub(1));
        debug!(
            device_id = self.device.id,
            delay_ms = delay.as_millis() as u64,
            "Backing off before reconnect"
        );
        let deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.set_status(ConnectionStatus::Connecting);
                    return Flow::Continue;
                }
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { return Flow::Exit };
                    match self.handle_command(cmd) {
                        CommandFlow::Exit => return Flow::Exit,
                        CommandFlow::Reconnect => {
                            self.set_status(ConnectionStatus::Connecting);
                            return Flow::Continue;
                        }
                        CommandFlow::Retune | CommandFlow::Continue => {}
                    }
                }
            }
        }
    }

    /// Stale or idle: nothing happens until someone asks for a retry or a
    /// shutdown. Incoming updates are refused and counted.
    async fn parked_phase(&mut self) -> Flow {
        loop {
            let Some(cmd) = self.command_rx.recv().await else {
                return Flow::Exit;
            };
            match self.handle_command(cmd) {
                CommandFlow::Exit => return Flow::Exit,
                CommandFlow::Reconnect => {
                    self.set_status(ConnectionStatus::Connecting);
                    return Flow::Continue;
                }
                CommandFlow::Retune | CommandFlow::Continue => {}
            }
        }
    }

    fn handle_command(&mut self, cmd: DeviceCommand) -> CommandFlow {
        trace!(device_id = self.device.id, ?cmd, "Processing command");
        match cmd {
            DeviceCommand::RequestUpdate {
                unit_index,
                color,
                priority,
            } => {
                if self.is_parked() {
                    self.counters.dropped_disconnected += 1;
                    return CommandFlow::Continue;
                }
                let clamped = color.clamp_to(self.device.capabilities.channel_max());
                if self.queue.request(unit_index, clamped, priority) == UpdateOutcome::Shed {
                    self.counters.dropped_low_priority += 1;
                    let fault = GatewayError::QueueOverflow {
                        device_id: self.device.id.clone(),
                    };
                    debug!(unit_index, error = %fault, "Update shed");
                }
                CommandFlow::Continue
            }
            DeviceCommand::ApplyFrame { buffer } => {
                if self.is_parked() {
                    self.counters.dropped_disconnected += 1;
                    return CommandFlow::Continue;
                }
                let max = self.device.capabilities.channel_max();
                for (i, color) in buffer.iter().take(self.device.unit_count as usize).enumerate() {
                    // Composited frames go through the same diff path, so an
                    // unchanged frame produces zero wire traffic
                    if self.queue.request(i as u16, color.clamp_to(max), Priority::Low)
                        == UpdateOutcome::Shed
                    {
                        self.counters.dropped_low_priority += 1;
                    }
                }
                CommandFlow::Continue
            }
            DeviceCommand::RetryNow => {
                if self.status.is_down() && self.status != ConnectionStatus::Connecting {
                    info!(device_id = self.device.id, "Manual retry requested");
                    self.attempt = 0;
                    CommandFlow::Reconnect
                } else {
                    CommandFlow::Continue
                }
            }
            DeviceCommand::UpdateTuning(tuning) => {
                debug!(device_id = self.device.id, "Session tuning updated");
                self.queue.set_high_water(tuning.queue_high_water);
                self.tuning = tuning;
                CommandFlow::Retune
            }
            DeviceCommand::GetStatus { response } => {
                let _ = response.send(self.status);
                CommandFlow::Continue
            }
            DeviceCommand::GetUnitColors { response } => {
                let _ = response.send(self.queue.resident_colors());
                CommandFlow::Continue
            }
            DeviceCommand::GetCounters { response } => {
                let mut counters = self.counters;
                counters.dropped_low_priority += self.queue.dropped_low_priority();
                let _ = response.send(counters);
                CommandFlow::Continue
            }
            DeviceCommand::Shutdown => {
                info!(device_id = self.device.id, "Shutdown requested");
                CommandFlow::Exit
            }
        }
    }

    /// Flush one batch of pending updates. Returns false on link failure;
    /// the popped entries are restored first so nothing is lost.
    async fn flush_pending(&mut self) -> bool {
        let caps = self.device.capabilities.clone();

        match self.codec.wire_mode() {
            WireMode::Sparse => {
                let entries = self.queue.pop_batch(self.tuning.batch_size);
                if entries.is_empty() {
                    return true;
                }
                let updates: Vec<LedUpdate> = entries
                    .iter()
                    .map(|e| LedUpdate {
                        index: e.unit_index,
                        color: e.target,
                    })
                    .collect();
                match self.codec.encode_led_batch(&updates, &caps) {
                    Ok(bytes) => self.send_entries(entries, &bytes).await,
                    Err(e) => {
                        // Unencodable updates are dropped, not retried
                        let fault = GatewayError::TransportEncode(e);
                        warn!(device_id = self.device.id, error = %fault, "Encode failed, batch dropped");
                        true
                    }
                }
            }
            WireMode::DensePrefix => {
                let Some((colors, entries)) = self.queue.drain_dense_prefix() else {
                    return true;
                };
                let hold = warls::realtime_hold_secs(self.tuning.heartbeat_interval_ms);
                match self.codec.encode_strip(&colors, &caps, hold) {
                    Ok(bytes) => self.send_entries(entries, &bytes).await,
                    Err(e) => {
                        let fault = GatewayError::TransportEncode(e);
                        warn!(device_id = self.device.id, error = %fault, "Encode failed, batch dropped");
                        true
                    }
                }
            }
        }
    }

    async fn send_entries(&mut self, entries: Vec<crate::queue::QueueEntry>, bytes: &[u8]) -> bool {
        match self.link.send(bytes).await {
            Ok(()) => {
                self.counters.sends += 1;
                self.queue.mark_sent(&entries, std::time::Instant::now());
                trace!(
                    device_id = self.device.id,
                    units = entries.len(),
                    bytes = bytes.len(),
                    "Batch sent"
                );
                true
            }
            Err(e) => {
                warn!(device_id = self.device.id, error = %e, "Send failed, batch restored");
                self.queue.restore(entries);
                false
            }
        }
    }

    /// One heartbeat cycle. Returns false when the link should be declared
    /// dead.
    async fn run_heartbeat(&mut self) -> bool {
        let codec = self.codec.clone();
        match codec {
            // In-band probe; the reply arrives on the inbound stream
            TransportCodec::GridSysex(_) => {
                if self.awaiting_heartbeat_reply {
                    self.heartbeat_misses += 1;
                    debug!(
                        device_id = self.device.id,
                        misses = self.heartbeat_misses,
                        "Heartbeat unanswered"
                    );
                    if self.heartbeat_misses >= HEARTBEAT_MISS_LIMIT {
                        return false;
                    }
                }
                let probe = codec.encode_heartbeat().expect("grid codecs heartbeat in-band");
                if self.link.send(&probe).await.is_err() {
                    return false;
                }
                self.awaiting_heartbeat_reply = true;
                true
            }
            // Out-of-band probe with a synchronous answer
            TransportCodec::WledJson => match self.link.probe().await {
                Ok(body) => {
                    if codec.verify_identity(&body, self.device.unit_count).is_err() {
                        warn!(device_id = self.device.id, "Device identity changed");
                        return false;
                    }
                    self.heartbeat_misses = 0;
                    true
                }
                Err(e) => {
                    self.heartbeat_misses += 1;
                    debug!(device_id = self.device.id, error = %e, misses = self.heartbeat_misses, "Heartbeat probe failed");
                    self.heartbeat_misses < HEARTBEAT_MISS_LIMIT
                }
            },
            // Fire-and-forget transports: re-sending the resident strip
            // doubles as the keep-alive for the device's realtime window.
            // A successful send is the only ack we get.
            TransportCodec::Warls | TransportCodec::Relay { .. } => {
                if self.counters.sends == 0 {
                    // Nothing shown yet; stay off the device's own program
                    return true;
                }
                let colors = self.queue.resident_colors();
                let caps = self.device.capabilities.clone();
                let hold = warls::realtime_hold_secs(self.tuning.heartbeat_interval_ms);
                match codec.encode_strip(&colors, &caps, hold) {
                    Ok(bytes) => {
                        if self.link.send(&bytes).await.is_ok() {
                            self.heartbeat_misses = 0;
                            true
                        } else {
                            self.heartbeat_misses += 1;
                            self.heartbeat_misses < HEARTBEAT_MISS_LIMIT
                        }
                    }
                    Err(_) => true,
                }
            }
        }
    }

    fn on_inbound(&mut self, bytes: &[u8]) {
        if self.codec.is_handshake_reply(bytes) {
            self.heartbeat_misses = 0;
            self.awaiting_heartbeat_reply = false;
            trace!(device_id = self.device.id, "Heartbeat reply received");
            return;
        }

        match self
            .codec
            .decode(&self.device.id, &self.device.capabilities, bytes)
        {
            Ok(events) => {
                for event in events {
                    trace!(device_id = self.device.id, ?event, "Input event");
                    self.event_bus.publish(CoreEvent::Input(event));
                }
            }
            Err(e) => {
                self.counters.decode_errors += 1;
                debug!(device_id = self.device.id, error = %e, "Inbound packet dropped");
            }
        }
    }

    async fn fail_link(&mut self, reason: &str) {
        warn!(device_id = self.device.id, reason, "Link lost, reconnecting");
        self.link.close().await;
        self.inbound_rx = None;
        self.awaiting_heartbeat_reply = false;
        self.heartbeat_misses = 0;
        self.attempt += 1;
        if self.attempt >= self.tuning.max_reconnect_attempts {
            self.set_status(ConnectionStatus::Stale);
        } else {
            self.set_status(ConnectionStatus::Error);
        }
    }

    fn is_parked(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Stale | ConnectionStatus::Disconnected
        )
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.event_bus.publish(CoreEvent::ConnectionChange {
            device_id: self.device.id.clone(),
            status,
        });
    }
}
