//! LED state diffing and the throttled update queue
//!
//! Owns the authoritative "what the hardware currently shows" cache and
//! turns desired-state updates into the minimum wire traffic. Hardware links
//! sustain tens of small messages per second at best; naive per-change sends
//! overflow the link and desynchronize visible state from intended state.

use std::collections::HashMap;
use std::time::Instant;

use crate::color::Rgb;

/// Update priority. High entries (playback cursor, UI focus) survive
/// backpressure; low entries are shed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    High,
}

/// One pending wire update for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub unit_index: u16,
    pub target: Rgb,
    pub priority: Priority,
    /// Submission order; last-writer-wins within a flush interval and the
    /// pop order is stable for equal priorities
    seq: u64,
}

/// Outcome of a single update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Differs from the resident color; queued (possibly replacing a
    /// pending entry for the same unit)
    Enqueued,
    /// Equal to the resident color and nothing pending; dropped for free
    Unchanged,
    /// Backpressure: queue past the high-water mark and the entry was low
    /// priority
    Shed,
}

/// Per-device authoritative unit state plus the pending-update set
///
/// Invariants: at most one pending entry per unit index; the resident color
/// is only written after a confirmed send.
pub struct UpdateQueue {
    /// Last color confirmed on the wire, per unit
    resident: Vec<Rgb>,
    /// Whether the unit has ever been sent (resident is meaningful)
    sent_once: Vec<bool>,
    /// When the unit was last written, per unit
    last_sent_at: Vec<Option<Instant>>,
    /// Pending entries keyed by unit index
    pending: HashMap<u16, QueueEntry>,
    /// Backpressure threshold on `pending.len()`
    high_water: usize,
    next_seq: u64,
    dropped_low_priority: u64,
}

impl UpdateQueue {
    pub fn new(unit_count: u16, high_water: usize) -> Self {
        let n = unit_count as usize;
        Self {
            resident: vec![Rgb::BLACK; n],
            sent_once: vec![false; n],
            last_sent_at: vec![None; n],
            pending: HashMap::new(),
            high_water: high_water.max(1),
            next_seq: 0,
            dropped_low_priority: 0,
        }
    }

    /// Request a desired color for one unit.
    ///
    /// No-op when the unit already shows that color and nothing is pending;
    /// otherwise upserts the entry, replacing any pending one for the same
    /// unit (last-writer-wins).
    pub fn request(&mut self, unit_index: u16, target: Rgb, priority: Priority) -> UpdateOutcome {
        let idx = unit_index as usize;
        if idx >= self.resident.len() {
            // Out-of-range units cannot exist on the hardware; ignore.
            return UpdateOutcome::Unchanged;
        }

        match self.pending.get(&unit_index) {
            // A pending entry for this unit exists: replace it in place.
            // This can also cancel back to the resident color, in which case
            // dropping the entry entirely is the cheaper minimal diff.
            Some(_) => {
                if self.sent_once[idx] && self.resident[idx] == target {
                    self.pending.remove(&unit_index);
                    return UpdateOutcome::Unchanged;
                }
                let seq = self.bump_seq();
                self.pending.insert(
                    unit_index,
                    QueueEntry {
                        unit_index,
                        target,
                        priority,
                        seq,
                    },
                );
                UpdateOutcome::Enqueued
            }
            None => {
                if self.sent_once[idx] && self.resident[idx] == target {
                    return UpdateOutcome::Unchanged;
                }
                if self.pending.len() >= self.high_water && priority == Priority::Low {
                    self.dropped_low_priority += 1;
                    return UpdateOutcome::Shed;
                }
                let seq = self.bump_seq();
                self.pending.insert(
                    unit_index,
                    QueueEntry {
                        unit_index,
                        target,
                        priority,
                        seq,
                    },
                );
                UpdateOutcome::Enqueued
            }
        }
    }

    /// Pop up to `n` entries, highest priority first, then submission order.
    ///
    /// Entries leave the pending set; callers must either confirm them with
    /// [`Self::mark_sent`] or put them back with [`Self::restore`].
    pub fn pop_batch(&mut self, n: usize) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.pending.values().copied().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries.truncate(n);
        for entry in &entries {
            self.pending.remove(&entry.unit_index);
        }
        entries
    }

    /// Drain every pending entry and return the dense color run covering
    /// units `0..=max_changed_index` (pending target where present, resident
    /// otherwise). For transports that write contiguous strip prefixes.
    pub fn drain_dense_prefix(&mut self) -> Option<(Vec<Rgb>, Vec<QueueEntry>)> {
        if self.pending.is_empty() {
            return None;
        }
        let max_idx = self.pending.keys().copied().max().unwrap_or(0) as usize;
        let mut colors = self.resident[..=max_idx].to_vec();
        let entries: Vec<QueueEntry> = self.pending.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            colors[entry.unit_index as usize] = entry.target;
        }
        Some((colors, entries))
    }

    /// Record a confirmed send: the resident cache now reflects the entries.
    pub fn mark_sent(&mut self, entries: &[QueueEntry], now: Instant) {
        for entry in entries {
            let idx = entry.unit_index as usize;
            self.resident[idx] = entry.target;
            self.sent_once[idx] = true;
            self.last_sent_at[idx] = Some(now);
        }
    }

    /// Put popped entries back after a failed send, preserving their order.
    /// A newer pending entry for the same unit wins over the restored one.
    pub fn restore(&mut self, entries: Vec<QueueEntry>) {
        for entry in entries {
            self.pending.entry(entry.unit_index).or_insert(entry);
        }
    }

    /// Re-enqueue every unit that has ever been written, at its resident
    /// color. Used after a reconnect: the hardware may have reset, so the
    /// whole known state is replayed through the normal throttled path.
    pub fn requeue_all_resident(&mut self) {
        for idx in 0..self.resident.len() {
            if self.sent_once[idx] {
                let seq = self.bump_seq();
                self.pending.insert(
                    idx as u16,
                    QueueEntry {
                        unit_index: idx as u16,
                        target: self.resident[idx],
                        priority: Priority::Low,
                        seq,
                    },
                );
                // Replay bypasses diffing on purpose; clear the confirmation
                // so the next mark_sent re-establishes it.
                self.sent_once[idx] = false;
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dropped_low_priority(&self) -> u64 {
        self.dropped_low_priority
    }

    /// Resident color snapshot (diagnostics and tests).
    pub fn resident_colors(&self) -> Vec<Rgb> {
        self.resident.clone()
    }

    /// Update the backpressure threshold (config hot reload).
    pub fn set_high_water(&mut self, high_water: usize) {
        self.high_water = high_water.max(1);
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb = Rgb { r: 63, g: 0, b: 0 };
    const BLUE: Rgb = Rgb { r: 0, g: 0, b: 63 };

    fn flush_all(q: &mut UpdateQueue) {
        let now = Instant::now();
        loop {
            let batch = q.pop_batch(16);
            if batch.is_empty() {
                break;
            }
            q.mark_sent(&batch, now);
        }
    }

    #[test]
    fn test_diff_suppresses_resident_color() {
        let mut q = UpdateQueue::new(8, 64);
        assert_eq!(q.request(0, RED, Priority::Low), UpdateOutcome::Enqueued);
        flush_all(&mut q);

        // Same color again: no traffic
        assert_eq!(q.request(0, RED, Priority::Low), UpdateOutcome::Unchanged);
        assert!(q.is_empty());

        // Different color: queued
        assert_eq!(q.request(0, BLUE, Priority::Low), UpdateOutcome::Enqueued);
    }

    #[test]
    fn test_last_writer_wins_per_unit() {
        let mut q = UpdateQueue::new(8, 64);
        q.request(3, RED, Priority::Low);
        q.request(3, BLUE, Priority::Low);

        assert_eq!(q.pending_len(), 1);
        let batch = q.pop_batch(16);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].target, BLUE);
    }

    #[test]
    fn test_update_back_to_resident_cancels_pending() {
        let mut q = UpdateQueue::new(8, 64);
        q.request(2, RED, Priority::Low);
        flush_all(&mut q);

        q.request(2, BLUE, Priority::Low);
        assert_eq!(q.request(2, RED, Priority::Low), UpdateOutcome::Unchanged);
        assert!(q.is_empty());
    }

    #[test]
    fn test_final_state_matches_last_request() {
        let mut q = UpdateQueue::new(8, 64);
        for i in 0..8u16 {
            q.request(i, RED, Priority::Low);
        }
        q.request(4, BLUE, Priority::Low);
        q.request(4, RED, Priority::Low);
        q.request(5, BLUE, Priority::High);
        flush_all(&mut q);

        let colors = q.resident_colors();
        for i in [0usize, 1, 2, 3, 4, 6, 7] {
            assert_eq!(colors[i], RED, "unit {i}");
        }
        assert_eq!(colors[5], BLUE);
    }

    #[test]
    fn test_high_priority_pops_first() {
        let mut q = UpdateQueue::new(8, 64);
        q.request(0, RED, Priority::Low);
        q.request(1, BLUE, Priority::High);
        q.request(2, RED, Priority::Low);

        let batch = q.pop_batch(2);
        assert_eq!(batch[0].unit_index, 1);
        assert_eq!(batch[1].unit_index, 0); // then submission order
    }

    #[test]
    fn test_backpressure_sheds_low_never_high() {
        let mut q = UpdateQueue::new(200, 4);
        for i in 0..4u16 {
            assert_eq!(q.request(i, RED, Priority::Low), UpdateOutcome::Enqueued);
        }
        // Past the high-water mark: low dropped, high accepted
        assert_eq!(q.request(10, RED, Priority::Low), UpdateOutcome::Shed);
        assert_eq!(q.request(11, BLUE, Priority::High), UpdateOutcome::Enqueued);

        assert_eq!(q.dropped_low_priority(), 1);
        assert!(q.pending_len() <= 5);
    }

    #[test]
    fn test_restore_after_failed_send() {
        let mut q = UpdateQueue::new(8, 64);
        q.request(0, RED, Priority::Low);
        let batch = q.pop_batch(16);
        assert!(q.is_empty());

        q.restore(batch);
        assert_eq!(q.pending_len(), 1);

        // A newer request wins over the restored entry
        let batch = q.pop_batch(16);
        q.restore(batch);
        q.request(0, BLUE, Priority::Low);
        let batch = q.pop_batch(16);
        assert_eq!(batch[0].target, BLUE);
    }

    #[test]
    fn test_dense_prefix_covers_gap_with_resident() {
        let mut q = UpdateQueue::new(8, 64);
        q.request(0, RED, Priority::Low);
        flush_all(&mut q);

        q.request(3, BLUE, Priority::Low);
        let (colors, entries) = q.drain_dense_prefix().unwrap();
        assert_eq!(colors.len(), 4); // units 0..=3
        assert_eq!(colors[0], RED); // resident fills the gap
        assert_eq!(colors[1], Rgb::BLACK);
        assert_eq!(colors[3], BLUE);
        assert_eq!(entries.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_requeue_all_resident_replays_known_state() {
        let mut q = UpdateQueue::new(8, 64);
        q.request(0, RED, Priority::Low);
        q.request(5, BLUE, Priority::Low);
        flush_all(&mut q);

        q.requeue_all_resident();
        assert_eq!(q.pending_len(), 2);
        flush_all(&mut q);
        assert_eq!(q.resident_colors()[0], RED);
        assert_eq!(q.resident_colors()[5], BLUE);
    }
}
