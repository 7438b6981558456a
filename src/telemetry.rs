use crate::error::DecodeError;
use crate::registry::{DeviceId, DeviceRegistry};
use crate::transport::{FailureKind, RegisterPayload};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time view of one device's telemetry slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SlotSnapshot {
    /// Last-known-good register values. Kept across failures.
    pub values: RegisterPayload,
    pub valid: bool,
    pub last_updated_at: Option<u64>,
    pub update_count: u64,
    pub failure_count: u64,
    pub last_failure: Option<SlotFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotFailure {
    Transport(FailureKind),
    Decode,
    /// The device's turn came while the bus was still held by another device.
    Skipped,
}

/// One device's slot. Written only by the completion path; readers get a
/// consistent snapshot without taking a lock.
#[derive(Debug)]
pub struct TelemetrySlot {
    expected_len: u16,
    state: ArcSwap<SlotSnapshot>,
}

impl TelemetrySlot {
    fn new(expected_len: u16) -> Self {
        Self {
            expected_len,
            state: ArcSwap::from_pointee(SlotSnapshot::default()),
        }
    }

    pub fn expected_len(&self) -> u16 {
        self.expected_len
    }

    fn mark_failed(&self, failure: SlotFailure) {
        let current = self.state.load_full();
        let mut next = SlotSnapshot::clone(&current);
        next.valid = false;
        next.failure_count += 1;
        next.last_failure = Some(failure);
        self.state.store(Arc::new(next));
    }
}

/// Aggregate counters, readable from any thread.
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    requests_issued: AtomicU64,
    requests_failed: AtomicU64,
    issue_rejections: AtomicU64,
    timeouts: AtomicU64,
    malformed_frames: AtomicU64,
    checksum_errors: AtomicU64,
    decode_errors: AtomicU64,
    stale_completions: AtomicU64,
    cycles_completed: AtomicU64,
    cycle_overruns: AtomicU64,
    last_cycle_elapsed_ms: AtomicU64,
    last_cycle_overrun: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CounterSnapshot {
    pub requests_issued: u64,
    pub requests_failed: u64,
    pub issue_rejections: u64,
    pub timeouts: u64,
    pub malformed_frames: u64,
    pub checksum_errors: u64,
    pub decode_errors: u64,
    pub stale_completions: u64,
    pub cycles_completed: u64,
    pub cycle_overruns: u64,
    pub last_cycle_elapsed_ms: u64,
    pub last_cycle_overrun: bool,
}

impl CounterSnapshot {
    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        match kind {
            FailureKind::Timeout => self.timeouts,
            FailureKind::MalformedFrame => self.malformed_frames,
            FailureKind::ChecksumError => self.checksum_errors,
        }
    }
}

/// Latest decoded values per device plus bus-wide counters.
///
/// Shared as `Arc<TelemetryStore>`: the poller writes, status consumers read.
#[derive(Debug)]
pub struct TelemetryStore {
    slots: alloc::vec::Vec<TelemetrySlot>,
    counters: TelemetryCounters,
}

impl TelemetryStore {
    pub fn new(registry: &DeviceRegistry) -> Self {
        Self {
            slots: registry.iter().map(|(_, d)| TelemetrySlot::new(d.register_count)).collect(),
            counters: TelemetryCounters::default(),
        }
    }

    fn slot(&self, device: DeviceId) -> Result<&TelemetrySlot, DecodeError> {
        self.slots.get(device.0).ok_or(DecodeError::UnknownDevice(device))
    }

    /// Overwrite a slot with a freshly decoded payload.
    ///
    /// Rejects payloads whose length differs from the device's register count
    /// without touching the slot; the caller decides how to account for it.
    pub fn update(&self, device: DeviceId, payload: &[u16], current_time: u64) -> Result<(), DecodeError> {
        let slot = self.slot(device)?;
        if payload.len() != usize::from(slot.expected_len) {
            return Err(DecodeError::LengthMismatch {
                device,
                expected: slot.expected_len,
                actual: payload.len(),
            });
        }

        let current = slot.state.load_full();
        let mut values = RegisterPayload::new();
        values
            .extend_from_slice(payload)
            .map_err(|()| DecodeError::LengthMismatch {
                device,
                expected: slot.expected_len,
                actual: payload.len(),
            })?;

        // timestamps never run backwards, even if the caller's clock does
        let stamp = current.last_updated_at.map_or(current_time, |t| t.max(current_time));

        slot.state.store(Arc::new(SlotSnapshot {
            values,
            valid: true,
            last_updated_at: Some(stamp),
            update_count: current.update_count + 1,
            failure_count: current.failure_count,
            last_failure: current.last_failure,
        }));
        Ok(())
    }

    /// Mark a slot stale after a transport failure. Values are left in place.
    pub fn record_failure(&self, device: DeviceId, kind: FailureKind) {
        if let Ok(slot) = self.slot(device) {
            slot.mark_failed(SlotFailure::Transport(kind));
        }
        self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            FailureKind::Timeout => &self.counters.timeouts,
            FailureKind::MalformedFrame => &self.counters.malformed_frames,
            FailureKind::ChecksumError => &self.counters.checksum_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a slot stale after a response that did not fit it.
    pub fn record_decode_error(&self, device: DeviceId) {
        if let Ok(slot) = self.slot(device) {
            slot.mark_failed(SlotFailure::Decode);
        }
        self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a slot stale after its poll attempt was skipped. Values are left
    /// in place.
    pub fn record_skipped(&self, device: DeviceId) {
        if let Ok(slot) = self.slot(device) {
            slot.mark_failed(SlotFailure::Skipped);
        }
        self.counters.issue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_issued(&self) {
        self.counters.requests_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_completions(&self, count: u64) {
        if count > 0 {
            self.counters.stale_completions.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_cycle(&self, elapsed_ms: u64, overrun: bool) {
        self.counters.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.counters.last_cycle_elapsed_ms.store(elapsed_ms, Ordering::Relaxed);
        self.counters.last_cycle_overrun.store(overrun, Ordering::Relaxed);
        if overrun {
            self.counters.cycle_overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, device: DeviceId) -> Option<Arc<SlotSnapshot>> {
        self.slots.get(device.0).map(|slot| slot.state.load_full())
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            requests_issued: c.requests_issued.load(Ordering::Relaxed),
            requests_failed: c.requests_failed.load(Ordering::Relaxed),
            issue_rejections: c.issue_rejections.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            malformed_frames: c.malformed_frames.load(Ordering::Relaxed),
            checksum_errors: c.checksum_errors.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            stale_completions: c.stale_completions.load(Ordering::Relaxed),
            cycles_completed: c.cycles_completed.load(Ordering::Relaxed),
            cycle_overruns: c.cycle_overruns.load(Ordering::Relaxed),
            last_cycle_elapsed_ms: c.last_cycle_elapsed_ms.load(Ordering::Relaxed),
            last_cycle_overrun: c.last_cycle_overrun.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceDescriptor, FunctionCode};

    fn store() -> TelemetryStore {
        let registry = DeviceRegistry::new([
            DeviceDescriptor::new(28, 28, FunctionCode::ReadInputRegisters, 0, 4, 50),
            DeviceDescriptor::new(1, 1, FunctionCode::ReadInputRegisters, 1, 2, 1000),
        ])
        .unwrap();
        TelemetryStore::new(&registry)
    }

    #[test]
    fn test_slots_start_empty_and_invalid() {
        let store = store();
        let snap = store.snapshot(DeviceId(1)).unwrap();
        assert!(!snap.valid);
        assert!(snap.values.is_empty());
        assert_eq!(snap.last_updated_at, None);
        assert!(store.snapshot(DeviceId(5)).is_none());
    }

    #[test]
    fn test_update_marks_valid() {
        let store = store();
        store.update(DeviceId(1), &[231, 455], 1000).unwrap();
        let snap = store.snapshot(DeviceId(1)).unwrap();
        assert!(snap.valid);
        assert_eq!(&snap.values[..], &[231, 455]);
        assert_eq!(snap.last_updated_at, Some(1000));
        assert_eq!(snap.update_count, 1);
    }

    #[test]
    fn test_length_mismatch_leaves_slot_untouched() {
        let store = store();
        store.update(DeviceId(1), &[231, 455], 1000).unwrap();

        let result = store.update(DeviceId(1), &[1, 2, 3], 2000);
        assert_eq!(
            result,
            Err(DecodeError::LengthMismatch { device: DeviceId(1), expected: 2, actual: 3 })
        );
        let snap = store.snapshot(DeviceId(1)).unwrap();
        assert!(snap.valid);
        assert_eq!(snap.last_updated_at, Some(1000));
    }

    #[test]
    fn test_failure_keeps_last_known_values() {
        let store = store();
        store.update(DeviceId(0), &[1, 2, 3, 4], 100).unwrap();
        store.record_failure(DeviceId(0), FailureKind::Timeout);

        let snap = store.snapshot(DeviceId(0)).unwrap();
        assert!(!snap.valid);
        assert_eq!(&snap.values[..], &[1, 2, 3, 4]);
        assert_eq!(snap.last_failure, Some(SlotFailure::Transport(FailureKind::Timeout)));

        let counters = store.counters();
        assert_eq!(counters.timeouts, 1);
        assert_eq!(counters.requests_failed, 1);
        assert_eq!(counters.failures_of(FailureKind::MalformedFrame), 0);
    }

    #[test]
    fn test_skipped_poll_marks_slot_stale() {
        let store = store();
        store.update(DeviceId(1), &[231, 455], 260).unwrap();
        store.record_skipped(DeviceId(1));

        let snap = store.snapshot(DeviceId(1)).unwrap();
        assert!(!snap.valid);
        assert_eq!(&snap.values[..], &[231, 455]);
        assert_eq!(snap.last_updated_at, Some(260));
        assert_eq!(snap.last_failure, Some(SlotFailure::Skipped));

        let counters = store.counters();
        assert_eq!(counters.issue_rejections, 1);
        assert_eq!(counters.requests_failed, 0);
    }

    #[test]
    fn test_decode_errors_counted_separately() {
        let store = store();
        store.record_decode_error(DeviceId(0));
        let counters = store.counters();
        assert_eq!(counters.decode_errors, 1);
        assert_eq!(counters.requests_failed, 1);
        assert_eq!(counters.timeouts, 0);
    }

    #[test]
    fn test_timestamp_is_monotonic() {
        let store = store();
        store.update(DeviceId(1), &[1, 1], 5000).unwrap();
        store.update(DeviceId(1), &[2, 2], 4000).unwrap();
        let snap = store.snapshot(DeviceId(1)).unwrap();
        assert_eq!(snap.last_updated_at, Some(5000));
        assert_eq!(&snap.values[..], &[2, 2]);
    }

    #[test]
    fn test_cycle_accounting() {
        let store = store();
        store.record_cycle(4000, false);
        store.record_cycle(6000, true);
        let counters = store.counters();
        assert_eq!(counters.cycles_completed, 2);
        assert_eq!(counters.cycle_overruns, 1);
        assert!(counters.last_cycle_overrun);
        assert_eq!(counters.last_cycle_elapsed_ms, 6000);
    }
}
