//! Cooperative poll sequencer.
//!
//! Walks the enabled devices in registry order, one transaction per device,
//! holding a per-device settle window after each issue. After the last device
//! a finalize step pads the cycle to the configured budget. Every wait is a
//! deadline checked on the next tick; nothing here sleeps.

use crate::cycle::{CycleCompensator, CycleOutcome};
use crate::error::IssueError;
use crate::registry::{DeviceDescriptor, DeviceId, DeviceRegistry, MAX_DEVICES};
use crate::transaction::{Accepted, BusTransactionManager};
use crate::transport::BusTransport;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The seam between the sequencer and whatever puts requests on the bus.
pub trait TransactionIssuer {
    fn issue(
        &mut self,
        device: DeviceId,
        descriptor: &DeviceDescriptor,
        current_time: u64,
    ) -> Result<Accepted, IssueError>;
}

impl<T: BusTransport> TransactionIssuer for BusTransactionManager<T> {
    fn issue(
        &mut self,
        device: DeviceId,
        descriptor: &DeviceDescriptor,
        current_time: u64,
    ) -> Result<Accepted, IssueError> {
        BusTransactionManager::issue(self, device, descriptor, current_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerState {
    /// Position in the poll order, not a registry index.
    Device(usize),
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Issue(IssueError),
    UnknownDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Waiting { until: u64 },
    Issued { device: DeviceId, accepted: Accepted, settle_until: u64 },
    Skipped { device: DeviceId, reason: SkipReason },
    CycleComplete(CycleOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SequencerStats {
    pub total_ticks: u64,
    pub total_issued: u64,
    pub total_skipped: u64,
    pub cycles_completed: u64,
    pub cycle_overruns: u64,
    pub last_cycle_elapsed_ms: Option<u64>,
}

#[derive(Debug)]
pub struct Sequencer {
    registry: Arc<DeviceRegistry>,
    order: Vec<DeviceId, MAX_DEVICES>,
    state: SequencerState,
    wait_until: Option<u64>,
    cycle_start: Option<u64>,
    compensator: CycleCompensator,
    stats: SequencerStats,
}

impl Sequencer {
    pub fn new(registry: Arc<DeviceRegistry>, compensator: CycleCompensator) -> Self {
        let mut order: Vec<DeviceId, MAX_DEVICES> = Vec::new();
        for id in registry.enabled() {
            let pushed = order.push(id);
            debug_assert!(pushed.is_ok(), "poll order has the registry's capacity");
        }

        let state = Self::first_state(&order);
        Self {
            registry,
            order,
            state,
            wait_until: None,
            cycle_start: None,
            compensator,
            stats: SequencerStats::default(),
        }
    }

    fn first_state(order: &[DeviceId]) -> SequencerState {
        if order.is_empty() {
            SequencerState::Finalize
        } else {
            SequencerState::Device(0)
        }
    }

    fn state_after(&self, position: usize) -> SequencerState {
        if position + 1 < self.order.len() {
            SequencerState::Device(position + 1)
        } else {
            SequencerState::Finalize
        }
    }

    /// Advance the state machine by at most one step. Returns immediately
    /// while a settle or padding window is still open.
    pub fn tick<I: TransactionIssuer>(&mut self, current_time: u64, issuer: &mut I) -> TickOutcome {
        self.stats.total_ticks += 1;

        if let Some(until) = self.wait_until {
            if current_time < until {
                return TickOutcome::Waiting { until };
            }
        }
        self.wait_until = None;

        match self.state {
            SequencerState::Device(position) => self.run_device(position, current_time, issuer),
            SequencerState::Finalize => self.finalize(current_time),
        }
    }

    fn run_device<I: TransactionIssuer>(
        &mut self,
        position: usize,
        current_time: u64,
        issuer: &mut I,
    ) -> TickOutcome {
        if position == 0 {
            self.cycle_start = Some(current_time);
        }
        let next_state = self.state_after(position);

        let Some(device) = self.order.get(position).copied() else {
            self.state = SequencerState::Finalize;
            return TickOutcome::CycleComplete(self.close_cycle(current_time));
        };

        let registry = Arc::clone(&self.registry);
        let Some(descriptor) = registry.get(device) else {
            warn!("Device {} missing from registry, skipping", device);
            self.stats.total_skipped += 1;
            self.state = next_state;
            return TickOutcome::Skipped { device, reason: SkipReason::UnknownDevice };
        };

        match issuer.issue(device, descriptor, current_time) {
            Ok(accepted) => {
                self.stats.total_issued += 1;
                let settle_until = current_time.saturating_add(descriptor.settle_delay_ms);
                if descriptor.settle_delay_ms > 0 {
                    self.wait_until = Some(settle_until);
                }
                self.state = next_state;
                TickOutcome::Issued { device, accepted, settle_until }
            }
            Err(error) => {
                // never wedge on a failed issue: move on without settling
                warn!("Bus contention polling device {}: {}", descriptor.address, error);
                self.stats.total_skipped += 1;
                self.state = next_state;
                TickOutcome::Skipped { device, reason: SkipReason::Issue(error) }
            }
        }
    }

    fn finalize(&mut self, current_time: u64) -> TickOutcome {
        let outcome = self.close_cycle(current_time);
        self.state = Self::first_state(&self.order);
        TickOutcome::CycleComplete(outcome)
    }

    fn close_cycle(&mut self, current_time: u64) -> CycleOutcome {
        let start = self.cycle_start.take().unwrap_or(current_time);
        let outcome = self.compensator.evaluate(start, current_time);

        match outcome {
            CycleOutcome::OnTime { elapsed_ms, wait_ms } => {
                debug!("Poll cycle took {} ms, padding {} ms", elapsed_ms, wait_ms);
                if wait_ms > 0 {
                    self.wait_until = Some(current_time.saturating_add(wait_ms));
                }
            }
            CycleOutcome::Overrun { elapsed_ms, excess_ms } => {
                warn!(
                    "Poll cycle overrun: {} ms against a {} ms budget ({} ms over), starting next cycle now",
                    elapsed_ms,
                    self.compensator.budget_ms(),
                    excess_ms
                );
                self.stats.cycle_overruns += 1;
            }
        }

        self.stats.cycles_completed += 1;
        self.stats.last_cycle_elapsed_ms = Some(outcome.elapsed_ms());
        outcome
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn wait_until(&self) -> Option<u64> {
        self.wait_until
    }

    pub fn cycle_start(&self) -> Option<u64> {
        self.cycle_start
    }

    pub fn poll_order(&self) -> &[DeviceId] {
        &self.order
    }

    pub fn budget_ms(&self) -> u64 {
        self.compensator.budget_ms()
    }

    pub fn get_stats(&self) -> &SequencerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionCode;

    /// Accepts everything, or refuses everything with `BusBusy`.
    struct FakeIssuer {
        issued: alloc::vec::Vec<(DeviceId, u64)>,
        busy: bool,
        next_id: u64,
    }

    impl FakeIssuer {
        fn new() -> Self {
            Self { issued: alloc::vec::Vec::new(), busy: false, next_id: 1 }
        }
    }

    impl TransactionIssuer for FakeIssuer {
        fn issue(
            &mut self,
            device: DeviceId,
            descriptor: &DeviceDescriptor,
            current_time: u64,
        ) -> Result<Accepted, IssueError> {
            if self.busy {
                return Err(IssueError::BusBusy { pending_token: 0, pending_transaction: 0 });
            }
            self.issued.push((device, current_time));
            self.next_id += 1;
            Ok(Accepted { transaction_id: self.next_id, token: descriptor.token, deadline: current_time + 2000 })
        }
    }

    fn registry(settles: &[u64]) -> Arc<DeviceRegistry> {
        let devices = settles.iter().enumerate().map(|(i, &settle)| {
            let address = (i + 1) as u8;
            DeviceDescriptor::new(address, u32::from(address), FunctionCode::ReadHoldingRegisters, 0, 1, settle)
        });
        Arc::new(DeviceRegistry::new(devices).unwrap())
    }

    #[test]
    fn test_initial_state() {
        let sequencer = Sequencer::new(registry(&[50, 200]), CycleCompensator::new(5000));
        assert_eq!(sequencer.state(), SequencerState::Device(0));
        assert_eq!(sequencer.wait_until(), None);
        assert_eq!(sequencer.poll_order(), &[DeviceId(0), DeviceId(1)]);
    }

    #[test]
    fn test_settle_window_blocks_advance() {
        let mut sequencer = Sequencer::new(registry(&[50, 200]), CycleCompensator::new(5000));
        let mut issuer = FakeIssuer::new();

        assert!(matches!(sequencer.tick(0, &mut issuer), TickOutcome::Issued { settle_until: 50, .. }));
        assert_eq!(sequencer.tick(10, &mut issuer), TickOutcome::Waiting { until: 50 });
        assert_eq!(sequencer.tick(49, &mut issuer), TickOutcome::Waiting { until: 50 });
        assert_eq!(sequencer.state(), SequencerState::Device(1));

        assert!(matches!(sequencer.tick(50, &mut issuer), TickOutcome::Issued { device: DeviceId(1), .. }));
        assert_eq!(issuer.issued, [(DeviceId(0), 0), (DeviceId(1), 50)]);
    }

    #[test]
    fn test_busy_bus_skips_without_waiting() {
        let mut sequencer = Sequencer::new(registry(&[1000, 1000]), CycleCompensator::new(5000));
        let mut issuer = FakeIssuer::new();
        issuer.busy = true;

        let outcome = sequencer.tick(0, &mut issuer);
        assert!(matches!(outcome, TickOutcome::Skipped { device: DeviceId(0), reason: SkipReason::Issue(_) }));
        assert_eq!(sequencer.wait_until(), None);
        assert_eq!(sequencer.state(), SequencerState::Device(1));

        // next device is attempted on the very next tick
        assert!(matches!(sequencer.tick(1, &mut issuer), TickOutcome::Skipped { device: DeviceId(1), .. }));
        assert_eq!(sequencer.state(), SequencerState::Finalize);
        assert_eq!(sequencer.get_stats().total_skipped, 2);
    }

    #[test]
    fn test_finalize_pads_to_budget() {
        let mut sequencer = Sequencer::new(registry(&[1000, 3000]), CycleCompensator::new(5000));
        let mut issuer = FakeIssuer::new();

        sequencer.tick(0, &mut issuer);
        sequencer.tick(1000, &mut issuer);
        let outcome = sequencer.tick(4000, &mut issuer);
        assert_eq!(outcome, TickOutcome::CycleComplete(CycleOutcome::OnTime { elapsed_ms: 4000, wait_ms: 1000 }));
        assert_eq!(sequencer.wait_until(), Some(5000));
        assert_eq!(sequencer.state(), SequencerState::Device(0));

        assert_eq!(sequencer.tick(4999, &mut issuer), TickOutcome::Waiting { until: 5000 });
        assert!(matches!(sequencer.tick(5000, &mut issuer), TickOutcome::Issued { device: DeviceId(0), .. }));
        assert_eq!(sequencer.cycle_start(), Some(5000));
    }

    #[test]
    fn test_overrun_restarts_immediately() {
        let mut sequencer = Sequencer::new(registry(&[6000]), CycleCompensator::new(5000));
        let mut issuer = FakeIssuer::new();

        sequencer.tick(0, &mut issuer);
        let outcome = sequencer.tick(6000, &mut issuer);
        assert_eq!(outcome, TickOutcome::CycleComplete(CycleOutcome::Overrun { elapsed_ms: 6000, excess_ms: 1000 }));
        assert_eq!(sequencer.wait_until(), None);
        assert!(matches!(sequencer.tick(6000, &mut issuer), TickOutcome::Issued { .. }));
        assert_eq!(sequencer.get_stats().cycle_overruns, 1);
    }

    #[test]
    fn test_zero_settle_advances_on_next_tick() {
        let mut sequencer = Sequencer::new(registry(&[0, 0]), CycleCompensator::new(100));
        let mut issuer = FakeIssuer::new();

        sequencer.tick(0, &mut issuer);
        assert_eq!(sequencer.wait_until(), None);
        assert!(matches!(sequencer.tick(0, &mut issuer), TickOutcome::Issued { device: DeviceId(1), .. }));
    }
}
