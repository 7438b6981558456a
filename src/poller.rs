use crate::config::PollerConfig;
use crate::cycle::CycleCompensator;
use crate::error::ConfigError;
use crate::registry::DeviceRegistry;
use crate::scheduler::{Sequencer, SequencerStats, TickOutcome};
use crate::status::{ReportTimer, StatusReport};
use crate::telemetry::TelemetryStore;
use crate::transaction::{BusTransactionManager, PendingTransaction, TerminalNotification, TransactionStats};
use crate::transport::{completion_channel, BusTransport, CompletionSender};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PollerState {
    pub running: bool,
    pub uptime_ms: u64,
    pub tick_count: u64,
    pub reports_generated: u32,
    /// Longest time a single `update` took, in microseconds.
    pub max_update_time_us: u64,
}

/// Ties the sequencer, the transaction manager and the telemetry store
/// together. Call [`update`](Self::update) from the host's event loop as often
/// as convenient; each call does a bounded amount of work and returns.
pub struct BusPoller<T: BusTransport> {
    registry: Arc<DeviceRegistry>,
    store: Arc<TelemetryStore>,
    manager: BusTransactionManager<T>,
    sequencer: Sequencer,
    report_timer: ReportTimer,

    state: PollerState,
    start_time: Instant,
    stale_events_seen: u64,
}

impl<T: BusTransport> BusPoller<T> {
    /// Build a poller around a transport. `make_transport` receives the
    /// producer half of the completion queue; the poller keeps the consumer.
    pub fn new<F>(config: &PollerConfig, make_transport: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(CompletionSender) -> T,
    {
        config.validate()?;
        let registry = Arc::new(config.build_registry()?);
        let store = Arc::new(TelemetryStore::new(&registry));

        let (completion_tx, completion_rx) = completion_channel(config.completion_queue_depth);
        let transport = make_transport(completion_tx);
        let manager = BusTransactionManager::new(transport, completion_rx, config.transaction_timeout_ms);

        let sequencer = Sequencer::new(
            Arc::clone(&registry),
            CycleCompensator::new(config.cycle_budget_ms),
        );

        if config.minimum_cycle_ms() > config.cycle_budget_ms {
            warn!(
                "Settle delays add up to {} ms, more than the {} ms cycle budget; every cycle will overrun",
                config.minimum_cycle_ms(),
                config.cycle_budget_ms
            );
        }

        for descriptor in config.devices.iter().filter(|d| d.enabled) {
            if descriptor.settle_delay_ms < config.transaction_timeout_ms {
                warn!(
                    "Device {} settles in {} ms but may hold the bus for {} ms; if it goes silent the next device is skipped",
                    descriptor.address,
                    descriptor.settle_delay_ms,
                    config.transaction_timeout_ms
                );
            }
        }

        Ok(Self {
            registry,
            store,
            manager,
            sequencer,
            report_timer: ReportTimer::new(config.report_interval_ms),
            state: PollerState::default(),
            start_time: Instant::now(),
            stale_events_seen: 0,
        })
    }

    pub fn start(&mut self) {
        self.state.running = true;
        self.start_time = Instant::now();

        info!(
            "Bus poller starting: {} devices ({} enabled), {} ms cycle budget, {} ms transaction timeout",
            self.registry.len(),
            self.sequencer.poll_order().len(),
            self.sequencer.budget_ms(),
            self.manager.timeout_ms()
        );
        for (_, descriptor) in self.registry.iter() {
            info!(
                "  device {:3} token {:5} fc {:#04X} {:3} registers @ {:#06X}, settle {} ms{}",
                descriptor.address,
                descriptor.token,
                descriptor.function.code(),
                descriptor.register_count,
                descriptor.start_register,
                descriptor.settle_delay_ms,
                if descriptor.enabled { "" } else { " (disabled)" }
            );
        }
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        info!("Bus poller stopping");
    }

    /// One pass of the scheduling loop on the wall clock.
    pub fn update(&mut self) -> Option<StatusReport> {
        let current_time = self.start_time.elapsed().as_millis() as u64;
        self.update_at(current_time)
    }

    /// One pass of the scheduling loop at an explicit time, in milliseconds on
    /// the poller's monotonic clock.
    pub fn update_at(&mut self, current_time: u64) -> Option<StatusReport> {
        if !self.state.running {
            return None;
        }
        let started = Instant::now();
        self.state.tick_count = self.state.tick_count.wrapping_add(1);
        self.state.uptime_ms = current_time;

        // results first, so a transaction that just finished frees the bus
        if let Some(notification) = self.manager.poll(current_time) {
            self.apply_notification(notification, current_time);
        }
        self.sync_stale_events();

        match self.sequencer.tick(current_time, &mut self.manager) {
            TickOutcome::Issued { .. } => self.store.record_issued(),
            TickOutcome::Skipped { device, .. } => self.store.record_skipped(device),
            TickOutcome::CycleComplete(outcome) => {
                self.store.record_cycle(outcome.elapsed_ms(), outcome.is_overrun());
            }
            TickOutcome::Waiting { .. } => {}
        }

        let report = if self.report_timer.should_report(current_time) {
            let report = StatusReport::collect(&self.registry, &self.store, current_time);
            self.state.reports_generated = self.state.reports_generated.saturating_add(1);
            info!("{}", report.summary_line());
            Some(report)
        } else {
            None
        };

        let elapsed_us = started.elapsed().as_micros() as u64;
        self.state.max_update_time_us = self.state.max_update_time_us.max(elapsed_us);

        report
    }

    fn apply_notification(&mut self, notification: TerminalNotification, current_time: u64) {
        let address = self
            .registry
            .get(notification.device())
            .map_or(0, |d| d.address);

        match notification {
            TerminalNotification::Complete { device, payload, transaction_id, .. } => {
                match self.store.update(device, &payload, current_time) {
                    Ok(()) => trace!(
                        "Transaction {} from device {}: {:?}",
                        transaction_id,
                        address,
                        payload.as_slice()
                    ),
                    Err(e) => {
                        // a length mismatch is a configuration problem, not bus noise
                        error!("Decode error on transaction {} from device {}: {}", transaction_id, address, e);
                        self.store.record_decode_error(device);
                    }
                }
            }
            TerminalNotification::Failed { device, kind, transaction_id, .. } => {
                warn!("Transaction {} to device {} failed: {}", transaction_id, address, kind);
                self.store.record_failure(device, kind);
            }
        }
    }

    fn sync_stale_events(&mut self) {
        let seen = self.manager.get_stats().stale_events;
        self.store.record_stale_completions(seen.saturating_sub(self.stale_events_seen));
        self.stale_events_seen = seen;
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport::collect(&self.registry, &self.store, self.state.uptime_ms)
    }

    /// Shared handle for readers in other tasks or threads.
    pub fn store(&self) -> Arc<TelemetryStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn get_state(&self) -> &PollerState {
        &self.state
    }

    pub fn get_sequencer_stats(&self) -> &SequencerStats {
        self.sequencer.get_stats()
    }

    pub fn get_transaction_stats(&self) -> &TransactionStats {
        self.manager.get_stats()
    }

    pub fn pending_transaction(&self) -> Option<&PendingTransaction> {
        self.manager.pending()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn transport(&self) -> &T {
        self.manager.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.manager.transport_mut()
    }
}
