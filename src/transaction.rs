use crate::error::IssueError;
use crate::registry::{DeviceDescriptor, DeviceId};
use crate::transport::{BusOutcome, BusRequest, BusTransport, CompletionReceiver, FailureKind, RegisterPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 2000;

/// The single transaction currently on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub transaction_id: u64,
    pub token: u32,
    pub device: DeviceId,
    pub address: u8,
    pub issued_at: u64,
    pub deadline: u64,
}

impl PendingTransaction {
    pub fn is_expired(&self, current_time: u64) -> bool {
        current_time >= self.deadline
    }
}

/// Receipt for a request that is now on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub transaction_id: u64,
    pub token: u32,
    pub deadline: u64,
}

/// The one and only final word on an accepted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalNotification {
    Complete {
        token: u32,
        device: DeviceId,
        transaction_id: u64,
        payload: RegisterPayload,
    },
    Failed {
        token: u32,
        device: DeviceId,
        transaction_id: u64,
        kind: FailureKind,
    },
}

impl TerminalNotification {
    pub fn token(&self) -> u32 {
        match self {
            TerminalNotification::Complete { token, .. } | TerminalNotification::Failed { token, .. } => *token,
        }
    }

    pub fn device(&self) -> DeviceId {
        match self {
            TerminalNotification::Complete { device, .. } | TerminalNotification::Failed { device, .. } => *device,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        match self {
            TerminalNotification::Complete { transaction_id, .. }
            | TerminalNotification::Failed { transaction_id, .. } => *transaction_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransactionStats {
    pub total_issued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub timeouts_synthesized: u64,
    /// Events for transactions that were already resolved or never issued.
    pub stale_events: u64,
    pub rejected_busy: u64,
    pub rejected_transport: u64,
}

/// Serializes transactions onto the shared bus and correlates their results.
///
/// Owned by the scheduling context. Results come in through the completion
/// queue and are only looked at from [`poll`](Self::poll), so the pending
/// record is never touched from the reception path.
#[derive(Debug)]
pub struct BusTransactionManager<T: BusTransport> {
    transport: T,
    completions: CompletionReceiver,
    timeout_ms: u64,
    pending: Option<PendingTransaction>,
    next_transaction_id: u64,
    stats: TransactionStats,
}

impl<T: BusTransport> BusTransactionManager<T> {
    pub fn new(transport: T, completions: CompletionReceiver, timeout_ms: u64) -> Self {
        Self {
            transport,
            completions,
            timeout_ms,
            pending: None,
            next_transaction_id: 1,
            stats: TransactionStats::default(),
        }
    }

    /// Hand a read request for `descriptor` to the transport. Returns as soon as
    /// the transport has taken it; the result arrives later through `poll`.
    pub fn issue(
        &mut self,
        device: DeviceId,
        descriptor: &DeviceDescriptor,
        current_time: u64,
    ) -> Result<Accepted, IssueError> {
        if let Some(pending) = &self.pending {
            self.stats.rejected_busy += 1;
            return Err(IssueError::BusBusy {
                pending_token: pending.token,
                pending_transaction: pending.transaction_id,
            });
        }

        let transaction_id = self.next_transaction_id;
        let request = BusRequest {
            transaction_id,
            token: descriptor.token,
            address: descriptor.address,
            function: descriptor.function,
            start_register: descriptor.start_register,
            register_count: descriptor.register_count,
        };

        if let Err(e) = self.transport.submit(request) {
            self.stats.rejected_transport += 1;
            return Err(IssueError::Rejected(e));
        }

        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        let deadline = current_time.saturating_add(self.timeout_ms);
        self.pending = Some(PendingTransaction {
            transaction_id,
            token: descriptor.token,
            device,
            address: descriptor.address,
            issued_at: current_time,
            deadline,
        });
        self.stats.total_issued += 1;

        debug!(
            "Issued transaction {} to device {} (token {}, fc {:#04X}, {} registers @ {:#06X})",
            transaction_id,
            descriptor.address,
            descriptor.token,
            descriptor.function.code(),
            descriptor.register_count,
            descriptor.start_register
        );

        Ok(Accepted {
            transaction_id,
            token: descriptor.token,
            deadline,
        })
    }

    /// Drain the completion queue and resolve the pending transaction.
    ///
    /// Returns the terminal notification when the pending transaction ended
    /// during this call, either from a transport result or from its deadline
    /// passing. A result already queued wins over a deadline that expired
    /// while the scheduling context was busy elsewhere.
    pub fn poll(&mut self, current_time: u64) -> Option<TerminalNotification> {
        let mut resolved = None;

        while let Some(event) = self.completions.try_next() {
            let matches_pending = self
                .pending
                .as_ref()
                .is_some_and(|p| p.transaction_id == event.transaction_id && p.token == event.token);

            if !matches_pending {
                self.stats.stale_events += 1;
                trace!(
                    "Discarding stale result for transaction {} (token {})",
                    event.transaction_id,
                    event.token
                );
                continue;
            }

            if let Some(pending) = self.pending.take() {
                resolved = Some(self.resolve(pending, event.outcome));
            }
        }

        let expired = self.pending.as_ref().is_some_and(|p| p.is_expired(current_time));
        if resolved.is_none() && expired {
            if let Some(pending) = self.pending.take() {
                self.stats.timeouts_synthesized += 1;
                warn!(
                    "Transaction {} to device {} timed out after {} ms",
                    pending.transaction_id,
                    pending.address,
                    current_time.saturating_sub(pending.issued_at)
                );
                resolved = Some(self.resolve(pending, BusOutcome::Fault(FailureKind::Timeout)));
            }
        }

        resolved
    }

    fn resolve(&mut self, pending: PendingTransaction, outcome: BusOutcome) -> TerminalNotification {
        match outcome {
            BusOutcome::Response(payload) => {
                self.stats.total_completed += 1;
                TerminalNotification::Complete {
                    token: pending.token,
                    device: pending.device,
                    transaction_id: pending.transaction_id,
                    payload,
                }
            }
            BusOutcome::Fault(kind) => {
                self.stats.total_failed += 1;
                TerminalNotification::Failed {
                    token: pending.token,
                    device: pending.device,
                    transaction_id: pending.transaction_id,
                    kind,
                }
            }
        }
    }

    pub fn pending(&self) -> Option<&PendingTransaction> {
        self.pending.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn get_stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
