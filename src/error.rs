use crate::registry::DeviceId;
use thiserror::Error;

/// Why a transaction could not be put on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssueError {
    /// A transaction is already in flight. The single-bus invariant makes
    /// this unreachable in steady state; callers skip rather than stall.
    #[error("bus busy: transaction {pending_transaction} (token {pending_token}) still pending")]
    BusBusy {
        pending_token: u32,
        pending_transaction: u64,
    },
    #[error("transport rejected request: {0}")]
    Rejected(#[from] TransportError),
}

/// Synchronous failures reported by a transport when handing it a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport request queue full")]
    QueueFull,
    #[error("transport disconnected")]
    Disconnected,
    #[error("request outside addressable range")]
    InvalidRequest,
}

/// A structurally valid response that does not fit its telemetry slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("device {device}: expected {expected} registers, got {actual}")]
    LengthMismatch {
        device: DeviceId,
        expected: u16,
        actual: usize,
    },
    #[error("no telemetry slot for device {0}")]
    UnknownDevice(DeviceId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no enabled devices configured")]
    NoEnabledDevices,
    #[error("too many devices: {count} configured, at most {max} supported")]
    TooManyDevices { count: usize, max: usize },
    #[error("device at address {address}: register count {count} outside 1..={max}")]
    InvalidRegisterCount { address: u8, count: u16, max: usize },
    #[error("device at address {address}: register range starting at {start:#06X} overflows")]
    RegisterRangeOverflow { address: u8, start: u16 },
    #[error("duplicate correlation token {0}")]
    DuplicateToken(u32),
    #[error("duplicate bus address {0}")]
    DuplicateAddress(u8),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
