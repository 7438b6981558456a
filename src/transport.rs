//! Contract with the bus protocol layer, plus a simulated bus for demos and tests.
//!
//! The core never encodes frames. A [`BusTransport`] accepts a [`BusRequest`]
//! synchronously and later reports exactly what happened on the wire through a
//! [`CompletionSender`]. Completions travel over a bounded channel so the
//! reception path never calls back into scheduler state directly.

use crate::error::TransportError;
use crate::registry::{FunctionCode, MAX_REGISTERS};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub type RegisterPayload = Vec<u16, MAX_REGISTERS>;

pub const DEFAULT_COMPLETION_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Timeout,
    MalformedFrame,
    ChecksumError,
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::MalformedFrame => write!(f, "malformed frame"),
            FailureKind::ChecksumError => write!(f, "checksum error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRequest {
    /// Unique per issued transaction; echoed back in the matching [`BusEvent`].
    pub transaction_id: u64,
    pub token: u32,
    pub address: u8,
    pub function: FunctionCode,
    pub start_register: u16,
    pub register_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOutcome {
    Response(RegisterPayload),
    Fault(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub transaction_id: u64,
    pub token: u32,
    pub outcome: BusOutcome,
}

impl BusEvent {
    pub fn response(request: &BusRequest, values: &[u16]) -> Self {
        let outcome = match RegisterPayload::from_slice(values) {
            Ok(payload) => BusOutcome::Response(payload),
            // no single read carries more than MAX_REGISTERS values
            Err(()) => BusOutcome::Fault(FailureKind::MalformedFrame),
        };
        Self {
            transaction_id: request.transaction_id,
            token: request.token,
            outcome,
        }
    }

    pub fn fault(request: &BusRequest, kind: FailureKind) -> Self {
        Self {
            transaction_id: request.transaction_id,
            token: request.token,
            outcome: BusOutcome::Fault(kind),
        }
    }
}

/// Anything that can put a request on the shared bus.
///
/// `submit` must return without waiting for the response. Every accepted
/// request yields at most one [`BusEvent`]; a request that never produces one
/// is resolved by the transaction manager's timeout.
pub trait BusTransport {
    fn submit(&mut self, request: BusRequest) -> Result<(), TransportError>;
}

/// Producer half of the completion hand-off, owned by the reception path.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<BusEvent>,
}

impl CompletionSender {
    /// Never blocks. A full queue drops the event; the pending transaction then
    /// resolves through its timeout instead.
    pub fn deliver(&self, event: BusEvent) -> Result<(), TransportError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Completion queue full, dropping result for transaction {}",
                    event.transaction_id
                );
                Err(TransportError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }
}

/// Consumer half, drained once per scheduling tick.
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: Receiver<BusEvent>,
}

impl CompletionReceiver {
    pub fn try_next(&self) -> Option<BusEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

pub fn completion_channel(depth: usize) -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
    (CompletionSender { tx }, CompletionReceiver { rx })
}

// Fault rates for the simulated bus, in percent of requests
const DEFAULT_LATENCY_MS: u64 = 20;
const DEFAULT_TIMEOUT_RATE_PERCENT: f32 = 0.0;
const DEFAULT_MALFORMED_RATE_PERCENT: f32 = 0.0;
const DEFAULT_CHECKSUM_RATE_PERCENT: f32 = 0.0;
const DEFAULT_SHORT_PAYLOAD_RATE_PERCENT: f32 = 0.0;
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedBusConfig {
    pub latency_ms: u64,
    pub timeout_rate_percent: f32,
    pub malformed_rate_percent: f32,
    pub checksum_rate_percent: f32,
    /// Answers one register short, which the store rejects as a decode error.
    pub short_payload_rate_percent: f32,
    /// Addresses that never answer, as if disconnected from the bus.
    pub offline_addresses: alloc::vec::Vec<u8>,
    pub seed: u64,
}

impl Default for SimulatedBusConfig {
    fn default() -> Self {
        Self {
            latency_ms: DEFAULT_LATENCY_MS,
            timeout_rate_percent: DEFAULT_TIMEOUT_RATE_PERCENT,
            malformed_rate_percent: DEFAULT_MALFORMED_RATE_PERCENT,
            checksum_rate_percent: DEFAULT_CHECKSUM_RATE_PERCENT,
            short_payload_rate_percent: DEFAULT_SHORT_PAYLOAD_RATE_PERCENT,
            offline_addresses: alloc::vec::Vec::new(),
            seed: DEFAULT_SEED,
        }
    }
}

impl SimulatedBusConfig {
    /// Spread a single overall fault rate evenly over every fault kind.
    pub fn with_fault_rate(mut self, total_percent: f32) -> Self {
        let share = total_percent.clamp(0.0, 100.0) / 4.0;
        self.timeout_rate_percent = share;
        self.malformed_rate_percent = share;
        self.checksum_rate_percent = share;
        self.short_payload_rate_percent = share;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimulatedReply {
    Answer,
    ShortAnswer,
    Fault(FailureKind),
    Silent,
}

/// Deterministic fault picker, reproducible from the configured seed.
#[derive(Debug)]
struct FaultDice {
    rng_state: u64,
}

impl FaultDice {
    fn new(seed: u64) -> Self {
        Self { rng_state: seed }
    }

    // Linear congruential generator, Knuth MMIX constants
    fn next_percent(&mut self) -> f32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.rng_state >> 33) % 10_000) as f32 / 100.0
    }

    fn roll(&mut self, config: &SimulatedBusConfig, address: u8) -> SimulatedReply {
        if config.offline_addresses.contains(&address) {
            return SimulatedReply::Silent;
        }

        let roll = self.next_percent();
        let mut threshold = config.timeout_rate_percent;
        if roll < threshold {
            return SimulatedReply::Silent;
        }
        threshold += config.malformed_rate_percent;
        if roll < threshold {
            return SimulatedReply::Fault(FailureKind::MalformedFrame);
        }
        threshold += config.checksum_rate_percent;
        if roll < threshold {
            return SimulatedReply::Fault(FailureKind::ChecksumError);
        }
        threshold += config.short_payload_rate_percent;
        if roll < threshold {
            return SimulatedReply::ShortAnswer;
        }
        SimulatedReply::Answer
    }
}

/// Register contents served by the simulated devices. Values drift with the
/// number of times the device has been read so successive polls differ.
pub fn simulated_register_value(address: u8, register: u16, read_count: u32) -> u16 {
    (u16::from(address) << 8) ^ register.wrapping_add(read_count as u16)
}

/// In-process stand-in for a half-duplex RS-485 line.
///
/// Requests are handed to a worker thread which plays the wire: it waits the
/// configured latency, then answers (or stays silent) according to the fault
/// configuration. The worker is the completion context.
pub struct SimulatedBus {
    request_tx: Option<Sender<BusRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedBus {
    pub fn new(config: SimulatedBusConfig, completions: CompletionSender) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::bounded::<BusRequest>(1);

        let worker = std::thread::Builder::new()
            .name("simulated-bus".into())
            .spawn(move || Self::run_wire(config, request_rx, completions))
            .map_err(|e| warn!("Failed to spawn simulated bus worker: {}", e))
            .ok();

        Self {
            request_tx: Some(request_tx),
            worker,
        }
    }

    fn run_wire(config: SimulatedBusConfig, requests: Receiver<BusRequest>, completions: CompletionSender) {
        let mut dice = FaultDice::new(config.seed);
        let mut read_counts = [0u32; 256];

        while let Ok(request) = requests.recv() {
            std::thread::sleep(Duration::from_millis(config.latency_ms));

            let reads = &mut read_counts[usize::from(request.address)];
            *reads = reads.wrapping_add(1);
            let read_count = *reads;

            let reply = dice.roll(&config, request.address);
            let event = match reply {
                SimulatedReply::Silent => {
                    trace!("Simulated device {} stays silent", request.address);
                    continue;
                }
                SimulatedReply::Fault(kind) => BusEvent::fault(&request, kind),
                SimulatedReply::Answer | SimulatedReply::ShortAnswer => {
                    let count = if reply == SimulatedReply::ShortAnswer {
                        request.register_count.saturating_sub(1)
                    } else {
                        request.register_count
                    };
                    let values: alloc::vec::Vec<u16> = (0..count)
                        .map(|i| {
                            simulated_register_value(
                                request.address,
                                request.start_register.wrapping_add(i),
                                read_count,
                            )
                        })
                        .collect();
                    BusEvent::response(&request, &values)
                }
            };

            if completions.deliver(event) == Err(TransportError::Disconnected) {
                debug!("Completion receiver gone, simulated bus shutting down");
                break;
            }
        }
    }
}

impl BusTransport for SimulatedBus {
    fn submit(&mut self, request: BusRequest) -> Result<(), TransportError> {
        let tx = self.request_tx.as_ref().ok_or(TransportError::Disconnected)?;
        match tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }
}

impl Drop for SimulatedBus {
    fn drop(&mut self) {
        // closing the request channel ends the worker loop
        self.request_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
