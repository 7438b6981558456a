#![allow(dead_code)]

use buspoll::config::PollerConfig;
use buspoll::error::TransportError;
use buspoll::registry::{DeviceDescriptor, FunctionCode};
use buspoll::transport::{BusEvent, BusRequest, BusTransport, CompletionSender, FailureKind};
use buspoll::BusPoller;
use std::collections::HashMap;

/// How a scripted device reacts to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Full-length answer, queued before `submit` returns.
    Answer,
    /// One register short of what was asked for.
    Short,
    /// One register more than was asked for.
    Long,
    Fault(FailureKind),
    /// Never answers; the poller has to time the transaction out.
    Silent,
}

/// Transport double that answers synchronously from a per-address script.
pub struct ScriptedBus {
    pub submitted: Vec<BusRequest>,
    pub completions: CompletionSender,
    pub default_reply: Reply,
    pub replies: HashMap<u8, Reply>,
    pub refuse: Option<TransportError>,
}

impl ScriptedBus {
    pub fn new(completions: CompletionSender) -> Self {
        Self {
            submitted: Vec::new(),
            completions,
            default_reply: Reply::Answer,
            replies: HashMap::new(),
            refuse: None,
        }
    }

    pub fn set_reply(&mut self, address: u8, reply: Reply) {
        self.replies.insert(address, reply);
    }

    pub fn requests_to(&self, address: u8) -> Vec<&BusRequest> {
        self.submitted.iter().filter(|r| r.address == address).collect()
    }
}

impl BusTransport for ScriptedBus {
    fn submit(&mut self, request: BusRequest) -> Result<(), TransportError> {
        if let Some(error) = self.refuse {
            return Err(error);
        }

        let reply = self.replies.get(&request.address).copied().unwrap_or(self.default_reply);
        match reply {
            Reply::Answer => {
                let values = register_values(&request, request.register_count);
                self.completions.deliver(BusEvent::response(&request, &values))?;
            }
            Reply::Short => {
                let values = register_values(&request, request.register_count - 1);
                self.completions.deliver(BusEvent::response(&request, &values))?;
            }
            Reply::Long => {
                let values = register_values(&request, request.register_count + 1);
                self.completions.deliver(BusEvent::response(&request, &values))?;
            }
            Reply::Fault(kind) => self.completions.deliver(BusEvent::fault(&request, kind))?,
            Reply::Silent => {}
        }
        self.submitted.push(request);
        Ok(())
    }
}

/// Values a scripted device answers with: address in the high byte,
/// transaction id in the low byte, plus the register offset.
pub fn register_values(request: &BusRequest, count: u16) -> Vec<u16> {
    (0..count)
        .map(|i| (u16::from(request.address) << 8) + (request.transaction_id as u16 & 0xFF) + i)
        .collect()
}

pub fn device(address: u8, settle_delay_ms: u64) -> DeviceDescriptor {
    DeviceDescriptor::new(
        address,
        u32::from(address) + 1000,
        FunctionCode::ReadHoldingRegisters,
        0x0010,
        4,
        settle_delay_ms,
    )
}

pub fn config_with(devices: Vec<DeviceDescriptor>, cycle_budget_ms: u64) -> PollerConfig {
    PollerConfig {
        cycle_budget_ms,
        devices,
        ..PollerConfig::default()
    }
}

pub fn scripted_poller(config: &PollerConfig) -> BusPoller<ScriptedBus> {
    let mut poller = BusPoller::new(config, ScriptedBus::new).unwrap();
    poller.start();
    poller
}

/// Drives the poller on a simulated clock from `from` (inclusive) to `to`
/// (exclusive). Returns the times at which each request was submitted and
/// the number of reports produced.
pub fn run(poller: &mut BusPoller<ScriptedBus>, from: u64, to: u64, step: u64) -> (Vec<(u64, u8)>, usize) {
    let mut issued = Vec::new();
    let mut reports = 0;
    let mut now = from;
    while now < to {
        let before = poller.transport().submitted.len();
        if poller.update_at(now).is_some() {
            reports += 1;
        }
        for request in &poller.transport().submitted[before..] {
            issued.push((now, request.address));
        }
        now += step;
    }
    (issued, reports)
}
