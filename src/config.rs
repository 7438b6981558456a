use crate::cycle::DEFAULT_CYCLE_BUDGET_MS;
use crate::error::ConfigError;
use crate::registry::{DeviceDescriptor, DeviceRegistry, FunctionCode};
use crate::transaction::DEFAULT_TRANSACTION_TIMEOUT_MS;
use crate::transport::DEFAULT_COMPLETION_QUEUE_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 10_000;

// Bench layout: USB RS-485 adapter, M5 Atom RS-485 node, XY-MD02 sensor
const ADAPTER_ADDRESS: u8 = 28;
const ADAPTER_INPUT_REGISTER: u16 = 0x0000;
const ADAPTER_NUM_VALUES: u16 = 50;
const ADAPTER_SETTLE_MS: u64 = 50;

const ATOM_ADDRESS: u8 = 27;
const ATOM_HOLD_REGISTER: u16 = 0x012C;
const ATOM_NUM_VALUES: u16 = 8;
const ATOM_SETTLE_MS: u64 = 200;

const SENSOR_ADDRESS: u8 = 1;
const SENSOR_INPUT_REGISTER: u16 = 0x0001;
const SENSOR_NUM_VALUES: u16 = 2;
const SENSOR_SETTLE_MS: u64 = 1000;
const SENSOR_SCALE: f32 = 0.1;

fn default_report_interval() -> u64 {
    DEFAULT_REPORT_INTERVAL_MS
}

fn default_queue_depth() -> usize {
    DEFAULT_COMPLETION_QUEUE_DEPTH
}

/// Everything the poller needs, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Target length of one full pass over every enabled device.
    pub cycle_budget_ms: u64,
    pub transaction_timeout_ms: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub completion_queue_depth: usize,
    pub devices: alloc::vec::Vec<DeviceDescriptor>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cycle_budget_ms: DEFAULT_CYCLE_BUDGET_MS,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            completion_queue_depth: DEFAULT_COMPLETION_QUEUE_DEPTH,
            devices: alloc::vec![
                DeviceDescriptor::new(
                    ADAPTER_ADDRESS,
                    u32::from(ADAPTER_ADDRESS),
                    FunctionCode::ReadInputRegisters,
                    ADAPTER_INPUT_REGISTER,
                    ADAPTER_NUM_VALUES,
                    ADAPTER_SETTLE_MS,
                )
                .with_label("USB2RS485"),
                DeviceDescriptor::new(
                    ATOM_ADDRESS,
                    u32::from(ATOM_ADDRESS),
                    FunctionCode::ReadHoldingRegisters,
                    ATOM_HOLD_REGISTER,
                    ATOM_NUM_VALUES,
                    ATOM_SETTLE_MS,
                )
                .with_label("M5Atom"),
                DeviceDescriptor::new(
                    SENSOR_ADDRESS,
                    u32::from(SENSOR_ADDRESS),
                    FunctionCode::ReadInputRegisters,
                    SENSOR_INPUT_REGISTER,
                    SENSOR_NUM_VALUES,
                    SENSOR_SETTLE_MS,
                )
                .with_label("XY-MD02")
                .with_scale(SENSOR_SCALE),
            ],
        }
    }
}

impl PollerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<alloc::string::String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_budget_ms == 0 {
            return Err(ConfigError::ZeroDuration("cycle_budget_ms"));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("transaction_timeout_ms"));
        }
        if self.report_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration("report_interval_ms"));
        }
        if self.completion_queue_depth == 0 {
            return Err(ConfigError::ZeroDuration("completion_queue_depth"));
        }
        self.build_registry().map(|_| ())
    }

    pub fn build_registry(&self) -> Result<DeviceRegistry, ConfigError> {
        DeviceRegistry::new(self.devices.iter().cloned())
    }

    /// Sum of the enabled devices' settle delays: the shortest possible cycle.
    pub fn minimum_cycle_ms(&self) -> u64 {
        self.devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.settle_delay_ms)
            .fold(0u64, u64::saturating_add)
    }
}
