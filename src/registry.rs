//! Static table of the devices sharing the bus.

use crate::error::ConfigError;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const MAX_DEVICES: usize = 16;
/// Upper bound of a single Modbus read (function codes 0x03 / 0x04).
pub const MAX_REGISTERS: usize = 125;

const_assert!(MAX_REGISTERS <= 125);
const_assert!(MAX_DEVICES > 0);

/// Position of a device in the registry. Stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    ReadInputRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub address: u8,
    pub token: u32,
    pub function: FunctionCode,
    pub start_register: u16,
    pub register_count: u16,
    /// Idle time the device needs after a request before the next one goes out.
    pub settle_delay_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub label: Option<alloc::string::String>,
    /// Multiplier applied when rendering raw register values.
    #[serde(default)]
    pub scale: Option<f32>,
}

impl DeviceDescriptor {
    pub fn new(
        address: u8,
        token: u32,
        function: FunctionCode,
        start_register: u16,
        register_count: u16,
        settle_delay_ms: u64,
    ) -> Self {
        Self {
            address,
            token,
            function,
            start_register,
            register_count,
            settle_delay_ms,
            enabled: true,
            label: None,
            scale: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(alloc::string::ToString::to_string(label));
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.register_count == 0 || usize::from(self.register_count) > MAX_REGISTERS {
            return Err(ConfigError::InvalidRegisterCount {
                address: self.address,
                count: self.register_count,
                max: MAX_REGISTERS,
            });
        }
        if self.start_register.checked_add(self.register_count - 1).is_none() {
            return Err(ConfigError::RegisterRangeOverflow {
                address: self.address,
                start: self.start_register,
            });
        }
        Ok(())
    }
}

/// Immutable device table, shared read-only by every component.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDescriptor, MAX_DEVICES>,
}

impl DeviceRegistry {
    pub fn new<I>(devices: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = DeviceDescriptor>,
    {
        let mut table: Vec<DeviceDescriptor, MAX_DEVICES> = Vec::new();
        let mut count = 0usize;

        for descriptor in devices {
            count += 1;
            descriptor.validate()?;

            if table.iter().any(|d| d.token == descriptor.token) {
                return Err(ConfigError::DuplicateToken(descriptor.token));
            }
            if table.iter().any(|d| d.address == descriptor.address) {
                return Err(ConfigError::DuplicateAddress(descriptor.address));
            }

            // past capacity, keep counting so the error reports the real size
            let _ = table.push(descriptor);
        }

        if count > MAX_DEVICES {
            return Err(ConfigError::TooManyDevices { count, max: MAX_DEVICES });
        }
        if !table.iter().any(|d| d.enabled) {
            return Err(ConfigError::NoEnabledDevices);
        }

        Ok(Self { devices: table })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceDescriptor> {
        self.devices.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &DeviceDescriptor)> {
        self.devices.iter().enumerate().map(|(i, d)| (DeviceId(i), d))
    }

    /// Enabled devices in poll order.
    pub fn enabled(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.iter().filter(|(_, d)| d.enabled).map(|(id, _)| id)
    }

    pub fn find_by_token(&self, token: u32) -> Option<DeviceId> {
        self.iter().find(|(_, d)| d.token == token).map(|(id, _)| id)
    }

    pub fn find_by_address(&self, address: u8) -> Option<DeviceId> {
        self.iter().find(|(_, d)| d.address == address).map(|(id, _)| id)
    }
}
