//! Read-only status view for external surfaces (displays, status endpoints).

use crate::registry::DeviceRegistry;
use crate::telemetry::{CounterSnapshot, SlotFailure, TelemetryStore};
use crate::transport::RegisterPayload;
use serde::{Deserialize, Serialize};

const TABLE_COLUMNS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub address: u8,
    pub token: u32,
    pub label: Option<alloc::string::String>,
    pub enabled: bool,
    pub start_register: u16,
    pub valid: bool,
    pub last_updated_at: Option<u64>,
    pub values: RegisterPayload,
    pub scale: Option<f32>,
    pub failure_count: u64,
    pub last_failure: Option<SlotFailure>,
}

impl DeviceStatus {
    pub fn display_name(&self) -> alloc::string::String {
        match &self.label {
            Some(label) => alloc::format!("{} (address {})", label, self.address),
            None => alloc::format!("address {}", self.address),
        }
    }

    /// Values in engineering units when a scale is configured.
    pub fn scaled_values(&self) -> alloc::vec::Vec<f64> {
        let scale = f64::from(self.scale.unwrap_or(1.0));
        self.values.iter().map(|&v| f64::from(v) * scale).collect()
    }

    /// Milliseconds since the last good update, if there ever was one.
    pub fn age_ms(&self, current_time: u64) -> Option<u64> {
        self.last_updated_at.map(|t| current_time.saturating_sub(t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: u64,
    pub counters: CounterSnapshot,
    pub devices: alloc::vec::Vec<DeviceStatus>,
}

impl StatusReport {
    pub fn collect(registry: &DeviceRegistry, store: &TelemetryStore, current_time: u64) -> Self {
        let devices = registry
            .iter()
            .map(|(id, descriptor)| {
                let snapshot = store.snapshot(id).unwrap_or_default();
                DeviceStatus {
                    address: descriptor.address,
                    token: descriptor.token,
                    label: descriptor.label.clone(),
                    enabled: descriptor.enabled,
                    start_register: descriptor.start_register,
                    valid: snapshot.valid,
                    last_updated_at: snapshot.last_updated_at,
                    values: snapshot.values.clone(),
                    scale: descriptor.scale,
                    failure_count: snapshot.failure_count,
                    last_failure: snapshot.last_failure,
                }
            })
            .collect();

        Self {
            generated_at: current_time,
            counters: store.counters(),
            devices,
        }
    }

    pub fn summary_line(&self) -> alloc::string::String {
        let valid = self.devices.iter().filter(|d| d.enabled && d.valid).count();
        let enabled = self.devices.iter().filter(|d| d.enabled).count();
        alloc::format!(
            "Requests {} / Errors {} (decode {}, busy {}) | valid {}/{} | cycles {} (overruns {}, last {} ms{})",
            self.counters.requests_issued,
            self.counters.requests_failed,
            self.counters.decode_errors,
            self.counters.issue_rejections,
            valid,
            enabled,
            self.counters.cycles_completed,
            self.counters.cycle_overruns,
            self.counters.last_cycle_elapsed_ms,
            if self.counters.last_cycle_overrun { ", OVERRUN" } else { "" }
        )
    }

    pub fn to_json(&self) -> Result<alloc::string::String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn export_csv_headers(&self) -> &'static str {
        "generated_at,address,token,enabled,valid,last_updated_at,failure_count,values"
    }

    pub fn export_csv_rows(&self) -> alloc::vec::Vec<alloc::string::String> {
        self.devices
            .iter()
            .map(|d| {
                let values: alloc::vec::Vec<alloc::string::String> =
                    d.values.iter().map(alloc::string::ToString::to_string).collect();
                alloc::format!(
                    "{},{},{},{},{},{},{},{}",
                    self.generated_at,
                    d.address,
                    d.token,
                    d.enabled,
                    d.valid,
                    d.last_updated_at.map(|t| t.to_string()).unwrap_or_default(),
                    d.failure_count,
                    values.join(" ")
                )
            })
            .collect()
    }
}

/// Lays register values out in rows of four, addressed from `start_register`.
pub fn format_register_table(device: &DeviceStatus) -> alloc::string::String {
    let mut out = alloc::string::String::new();
    let scaled = device.scale.is_some();

    for (i, value) in device.scaled_values().iter().enumerate() {
        let register = device.start_register.wrapping_add(i as u16);
        let cell = if scaled {
            alloc::format!("    {register:04X}: {value:8.1}")
        } else {
            alloc::format!("    {register:04X}: {value:8}")
        };
        out.push_str(&cell);
        if (i + 1) % TABLE_COLUMNS == 0 {
            out.push('\n');
        }
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Fires at a fixed interval measured on the scheduler clock. Replaces any
/// notion of sleeping between reports.
#[derive(Debug, Clone)]
pub struct ReportTimer {
    interval_ms: u64,
    last_report: Option<u64>,
}

impl ReportTimer {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms, last_report: None }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// True once per interval. The first call only arms the timer.
    pub fn should_report(&mut self, current_time: u64) -> bool {
        match self.last_report {
            None => {
                self.last_report = Some(current_time);
                false
            }
            Some(last) if current_time >= last.saturating_add(self.interval_ms) => {
                self.last_report = Some(current_time);
                true
            }
            Some(_) => false,
        }
    }
}
