//! # Bus Poller
//!
//! Time-sliced, non-blocking polling of field devices that share one
//! half-duplex serial bus (RS-485 / Modbus RTU class).
//!
//! ## Features
//!
//! - **Per-device settle delays**: each device gets the idle time it needs
//!   before the next request goes out, from 50 ms to whole seconds
//! - **Constant cycle length**: every pass is padded to a fixed budget; an
//!   overrun is logged and the next pass starts at once
//! - **Exactly-once completion**: every accepted transaction ends in exactly one
//!   success or failure, with timeouts synthesized by the poller itself
//! - **Last-known-good telemetry**: failures mark a device stale but keep its
//!   values; readers never take a lock
//! - **Never blocks**: [`BusPoller::update`] does a bounded amount of work and
//!   returns, so the host loop stays free for other duties
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use buspoll::{BusPoller, PollerConfig, SimulatedBus, SimulatedBusConfig};
//!
//! let config = PollerConfig::default();
//! let mut poller = BusPoller::new(&config, |completions| {
//!     SimulatedBus::new(SimulatedBusConfig::default(), completions)
//! })
//! .expect("valid configuration");
//!
//! poller.start();
//! loop {
//!     if let Some(report) = poller.update() {
//!         println!("{}", report.summary_line());
//!     }
//!     // ... other work ...
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`registry`] - Static device table
//! - [`transport`] - Bus protocol contract and a simulated bus
//! - [`transaction`] - One-at-a-time transaction manager with timeouts
//! - [`telemetry`] - Per-device telemetry slots and counters
//! - [`scheduler`] - Cooperative poll sequencer
//! - [`cycle`] - Cycle length compensation
//! - [`status`] - Read-only status reports
//! - [`poller`] - Orchestrator driven by the host loop

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod config;
pub mod cycle;
pub mod error;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod telemetry;
pub mod transaction;
pub mod transport;

// Re-export main public types for convenience
pub use config::PollerConfig;
pub use error::{ConfigError, DecodeError, IssueError, TransportError};
pub use poller::BusPoller;
pub use registry::{DeviceDescriptor, DeviceId, DeviceRegistry, FunctionCode};
pub use status::StatusReport;
pub use telemetry::TelemetryStore;
pub use transport::{BusTransport, FailureKind, SimulatedBus, SimulatedBusConfig};
