//! Shelly Meter Bridge Library
//!
//! Polls Shelly EM / 3EM energy meters over their HTTP status endpoint, normalises the
//! readings into per-device published state and serves that state as SunSpec meters over
//! Modbus TCP. Every device runs in its own task and owns all of its mutable state.

pub mod channel_selector;
pub mod config;
pub mod derived;
pub mod device_poller;
pub mod energy;
pub mod identity;
pub mod meter_client;
pub mod modbus_bus;
pub mod orchestrator;
pub mod published_state;
pub mod telemetry;

// Re-export commonly used types for easier access
pub use config::{BridgeConfig, ConfigError};
pub use device_poller::{CycleOutcome, DevicePoller};
pub use meter_client::{FetchError, MeterClient};
pub use modbus_bus::ModbusBus;
pub use orchestrator::Orchestrator;
pub use published_state::{DataPoint, PublishedState, Snapshot, StateReader};
