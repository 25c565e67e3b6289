//! energy-balance: telemetry, power estimation and Mode 2 generator balancing
//!
//! Everything here talks to hardware only through
//! [`device_registry::DeviceHub::execute`]. The [`Testbed`] coordinator owns
//! the shared state (latest samples, operator estimates, the connection graph,
//! demand inference) and persists what the operator configures through a
//! [`KeyValueStore`]. [`TelemetryPoller`] and [`BalanceController`] are the two
//! periodic loops driving it.

mod error;
pub use error::{BalanceError, Result, StoreError};

mod sanitize;
pub use sanitize::{sanitize_power, sanitize_voltage, Field, OutlierFilter, MAX_POWER_W, MAX_VOLTAGE};

mod telemetry;
pub use telemetry::{first_number, read_raw, TelemetryPoller, TelemetrySample};

mod estimate;
pub use estimate::{KwReading, KwSource, PowerEstimate, PowerEstimator};

mod graph;
pub use graph::{ConnectionGraph, Edge, Endpoint};

mod inference;
pub use inference::{DemandInference, InferenceTuning};

pub mod store;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

mod coordinator;
pub use coordinator::{DeviceEnergy, EnergySnapshot, Testbed, TestbedSettings};

mod controller;
pub use controller::{balance_target, BalanceController, BalanceOutcome, BalanceReport, LastApplied};
