//! device-registry: command catalogs and the execution pipeline for testbed devices
//!
//! A device announces its commands through the discovery handshake; each
//! command declares how many argument lines it takes and how many response
//! lines it returns. [`DeviceHub`] owns every connected device and is the single
//! entry point for running a command: lookup, safe-mode interlock, catalog
//! validation, per-device queueing, deadline-bounded invocation, bookkeeping and
//! the execution log all happen there.

mod types;
pub use types::*;

mod error;
pub use error::{DeviceError, QueueError, Result, SignatureError};

mod catalog;
pub use catalog::{parse_signature, CommandCatalog, CommandDescriptor};

mod discovery;
pub use discovery::{discover, DiscoveryOutcome, DiscoveryPolicy, END_OF_CATALOG, ENUMERATE_COMMAND};

mod invoker;
pub use invoker::{Invoker, InvokerConfig};

mod queue;
pub use queue::DeviceQueue;

mod registry;
pub use registry::DeviceRegistry;

mod fallback;
pub use fallback::{builtin_catalog, builtin_signatures};

mod exec_log;
pub use exec_log::{ExecutionLog, ExecutionOutcome, ExecutionRecord};

mod hub;
pub use hub::{DeviceHub, ExecutionRequest, HubConfig};

mod loader;
pub use loader::{load_descriptor_file, load_descriptors_dir};

mod metrics;
pub use metrics::{DeviceMetrics, MetricsHub};
