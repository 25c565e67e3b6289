//! line-transport: newline-framed byte channels to testbed firmware
//!
//! Every testbed module (generator, tracker, turbine, loads, storage) sits behind
//! one serial port and speaks a line protocol: each outbound line is a command
//! name or an argument value, each inbound line a response token. This crate
//! provides the [`LineTransport`] trait plus feature-gated backends. The default
//! build enables a `mock` backend so binaries and tests run without hardware.

mod types;
pub use types::{PortInfo, DEFAULT_BAUD};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{LineTransport, PortLister, SharedLine};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockFirmware, MockHandle, MockLine};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialLine;
