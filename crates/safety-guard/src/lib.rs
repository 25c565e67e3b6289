//! safety-guard: hardware interlocks for the testbed console
//!
//! The only interlock the console needs is safe mode: while engaged, every
//! mutating command (any name starting with `set`, case-insensitive) is refused
//! before it reaches a serial link. Read commands always pass.

mod types;
pub use types::{SafetyEvent, SafetyEventType, SafetyViolation};

mod interlock;
pub use interlock::{is_mutating, SafetyInterlock};
