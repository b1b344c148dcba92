#![forbid(unsafe_code)]

pub mod common;
pub mod mapping;

pub use common::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};
