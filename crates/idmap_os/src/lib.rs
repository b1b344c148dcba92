#![forbid(unsafe_code)]

pub mod clock;
pub mod common_party;
pub mod config;
pub mod create;
pub mod merge;
pub mod service;

pub use clock::{ManualMappingClock, MappingClock, SystemMappingClock};
pub use config::MappingServiceConfig;
pub use service::MappingService;
