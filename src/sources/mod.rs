//! Telemetry source implementations

pub mod replay;

pub use replay::ReplaySource;
