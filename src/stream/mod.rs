//! Stream adapters for observers

pub mod throttle;

pub use throttle::{Throttle, ThrottleExt};
