//! Authentication and authorization modules.

pub mod gate;
pub mod rate_limit;

pub use gate::{AccessGate, AuthOutcome};
pub use rate_limit::AuthThrottle;
