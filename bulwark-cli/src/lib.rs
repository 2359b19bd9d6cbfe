//! Operator-facing surfaces of the Bulwark trading engine.

pub mod checks;
pub mod replay;
pub mod session;
pub mod telemetry;
