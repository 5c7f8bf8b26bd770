//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod sink;
pub mod telemetry;
pub mod upstream;
