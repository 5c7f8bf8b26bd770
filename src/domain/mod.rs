//! Domain layer types and invariants.

pub mod clock;
pub mod error;
pub mod resolution;
