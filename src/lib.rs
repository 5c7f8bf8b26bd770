//! Server side of bucketcast: a resolution-aware cache of upstream
//! time-bucket series and the per-connection loops that stream it to
//! dashboard clients as `bucket_update` frames.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
