//! Streaming sessions and the collaborators they are built against.

pub mod datasource;
pub mod error;
pub mod registry;
pub mod session;
pub mod sink;
