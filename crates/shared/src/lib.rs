//! Shared types and utilities for the Retriever client and its tests.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
