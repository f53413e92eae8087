//! I/O utilities for persisted channel series.
//!
//! This module provides the append-only JSON store the scheduler writes to
//! and the history service reads from.

pub mod store;

// Re-export commonly used types and functions
pub use store::{JsonFileStore, PersistenceSink, StoreError};
