//! Threadwatch - resilient thread and catalog synchronization
//!
//! Keeps local, consistent views of imageboard-style catalogs and threads.
//! Each watched descriptor gets an engine that polls with adaptive backoff,
//! reconciles fresh posts with what it has already seen, falls back to a
//! durable store and third-party mirrors when the origin fails, and publishes
//! the result to listeners.

pub mod config;
pub mod error;
pub mod mirror;
pub mod parser;
pub mod sites;
pub mod store;
pub mod sync;
pub mod transport;

pub use error::*;
