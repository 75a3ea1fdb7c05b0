//! Cache ↔ block-store transfer pipeline.
//!
//! Writes trigger eager per-block uploads; leftovers are flushed either
//! synchronously or through the background flusher queue. Cache misses
//! fetch blocks in parallel and refill the cache.

mod flusher;
mod manager;

pub use flusher::*;
pub use manager::*;
