//! # FORGE Resource Pool
//!
//! Buffers, upload staging, usage-state tracking and descriptor slots for one
//! device.
//!
//! ## Buffer Lifecycle
//!
//! ```text
//!   allocate ──▶ upload (staging copy) ──▶ UNORDERED_ACCESS ──▶ dispatch
//!                                                                  │
//!   release  ◀── readback (COPY_SOURCE, copy, restore state) ◀─────┘
//! ```
//!
//! The pool owns every buffer it allocates. [`Buffer`] values are copyable
//! handles; destroying the pool destroys whatever it still owns.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pool;

// Re-exports
pub use pool::{Buffer, Descriptor, PoolConfig, PoolStats, ResourcePool, TableRange};
