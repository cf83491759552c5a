//! # FORGE Core
//!
//! Foundational types shared by every layer of the FORGE compute stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        forge-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │    Sync     │  │       Error         │  │
//! │  │ (Handle,    │  │  (Fence,    │  │     Handling        │  │
//! │  │  ByteSize)  │  │   Event)    │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{CompileError, Error, Result};
pub use sync::{Event, Fence};
pub use types::*;
