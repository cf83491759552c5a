//! # FORGE Command Submission
//!
//! Synchronous, single-in-flight command submission.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐    │
//! │  │   record()   │───▶│    close     │───▶│  Command Queue   │    │
//! │  │ (open list)  │    │  + execute   │    │   (timeline)     │    │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘    │
//! │                                                    │              │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────▼─────────┐    │
//! │  │ list + alloc │◀───│ Fence wait   │◀───│  Fence signal    │    │
//! │  │    reset     │    │  (event)     │    │  (last + 1)      │    │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. Operations are recorded into the channel's open command list
//! 2. `submit_and_wait` closes and submits the list
//! 3. The list is reopened against its allocator
//! 4. The fence barrier blocks until the queue retires the submission
//! 5. The allocator is reset and any device removal is reported

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod fence;

// Re-exports
pub use channel::{ChannelStats, CommandChannel};
pub use fence::FenceBarrier;
