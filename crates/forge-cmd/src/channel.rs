//! # Command Channel
//!
//! A command queue, one allocator and one command list, used as a unit.
//! Work is recorded into the open list and submitted synchronously; there is
//! never more than one submission in flight.

use forge_core::Result;
use forge_hal::{CommandAllocator, CommandList, CommandListType, CommandQueue, Device};

use crate::fence::FenceBarrier;

// =============================================================================
// CHANNEL STATISTICS
// =============================================================================

/// Channel statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Completed submissions
    pub submissions: u64,
    /// Commands submitted over all submissions
    pub commands: u64,
}

// =============================================================================
// COMMAND CHANNEL
// =============================================================================

/// Synchronous command channel
#[derive(Debug)]
pub struct CommandChannel<'d> {
    device: &'d Device,
    queue: CommandQueue,
    allocator: CommandAllocator,
    list: CommandList,
    barrier: FenceBarrier,
    stats: ChannelStats,
}

impl<'d> CommandChannel<'d> {
    /// Create a compute channel on `device`
    pub fn new(device: &'d Device) -> Result<Self> {
        Self::with_type(device, CommandListType::Compute)
    }

    /// Create a channel of a given list type
    pub fn with_type(device: &'d Device, ty: CommandListType) -> Result<Self> {
        let queue = device.create_command_queue(ty)?;
        let mut allocator = device.create_command_allocator(ty)?;
        let list = device.create_command_list(&mut allocator)?;
        let barrier = FenceBarrier::new(device)?;
        log::debug!("create {:?} command channel", ty);

        Ok(Self {
            device,
            queue,
            allocator,
            list,
            barrier,
            stats: ChannelStats::default(),
        })
    }

    /// Device the channel submits to
    pub fn device(&self) -> &'d Device {
        self.device
    }

    /// Channel statistics
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Last fence value reached
    pub fn fence_value(&self) -> u64 {
        self.barrier.last_value()
    }

    /// Record into the open command list
    pub fn record<R>(&mut self, f: impl FnOnce(&mut CommandList) -> R) -> R {
        f(&mut self.list)
    }

    /// Open command list
    pub fn list_mut(&mut self) -> &mut CommandList {
        &mut self.list
    }

    /// Close, submit and wait for the recorded work
    ///
    /// The list is reopened before the wait, so it is reusable whether or
    /// not the submission succeeded. A device removed by this or an earlier
    /// submission is reported after the wait.
    pub fn submit_and_wait(&mut self) -> Result<()> {
        let closed = self.list.close();
        if let Err(e) = closed {
            // Reopen so the channel stays usable after a recording error
            self.list.reset(&mut self.allocator)?;
            return Err(e);
        }

        let count = self.list.len() as u64;
        let executed = self.queue.execute_command_lists(&[&self.list]);
        self.list.reset(&mut self.allocator)?;
        if let Err(e) = executed {
            log::error!("submission rejected: {}", e);
            self.allocator.reset()?;
            return Err(e);
        }

        let value = self.barrier.signal_and_wait(&self.queue)?;
        self.allocator.reset()?;

        self.stats.submissions += 1;
        self.stats.commands += count;
        log::debug!("submission {} retired ({} commands)", value, count);

        self.device.check_removed()
    }
}
