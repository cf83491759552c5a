//! # Command Queue
//!
//! Submission endpoint of a device. Each queue owns a timeline thread that
//! executes closed command lists in submission order and signals fences once
//! all prior work retired.
//!
//! A failing submission removes the device. Later submissions on a removed
//! device are skipped, but fence signals still go through so no CPU waiter
//! is left blocked.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use forge_core::{Error, Fence, Result};

use crate::command::{Command, CommandList, CommandListType};
use crate::device::DeviceShared;
use crate::executor;

/// Work handed to the timeline
enum QueueOp {
    Execute(Arc<[Command]>),
    Signal(Fence, u64),
}

/// Device command queue
#[derive(Debug)]
pub struct CommandQueue {
    ty: CommandListType,
    sender: Option<Sender<QueueOp>>,
    timeline: Option<JoinHandle<()>>,
    /// Submissions so far
    submissions: u64,
}

impl CommandQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>, ty: CommandListType) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let timeline = thread::Builder::new()
            .name("forge-timeline".into())
            .spawn(move || run_timeline(&shared, &receiver))
            .map_err(|e| {
                log::error!("failed to spawn queue timeline: {}", e);
                Error::DeviceCreationFailed
            })?;
        log::debug!("create {:?} command queue", ty);

        Ok(Self {
            ty,
            sender: Some(sender),
            timeline: Some(timeline),
            submissions: 0,
        })
    }

    /// Get the queue type
    pub fn ty(&self) -> CommandListType {
        self.ty
    }

    /// Number of command lists submitted
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Submit closed command lists for execution, in order
    pub fn execute_command_lists(&mut self, lists: &[&CommandList]) -> Result<()> {
        let mut batches = Vec::with_capacity(lists.len());
        for list in lists {
            if list.ty() != self.ty {
                return Err(Error::InvalidParameter);
            }
            batches.push(list.recorded()?);
        }
        for commands in batches {
            log::debug!("submit {} commands", commands.len());
            self.send(QueueOp::Execute(commands))?;
            self.submissions += 1;
        }
        Ok(())
    }

    /// Signal `fence` to `value` after all previously submitted work
    pub fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        self.send(QueueOp::Signal(fence.clone(), value))
    }

    fn send(&self, op: QueueOp) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::DeviceRemoved)?;
        sender.send(op).map_err(|_| {
            log::error!("queue timeline is gone");
            Error::DeviceRemoved
        })
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel ends the timeline after it drains
        self.sender.take();
        if let Some(timeline) = self.timeline.take() {
            if timeline.join().is_err() {
                log::error!("queue timeline panicked");
            }
        }
    }
}

fn run_timeline(shared: &DeviceShared, receiver: &Receiver<QueueOp>) {
    let increment = shared.config.descriptor_increment;
    while let Ok(op) = receiver.recv() {
        match op {
            QueueOp::Execute(commands) => {
                if let Some(reason) = shared.removed_reason() {
                    log::warn!("skipping submission on removed device ({})", reason);
                    continue;
                }
                let result = {
                    let mut arena = shared.arena.lock();
                    executor::execute(&mut arena, &commands, increment)
                };
                if let Err(e) = result {
                    shared.mark_removed(e);
                }
            }
            QueueOp::Signal(fence, value) => fence.signal(value),
        }
    }
    log::trace!("queue timeline exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterAttributes;
    use crate::device::{Device, FeatureLevel};
    use crate::platform::{Platform, ReferencePlatform};
    use crate::resource::{HeapKind, ResourceDesc, ResourceStates};
    use forge_core::Event;

    fn device() -> Device {
        ReferencePlatform::new()
            .enumerate_adapters(AdapterAttributes::CORE_COMPUTE)
            .expect("enumerate")[1]
            .create_device(FeatureLevel::Core1_0)
            .expect("device")
    }

    fn wait(queue: &CommandQueue, fence: &Fence, value: u64) {
        let event = Event::new();
        fence.set_event_on_completion(value, &event);
        queue.signal(fence, value).expect("signal");
        event.wait();
    }

    #[test]
    fn test_open_list_rejected() {
        let device = device();
        let mut queue = device
            .create_command_queue(CommandListType::Compute)
            .expect("queue");
        let mut allocator = device
            .create_command_allocator(CommandListType::Compute)
            .expect("allocator");
        let list = device.create_command_list(&mut allocator).expect("list");
        assert_eq!(
            queue.execute_command_lists(&[&list]),
            Err(Error::CommandListNotClosed)
        );
    }

    #[test]
    fn test_failure_removes_device_but_still_signals() {
        let device = device();
        let mut queue = device
            .create_command_queue(CommandListType::Compute)
            .expect("queue");
        let mut allocator = device
            .create_command_allocator(CommandListType::Compute)
            .expect("allocator");
        let mut list = device.create_command_list(&mut allocator).expect("list");
        let fence = device.create_fence(0).expect("fence");

        let local = device
            .create_committed_resource(
                HeapKind::Default,
                &ResourceDesc::buffer(4),
                ResourceStates::COMMON,
            )
            .expect("local");
        let upload = device
            .create_committed_resource(
                HeapKind::Upload,
                &ResourceDesc::buffer(4),
                ResourceStates::GENERIC_READ,
            )
            .expect("upload");
        // local is in COMMON, not COPY_DEST
        list.copy_resource(local, upload);
        list.close().expect("close");
        queue.execute_command_lists(&[&list]).expect("submit");
        wait(&queue, &fence, 1);
        assert_eq!(device.check_removed(), Err(Error::ResourceStateMismatch));

        list.reset(&mut allocator).expect("reset");
        list.close().expect("close");
        queue.execute_command_lists(&[&list]).expect("submit");
        wait(&queue, &fence, 2);
        assert_eq!(fence.completed_value(), 2);
        assert_eq!(queue.submissions(), 2);
    }
}
