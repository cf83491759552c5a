//! # Fence Barrier
//!
//! Blocks the CPU until the queue has retired everything submitted before
//! the barrier.

use forge_core::{Event, Fence, Result};
use forge_hal::{CommandQueue, Device};

/// One fence and one manual-reset event, reused for every wait
#[derive(Debug)]
pub struct FenceBarrier {
    fence: Fence,
    event: Event,
    last_value: u64,
}

impl FenceBarrier {
    /// Create a barrier whose fence starts at zero
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            fence: device.create_fence(0)?,
            event: Event::new(),
            last_value: 0,
        })
    }

    /// Last value waited for
    pub fn last_value(&self) -> u64 {
        self.last_value
    }

    /// Underlying fence
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Signal the next value after prior work and block until it is reached
    ///
    /// There is no timeout.
    pub fn signal_and_wait(&mut self, queue: &CommandQueue) -> Result<u64> {
        let value = self.last_value + 1;
        self.event.reset();
        self.fence.set_event_on_completion(value, &self.event);
        queue.signal(&self.fence, value)?;
        self.last_value = value;

        log::trace!("fence wait {}", value);
        self.event.wait();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_hal::{select_device, AdapterPolicy, CommandListType, ReferencePlatform};

    #[test]
    fn test_values_increase_by_one() {
        let device = select_device(&ReferencePlatform::new(), &AdapterPolicy::GraphicsHardware)
            .expect("device");
        let queue = device
            .create_command_queue(CommandListType::Compute)
            .expect("queue");
        let mut barrier = FenceBarrier::new(&device).expect("barrier");

        assert_eq!(barrier.signal_and_wait(&queue), Ok(1));
        assert_eq!(barrier.signal_and_wait(&queue), Ok(2));
        assert_eq!(barrier.fence().completed_value(), 2);
        assert_eq!(barrier.last_value(), 2);
    }
}
