//! # Device Kernels
//!
//! The contract between recorded dispatches and the code the device runs
//! for them.
//!
//! A kernel sees its dispatch through a [`KernelContext`]: root constants,
//! thread-group counts and a descriptor table whose slots resolve to
//! unordered-access views. Every view must be bound and its buffer must be
//! in `UNORDERED_ACCESS` when the dispatch executes.

use core::fmt;
use std::sync::Arc;

use forge_core::{align_up, Error, Result};

use crate::descriptor::{GpuDescriptorHandle, UavView};
use crate::resource::{ResourceArena, ResourceStates};

// =============================================================================
// KERNEL TRAIT
// =============================================================================

/// Code the device runs for a dispatch
pub trait DeviceKernel: Send + Sync + fmt::Debug {
    /// Kernel name, used for registry lookup and logging
    fn name(&self) -> &str;

    /// Run the whole dispatch
    fn execute(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

// =============================================================================
// INVOCATION
// =============================================================================

/// Descriptor table bound to a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    /// First descriptor of the table
    pub start: GpuDescriptorHandle,
    /// Number of descriptors the kernel may address
    pub len: u32,
}

/// A fully resolved dispatch, as recorded into a command list
#[derive(Debug, Clone)]
pub struct KernelInvocation {
    /// Kernel to run
    pub kernel: Arc<dyn DeviceKernel>,
    /// Root constants
    pub constants: Vec<u32>,
    /// Bound descriptor table
    pub table: Option<DescriptorTable>,
    /// Thread-group counts
    pub thread_groups: [u32; 3],
}

impl KernelInvocation {
    /// Create an invocation with one thread group and no bindings
    pub fn new(kernel: Arc<dyn DeviceKernel>) -> Self {
        Self {
            kernel,
            constants: Vec::new(),
            table: None,
            thread_groups: [1, 1, 1],
        }
    }

    /// Set root constants
    pub fn with_constants(mut self, constants: Vec<u32>) -> Self {
        self.constants = constants;
        self
    }

    /// Bind a descriptor table
    pub fn with_table(mut self, start: GpuDescriptorHandle, len: u32) -> Self {
        self.table = Some(DescriptorTable { start, len });
        self
    }

    /// Set thread-group counts
    pub fn with_thread_groups(mut self, x: u32, y: u32, z: u32) -> Self {
        self.thread_groups = [x, y, z];
        self
    }
}

// =============================================================================
// KERNEL CONTEXT
// =============================================================================

/// Execution-time view of a dispatch
pub struct KernelContext<'a> {
    arena: &'a mut ResourceArena,
    invocation: &'a KernelInvocation,
    views: Vec<Option<UavView>>,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        arena: &'a mut ResourceArena,
        invocation: &'a KernelInvocation,
        increment: u32,
    ) -> Result<Self> {
        let views = match invocation.table {
            Some(table) => {
                let (heap_id, first) = table.start.decode(increment)?;
                let heap = arena.heap(heap_id)?;
                (0..table.len)
                    .map(|i| heap.view(first + i))
                    .collect::<Result<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        Ok(Self {
            arena,
            invocation,
            views,
        })
    }

    /// Root constants
    pub fn constants(&self) -> &[u32] {
        &self.invocation.constants
    }

    /// Root constant at `index`
    pub fn constant(&self, index: usize) -> Result<u32> {
        self.invocation
            .constants
            .get(index)
            .copied()
            .ok_or(Error::InvalidParameter)
    }

    /// Dispatched thread-group counts
    pub fn thread_groups(&self) -> [u32; 3] {
        self.invocation.thread_groups
    }

    /// Number of addressable table slots
    pub fn table_len(&self) -> u32 {
        self.views.len() as u32
    }

    /// Check whether a slot holds a view
    pub fn is_bound(&self, slot: u32) -> bool {
        matches!(self.views.get(slot as usize), Some(Some(_)))
    }

    /// Number of elements in the view at `slot`
    pub fn view_len(&self, slot: u32) -> Result<usize> {
        Ok(self.view(slot)?.desc.num_elements as usize)
    }

    /// Copy the words of the view at `slot`
    pub fn read_words(&self, slot: u32) -> Result<Vec<u32>> {
        Ok(self.view_words(slot)?.to_vec())
    }

    /// Copy the view at `slot` as `f32` elements
    pub fn read_f32(&self, slot: u32) -> Result<Vec<f32>> {
        Ok(bytemuck::cast_slice(self.view_words(slot)?).to_vec())
    }

    /// Copy the view at `slot` as raw bytes
    pub fn read_bytes(&self, slot: u32) -> Result<Vec<u8>> {
        Ok(bytemuck::cast_slice(self.view_words(slot)?).to_vec())
    }

    /// Borrow the view at `slot` as raw bytes
    pub fn view_bytes(&self, slot: u32) -> Result<&[u8]> {
        Ok(bytemuck::cast_slice(self.view_words(slot)?))
    }

    /// Borrow the view at `slot` for writing as `f32` elements
    pub fn view_f32_mut(&mut self, slot: u32) -> Result<&mut [f32]> {
        Ok(bytemuck::cast_slice_mut(self.view_words_mut(slot)?))
    }

    /// Borrow the view at `slot` for writing as raw bytes
    pub fn view_bytes_mut(&mut self, slot: u32) -> Result<&mut [u8]> {
        Ok(bytemuck::cast_slice_mut(self.view_words_mut(slot)?))
    }

    /// Overwrite the start of the view at `slot` with words
    pub fn write_words(&mut self, slot: u32, data: &[u32]) -> Result<()> {
        let words = self.view_words_mut(slot)?;
        if data.len() > words.len() {
            return Err(Error::BufferOverflow);
        }
        words[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Overwrite the start of the view at `slot` with `f32` elements
    pub fn write_f32(&mut self, slot: u32, data: &[f32]) -> Result<()> {
        self.write_words(slot, bytemuck::cast_slice(data))
    }

    /// Overwrite the start of the view at `slot` with bytes
    pub fn write_bytes(&mut self, slot: u32, data: &[u8]) -> Result<()> {
        let bytes = self.view_bytes_mut(slot)?;
        if data.len() > bytes.len() {
            return Err(Error::BufferOverflow);
        }
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn view(&self, slot: u32) -> Result<UavView> {
        match self.views.get(slot as usize) {
            Some(Some(view)) => Ok(*view),
            Some(None) => {
                log::error!(
                    "{}: descriptor slot {} is not bound",
                    self.invocation.kernel.name(),
                    slot
                );
                Err(Error::MissingBinding)
            }
            None => Err(Error::DescriptorOutOfRange),
        }
    }

    fn word_range(view: &UavView, size: u64) -> Result<core::ops::Range<usize>> {
        let range = view.desc.byte_range();
        if range.end > align_up(size, 4) {
            return Err(Error::BufferOverflow);
        }
        Ok((range.start / 4) as usize..(range.end / 4) as usize)
    }

    /// Borrow the view at `slot` as words
    pub fn view_words(&self, slot: u32) -> Result<&[u32]> {
        let view = self.view(slot)?;
        let resource = self.arena.resource(view.resource)?;
        if resource.state != ResourceStates::UNORDERED_ACCESS {
            log::error!(
                "{}: slot {} resource {:?} in state {:?}, expected UNORDERED_ACCESS",
                self.invocation.kernel.name(),
                slot,
                view.resource,
                resource.state
            );
            return Err(Error::ResourceStateMismatch);
        }
        let range = Self::word_range(&view, resource.desc.size)?;
        Ok(&resource.words()[range])
    }

    /// Borrow the view at `slot` for writing as words
    pub fn view_words_mut(&mut self, slot: u32) -> Result<&mut [u32]> {
        let view = self.view(slot)?;
        let invocation = self.invocation;
        let name = invocation.kernel.name();
        let resource = self.arena.resource_mut(view.resource)?;
        if resource.state != ResourceStates::UNORDERED_ACCESS {
            log::error!(
                "{}: slot {} resource {:?} in state {:?}, expected UNORDERED_ACCESS",
                name,
                slot,
                view.resource,
                resource.state
            );
            return Err(Error::ResourceStateMismatch);
        }
        let range = Self::word_range(&view, resource.desc.size)?;
        Ok(&mut resource.words_mut()[range])
    }
}

impl fmt::Debug for KernelContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext")
            .field("kernel", &self.invocation.kernel.name())
            .field("thread_groups", &self.invocation.thread_groups)
            .field("views", &self.views)
            .finish()
    }
}
