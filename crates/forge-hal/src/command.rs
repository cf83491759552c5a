//! # Command Lists
//!
//! Command allocators and command lists.
//!
//! Recording never fails at the call site. The first recording error is
//! latched and returned by [`CommandList::close`], so a list that closes
//! cleanly is always safe to submit.

use std::sync::Arc;

use forge_core::{DescriptorHeapId, Error, ResourceId, Result};

use crate::descriptor::GpuDescriptorHandle;
use crate::kernel::KernelInvocation;
use crate::pipeline::{ComputePipelineState, RootParameter, RootSignature};
use crate::resource::ResourceStates;

// =============================================================================
// COMMAND LIST TYPE
// =============================================================================

/// Queue class a list or allocator belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListType {
    /// Graphics, compute and copy
    Direct,
    /// Compute and copy
    Compute,
    /// Copy only
    Copy,
}

impl CommandListType {
    /// Check if lists of this type may record dispatches
    pub const fn supports_dispatch(self) -> bool {
        !matches!(self, CommandListType::Copy)
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Resource barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBarrier {
    /// Usage state change
    Transition {
        /// Resource to transition
        resource: ResourceId,
        /// State the resource is in
        before: ResourceStates,
        /// State after the barrier
        after: ResourceStates,
    },
    /// Order unordered-access writes against later accesses
    Uav {
        /// Resource, or all resources when `None`
        resource: Option<ResourceId>,
    },
}

impl ResourceBarrier {
    /// Transition barrier
    pub const fn transition(
        resource: ResourceId,
        before: ResourceStates,
        after: ResourceStates,
    ) -> Self {
        ResourceBarrier::Transition {
            resource,
            before,
            after,
        }
    }

    /// UAV barrier on one resource
    pub const fn uav(resource: ResourceId) -> Self {
        ResourceBarrier::Uav {
            resource: Some(resource),
        }
    }

    /// UAV barrier on all resources
    pub const fn uav_all() -> Self {
        ResourceBarrier::Uav { resource: None }
    }
}

/// A recorded command
#[derive(Debug, Clone)]
pub enum Command {
    /// Copy a byte range between buffers
    CopyBufferRegion {
        /// Destination buffer
        dst: ResourceId,
        /// Destination offset
        dst_offset: u64,
        /// Source buffer
        src: ResourceId,
        /// Source offset
        src_offset: u64,
        /// Bytes to copy
        size: u64,
    },
    /// Copy a whole buffer into one of equal size
    CopyResource {
        /// Destination buffer
        dst: ResourceId,
        /// Source buffer
        src: ResourceId,
    },
    /// Resource barrier
    Barrier(ResourceBarrier),
    /// Kernel dispatch
    Dispatch(KernelInvocation),
}

// =============================================================================
// COMMAND ALLOCATOR
// =============================================================================

/// Backing store for command list recordings
///
/// Reset only after every list recorded against it finished executing.
#[derive(Debug)]
pub struct CommandAllocator {
    ty: CommandListType,
    /// Lists recorded since the last reset
    recordings: u32,
}

impl CommandAllocator {
    pub(crate) fn new(ty: CommandListType) -> Self {
        Self { ty, recordings: 0 }
    }

    /// Get the list type
    pub fn ty(&self) -> CommandListType {
        self.ty
    }

    /// Number of recordings since the last reset
    pub fn recordings(&self) -> u32 {
        self.recordings
    }

    /// Reclaim recording memory
    pub fn reset(&mut self) -> Result<()> {
        log::trace!("allocator reset after {} recordings", self.recordings);
        self.recordings = 0;
        Ok(())
    }
}

// =============================================================================
// COMMAND LIST
// =============================================================================

/// Recording state of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// Accepting commands
    Recording,
    /// Closed and ready for submission
    Closed,
}

/// Compute state bound while recording
#[derive(Debug, Default)]
struct BoundState {
    heaps: Vec<DescriptorHeapId>,
    root_signature: Option<RootSignature>,
    pipeline: Option<ComputePipelineState>,
    constants: Vec<Option<Vec<u32>>>,
    tables: Vec<Option<GpuDescriptorHandle>>,
}

/// Command list
#[derive(Debug)]
pub struct CommandList {
    ty: CommandListType,
    state: CommandListState,
    commands: Vec<Command>,
    closed: Option<Arc<[Command]>>,
    error: Option<Error>,
    bound: BoundState,
}

impl CommandList {
    pub(crate) fn new(allocator: &mut CommandAllocator) -> Self {
        allocator.recordings += 1;
        Self {
            ty: allocator.ty,
            state: CommandListState::Recording,
            commands: Vec::new(),
            closed: None,
            error: None,
            bound: BoundState::default(),
        }
    }

    /// Get the list type
    pub fn ty(&self) -> CommandListType {
        self.ty
    }

    /// Get the recording state
    pub fn state(&self) -> CommandListState {
        self.state
    }

    /// Number of commands recorded so far
    pub fn len(&self) -> usize {
        match &self.closed {
            Some(commands) => commands.len(),
            None => self.commands.len(),
        }
    }

    /// Check for an empty recording
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands of a closed list
    pub fn recorded(&self) -> Result<Arc<[Command]>> {
        self.closed.clone().ok_or(Error::CommandListNotClosed)
    }

    // =========================================================================
    // State binding
    // =========================================================================

    /// Bind shader-visible descriptor heaps
    pub fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapId]) {
        if !self.recording() {
            return;
        }
        log::trace!("set_descriptor_heaps {:?}", heaps);
        self.bound.heaps = heaps.to_vec();
    }

    /// Bind a compute root signature, clearing root arguments
    pub fn set_compute_root_signature(&mut self, root_signature: &RootSignature) {
        if !self.recording() {
            return;
        }
        let count = root_signature.desc().parameters.len();
        self.bound.constants = vec![None; count];
        self.bound.tables = vec![None; count];
        self.bound.root_signature = Some(root_signature.clone());
    }

    /// Set inline root constants starting at `offset`
    pub fn set_compute_root_32bit_constants(&mut self, index: u32, values: &[u32], offset: u32) {
        if !self.recording() {
            return;
        }
        let Some(root) = self.bound.root_signature.clone() else {
            self.fail(Error::InvalidCommand, "root constants without a root signature");
            return;
        };
        let Some(RootParameter::Constants { num_values, .. }) = root.parameter(index) else {
            self.fail(Error::InvalidCommand, "root index is not a constants slot");
            return;
        };
        let end = offset as usize + values.len();
        if end > *num_values as usize {
            self.fail(Error::InvalidCommand, "root constants overflow their slot");
            return;
        }
        let slot = self.bound.constants[index as usize]
            .get_or_insert_with(|| vec![0; *num_values as usize]);
        slot[offset as usize..end].copy_from_slice(values);
    }

    /// Bind a descriptor table at a root index
    pub fn set_compute_root_descriptor_table(&mut self, index: u32, base: GpuDescriptorHandle) {
        if !self.recording() {
            return;
        }
        let is_table = matches!(
            self.bound
                .root_signature
                .as_ref()
                .and_then(|root| root.parameter(index)),
            Some(RootParameter::DescriptorTable { .. })
        );
        if !is_table {
            self.fail(Error::InvalidCommand, "root index is not a descriptor table");
            return;
        }
        self.bound.tables[index as usize] = Some(base);
    }

    /// Bind a compute pipeline state
    pub fn set_pipeline_state(&mut self, pipeline: &ComputePipelineState) {
        if !self.recording() {
            return;
        }
        self.bound.pipeline = Some(pipeline.clone());
    }

    // =========================================================================
    // Work
    // =========================================================================

    /// Dispatch the bound pipeline
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if !self.recording() {
            return;
        }
        match self.resolve_dispatch(x, y, z) {
            Ok(invocation) => self.push(Command::Dispatch(invocation)),
            Err(e) => self.fail(e, "dispatch with incomplete compute state"),
        }
    }

    /// Record a pre-resolved kernel dispatch
    ///
    /// The invocation's table must live in a bound descriptor heap.
    pub fn dispatch_kernel(&mut self, invocation: KernelInvocation) {
        if !self.recording() {
            return;
        }
        if !self.ty.supports_dispatch() {
            self.fail(Error::InvalidCommand, "dispatch on a copy list");
            return;
        }
        if invocation.table.is_some() && self.bound.heaps.is_empty() {
            self.fail(Error::InvalidCommand, "descriptor table without a bound heap");
            return;
        }
        self.push(Command::Dispatch(invocation));
    }

    /// Copy a byte range between buffers
    pub fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) {
        if !self.recording() {
            return;
        }
        self.push(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        });
    }

    /// Copy a whole buffer
    pub fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) {
        if !self.recording() {
            return;
        }
        self.push(Command::CopyResource { dst, src });
    }

    /// Record resource barriers
    pub fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        if !self.recording() {
            return;
        }
        for barrier in barriers {
            if let ResourceBarrier::Transition { before, after, .. } = barrier {
                if before == after {
                    self.fail(Error::InvalidCommand, "transition to the same state");
                    return;
                }
            }
            self.push(Command::Barrier(*barrier));
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Finish recording
    ///
    /// Returns the first recording error, if any.
    pub fn close(&mut self) -> Result<()> {
        if self.state == CommandListState::Closed {
            return Err(Error::CommandListClosed);
        }
        self.state = CommandListState::Closed;
        self.closed = Some(core::mem::take(&mut self.commands).into());
        match self.error {
            Some(e) => {
                log::warn!("command list closed with error: {}", e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Reopen a closed list against an allocator
    pub fn reset(&mut self, allocator: &mut CommandAllocator) -> Result<()> {
        if self.state != CommandListState::Closed {
            return Err(Error::CommandListNotClosed);
        }
        if allocator.ty != self.ty {
            return Err(Error::InvalidParameter);
        }
        allocator.recordings += 1;
        self.state = CommandListState::Recording;
        self.commands.clear();
        self.closed = None;
        self.error = None;
        self.bound = BoundState::default();
        Ok(())
    }

    fn recording(&self) -> bool {
        if self.state == CommandListState::Closed {
            log::warn!("recording into a closed command list");
            return false;
        }
        true
    }

    fn push(&mut self, command: Command) {
        log::trace!("record {:?}", command);
        self.commands.push(command);
    }

    fn fail(&mut self, error: Error, what: &str) {
        log::warn!("command list: {}", what);
        self.error.get_or_insert(error);
    }

    fn resolve_dispatch(&self, x: u32, y: u32, z: u32) -> Result<KernelInvocation> {
        if !self.ty.supports_dispatch() {
            return Err(Error::InvalidCommand);
        }
        let pipeline = self.bound.pipeline.as_ref().ok_or(Error::InvalidCommand)?;
        let root = self
            .bound
            .root_signature
            .as_ref()
            .ok_or(Error::InvalidCommand)?;
        if !root.same_as(pipeline.root_signature()) {
            return Err(Error::InvalidCommand);
        }

        let mut invocation = KernelInvocation::new(pipeline.kernel().clone())
            .with_thread_groups(x, y, z);
        for (index, parameter) in root.desc().parameters.iter().enumerate() {
            match parameter {
                RootParameter::Constants { .. } => {
                    let values = self.bound.constants[index]
                        .as_ref()
                        .ok_or(Error::InvalidCommand)?;
                    invocation.constants.extend_from_slice(values);
                }
                RootParameter::DescriptorTable { .. } => {
                    if invocation.table.is_some() || self.bound.heaps.is_empty() {
                        return Err(Error::InvalidCommand);
                    }
                    let start = self.bound.tables[index].ok_or(Error::InvalidCommand)?;
                    invocation = invocation.with_table(start, parameter.descriptor_count());
                }
            }
        }
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> (CommandAllocator, CommandList) {
        let mut allocator = CommandAllocator::new(CommandListType::Compute);
        let list = CommandList::new(&mut allocator);
        (allocator, list)
    }

    #[test]
    fn test_close_and_reset_cycle() {
        let (mut allocator, mut list) = list();
        list.copy_resource(ResourceId::new(1), ResourceId::new(2));
        assert_eq!(list.recorded().map(|_| ()), Err(Error::CommandListNotClosed));
        list.close().expect("clean close");
        assert_eq!(list.recorded().map(|c| c.len()), Ok(1));
        assert_eq!(list.close(), Err(Error::CommandListClosed));

        list.reset(&mut allocator).expect("reset closed list");
        assert!(list.is_empty());
        assert_eq!(list.state(), CommandListState::Recording);
    }

    #[test]
    fn test_reset_requires_closed() {
        let (mut allocator, mut list) = list();
        assert_eq!(list.reset(&mut allocator), Err(Error::CommandListNotClosed));
    }

    #[test]
    fn test_dispatch_without_pipeline_latches() {
        let (_allocator, mut list) = list();
        list.dispatch(1, 1, 1);
        list.copy_resource(ResourceId::new(1), ResourceId::new(2));
        assert_eq!(list.close(), Err(Error::InvalidCommand));
    }

    #[test]
    fn test_same_state_transition_rejected() {
        let (_allocator, mut list) = list();
        let id = ResourceId::new(1);
        list.resource_barrier(&[ResourceBarrier::transition(
            id,
            ResourceStates::COPY_DEST,
            ResourceStates::COPY_DEST,
        )]);
        assert_eq!(list.close(), Err(Error::InvalidCommand));
    }

    #[test]
    fn test_allocator_type_must_match() {
        let (_allocator, mut list) = list();
        list.close().expect("close");
        let mut copy = CommandAllocator::new(CommandListType::Copy);
        assert_eq!(list.reset(&mut copy), Err(Error::InvalidParameter));
    }
}
