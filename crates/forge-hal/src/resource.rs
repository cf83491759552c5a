//! # Committed Resources
//!
//! Buffers backed by device memory, their heap kinds, usage states and CPU
//! mappings.
//!
//! Device memory lives in an index arena owned by the device. Storage is kept
//! as 32-bit words so typed element views never need realignment.

use core::fmt;
use core::ops::Range;

use forge_core::{align_up, DescriptorHeapId, Error, ResourceId, Result};

use crate::descriptor::{DescriptorHeapDesc, DescriptorHeapSlot};
use crate::device::DeviceShared;

// =============================================================================
// HEAP KIND
// =============================================================================

/// Memory heap a committed resource is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// CPU-writable, GPU-readable
    Upload,
    /// Device-local, not CPU-visible
    Default,
    /// GPU-writable, CPU-readable
    Readback,
}

impl HeapKind {
    /// All heap kinds
    pub const ALL: [HeapKind; 3] = [HeapKind::Upload, HeapKind::Default, HeapKind::Readback];

    /// Check if the CPU can map resources in this heap
    pub const fn is_cpu_visible(self) -> bool {
        !matches!(self, HeapKind::Default)
    }

    /// State a resource in this heap is pinned to, if any
    pub const fn required_state(self) -> Option<ResourceStates> {
        match self {
            HeapKind::Upload => Some(ResourceStates::GENERIC_READ),
            HeapKind::Readback => Some(ResourceStates::COPY_DEST),
            HeapKind::Default => None,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            HeapKind::Upload => 0,
            HeapKind::Default => 1,
            HeapKind::Readback => 2,
        }
    }
}

// =============================================================================
// RESOURCE STATES
// =============================================================================

bitflags::bitflags! {
    /// Usage state of a resource
    ///
    /// `COMMON` is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        /// No particular usage
        const COMMON = 0;
        /// Destination of a copy
        const COPY_DEST = 1 << 0;
        /// Source of a copy
        const COPY_SOURCE = 1 << 1;
        /// Read/write from compute shaders
        const UNORDERED_ACCESS = 1 << 2;
        /// Shader read from non-pixel stages
        const NON_PIXEL_SHADER_RESOURCE = 1 << 3;
        /// Required state of upload heap resources
        const GENERIC_READ = Self::COPY_SOURCE.bits() | Self::NON_PIXEL_SHADER_RESOURCE.bits();
    }
}

bitflags::bitflags! {
    /// Resource creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u32 {
        /// Resource may be viewed as an unordered-access view
        const ALLOW_UNORDERED_ACCESS = 1 << 0;
    }
}

// =============================================================================
// RESOURCE DESCRIPTION
// =============================================================================

/// Buffer resource description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Width in bytes
    pub size: u64,
    /// Creation flags
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    /// Describe a plain buffer
    pub const fn buffer(size: u64) -> Self {
        Self {
            size,
            flags: ResourceFlags::empty(),
        }
    }

    /// Replace the creation flags
    pub const fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }
}

// =============================================================================
// RESOURCE ARENA
// =============================================================================

/// One committed buffer in device memory
pub(crate) struct ResourceSlot {
    pub(crate) desc: ResourceDesc,
    pub(crate) heap: HeapKind,
    pub(crate) state: ResourceStates,
    words: Vec<u32>,
    pub(crate) map_count: u32,
}

impl ResourceSlot {
    pub(crate) fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.desc.size as usize]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.desc.size as usize;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..size]
    }

    /// Whole 32-bit words backing the buffer
    pub(crate) fn words(&self) -> &[u32] {
        &self.words
    }

    pub(crate) fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    fn footprint(&self) -> u64 {
        self.words.len() as u64 * 4
    }
}

impl fmt::Debug for ResourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSlot")
            .field("desc", &self.desc)
            .field("heap", &self.heap)
            .field("state", &self.state)
            .field("map_count", &self.map_count)
            .finish_non_exhaustive()
    }
}

/// Device-owned storage for resources and descriptor heaps
///
/// Handles are `index + 1`; slots are never reused, so a stale handle
/// resolves to `NotFound` instead of aliasing a newer object.
#[derive(Debug, Default)]
pub(crate) struct ResourceArena {
    resources: Vec<Option<ResourceSlot>>,
    heaps: Vec<Option<DescriptorHeapSlot>>,
    usage: [u64; 3],
}

impl ResourceArena {
    pub(crate) fn create_resource(
        &mut self,
        heap: HeapKind,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
        budget: u64,
    ) -> Result<ResourceId> {
        let footprint = align_up(desc.size, 4);
        let used = self.usage[heap.index()];
        if used + footprint > budget {
            log::warn!(
                "{:?} heap budget exhausted: {} + {} > {}",
                heap,
                used,
                footprint,
                budget
            );
            return Err(Error::OutOfMemory);
        }

        let slot = ResourceSlot {
            desc: *desc,
            heap,
            state: initial_state,
            words: vec![0; (footprint / 4) as usize],
            map_count: 0,
        };
        self.usage[heap.index()] = used + footprint;
        self.resources.push(Some(slot));
        Ok(ResourceId::new(self.resources.len() as u64))
    }

    pub(crate) fn destroy_resource(&mut self, id: ResourceId) -> Result<()> {
        let index = Self::index(id.id())?;
        let slot = self
            .resources
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(Error::NotFound)?;
        self.usage[slot.heap.index()] -= slot.footprint();
        Ok(())
    }

    pub(crate) fn resource(&self, id: ResourceId) -> Result<&ResourceSlot> {
        let index = Self::index(id.id())?;
        self.resources
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(Error::NotFound)
    }

    pub(crate) fn resource_mut(&mut self, id: ResourceId) -> Result<&mut ResourceSlot> {
        let index = Self::index(id.id())?;
        self.resources
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::NotFound)
    }

    /// Borrow two distinct resources, the first mutably
    pub(crate) fn resource_pair_mut(
        &mut self,
        dst: ResourceId,
        src: ResourceId,
    ) -> Result<(&mut ResourceSlot, &ResourceSlot)> {
        let dst_index = Self::index(dst.id())?;
        let src_index = Self::index(src.id())?;
        if dst_index == src_index {
            return Err(Error::InvalidCommand);
        }
        if dst_index >= self.resources.len() || src_index >= self.resources.len() {
            return Err(Error::NotFound);
        }

        let (dst_slot, src_slot) = if dst_index < src_index {
            let (low, high) = self.resources.split_at_mut(src_index);
            (&mut low[dst_index], &high[0])
        } else {
            let (low, high) = self.resources.split_at_mut(dst_index);
            (&mut high[0], &low[src_index])
        };
        match (dst_slot.as_mut(), src_slot.as_ref()) {
            (Some(d), Some(s)) => Ok((d, s)),
            _ => Err(Error::NotFound),
        }
    }

    pub(crate) fn create_heap(&mut self, desc: &DescriptorHeapDesc) -> DescriptorHeapId {
        self.heaps.push(Some(DescriptorHeapSlot::new(*desc)));
        DescriptorHeapId::new(self.heaps.len() as u64)
    }

    pub(crate) fn destroy_heap(&mut self, id: DescriptorHeapId) -> Result<()> {
        let index = Self::index(id.id())?;
        self.heaps
            .get_mut(index)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    pub(crate) fn heap(&self, id: DescriptorHeapId) -> Result<&DescriptorHeapSlot> {
        let index = Self::index(id.id())?;
        self.heaps
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidDescriptorHandle)
    }

    pub(crate) fn heap_mut(&mut self, id: DescriptorHeapId) -> Result<&mut DescriptorHeapSlot> {
        let index = Self::index(id.id())?;
        self.heaps
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidDescriptorHandle)
    }

    /// Bytes committed in one heap
    pub(crate) fn usage(&self, heap: HeapKind) -> u64 {
        self.usage[heap.index()]
    }

    fn index(id: u64) -> Result<usize> {
        if id == 0 {
            return Err(Error::NotFound);
        }
        Ok((id - 1) as usize)
    }
}

// =============================================================================
// MAPPING
// =============================================================================

/// CPU mapping of an upload or readback buffer
///
/// Dropping a mapping unmaps it with an empty written range.
pub struct Mapping<'d> {
    shared: &'d DeviceShared,
    resource: ResourceId,
    heap: HeapKind,
    size: u64,
    active: bool,
}

impl<'d> Mapping<'d> {
    pub(crate) fn new(
        shared: &'d DeviceShared,
        resource: ResourceId,
        heap: HeapKind,
        size: u64,
    ) -> Self {
        Self {
            shared,
            resource,
            heap,
            size,
            active: true,
        }
    }

    /// Get the mapped resource
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Get the mapped size in bytes
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Check for an empty mapping
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copy `out.len()` bytes starting at `offset` out of the buffer
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.checked_range(offset, out.len() as u64)?;
        let arena = self.shared.arena.lock();
        let slot = arena.resource(self.resource)?;
        out.copy_from_slice(&slot.bytes()[range]);
        Ok(())
    }

    /// Copy a byte range out of the buffer
    pub fn read_bytes(&self, range: Range<u64>) -> Result<Vec<u8>> {
        if range.start > range.end {
            return Err(Error::InvalidParameter);
        }
        let mut out = vec![0; (range.end - range.start) as usize];
        self.read(range.start, &mut out)?;
        Ok(out)
    }

    /// Write `data` at `offset`; upload heap only
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.heap != HeapKind::Upload {
            return Err(Error::MappingFailed);
        }
        let range = self.checked_range(offset, data.len() as u64)?;
        let mut arena = self.shared.arena.lock();
        let slot = arena.resource_mut(self.resource)?;
        slot.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    /// Unmap, declaring the byte range the CPU wrote
    ///
    /// An empty range declares that nothing was written.
    pub fn unmap(mut self, written: Range<u64>) {
        self.release(written);
    }

    fn checked_range(&self, offset: u64, len: u64) -> Result<Range<usize>> {
        let end = offset.checked_add(len).ok_or(Error::BufferOverflow)?;
        if end > self.size {
            return Err(Error::BufferOverflow);
        }
        Ok(offset as usize..end as usize)
    }

    fn release(&mut self, written: Range<u64>) {
        if !self.active {
            return;
        }
        self.active = false;
        log::trace!(
            "unmap {:?} written {}..{}",
            self.resource,
            written.start,
            written.end
        );
        let mut arena = self.shared.arena.lock();
        if let Ok(slot) = arena.resource_mut(self.resource) {
            slot.map_count = slot.map_count.saturating_sub(1);
        }
    }
}

impl fmt::Debug for Mapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("resource", &self.resource)
            .field("heap", &self.heap)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        self.release(0..0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_required_state() {
        assert_eq!(
            HeapKind::Upload.required_state(),
            Some(ResourceStates::GENERIC_READ)
        );
        assert_eq!(
            HeapKind::Readback.required_state(),
            Some(ResourceStates::COPY_DEST)
        );
        assert!(HeapKind::Default.required_state().is_none());
        assert!(!HeapKind::Default.is_cpu_visible());
    }

    #[test]
    fn test_generic_read_is_copy_source() {
        assert!(ResourceStates::GENERIC_READ.contains(ResourceStates::COPY_SOURCE));
        assert!(ResourceStates::COMMON.is_empty());
    }

    #[test]
    fn test_arena_budget_and_release() {
        let mut arena = ResourceArena::default();
        let desc = ResourceDesc::buffer(10);
        let id = arena
            .create_resource(HeapKind::Default, &desc, ResourceStates::COMMON, 16)
            .expect("first buffer fits");
        assert_eq!(arena.usage(HeapKind::Default), 12);
        assert_eq!(
            arena.create_resource(HeapKind::Default, &desc, ResourceStates::COMMON, 16),
            Err(Error::OutOfMemory)
        );

        arena.destroy_resource(id).expect("destroy");
        assert_eq!(arena.usage(HeapKind::Default), 0);
        assert_eq!(arena.resource(id).map(|_| ()), Err(Error::NotFound));
        assert_eq!(arena.destroy_resource(id), Err(Error::NotFound));
    }

    #[test]
    fn test_slot_bytes_trimmed_to_size() {
        let mut arena = ResourceArena::default();
        let id = arena
            .create_resource(
                HeapKind::Upload,
                &ResourceDesc::buffer(6),
                ResourceStates::GENERIC_READ,
                u64::MAX,
            )
            .expect("create");
        let slot = arena.resource_mut(id).expect("slot");
        assert_eq!(slot.bytes().len(), 6);
        assert_eq!(slot.words().len(), 2);
        slot.bytes_mut()[5] = 0xAB;
        assert_eq!(slot.words()[1].to_ne_bytes(), [0, 0xAB, 0, 0]);
    }

    #[test]
    fn test_resource_pair_rejects_alias() {
        let mut arena = ResourceArena::default();
        let a = arena
            .create_resource(
                HeapKind::Default,
                &ResourceDesc::buffer(4),
                ResourceStates::COMMON,
                u64::MAX,
            )
            .expect("create");
        assert_eq!(
            arena.resource_pair_mut(a, a).map(|_| ()),
            Err(Error::InvalidCommand)
        );
    }
}
