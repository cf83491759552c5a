//! # Descriptor Heaps
//!
//! Fixed-capacity arrays of unordered-access views addressed through CPU and
//! GPU descriptor handles.
//!
//! A handle is `heap_start + index * increment`. Heap starts are laid out so
//! a handle always decodes back to its heap and slot:
//!
//! ```text
//!  63      56 55                32 31                    0
//! ┌──────────┬────────────────────┬───────────────────────┐
//! │ space    │      heap id       │  index * increment    │
//! └──────────┴────────────────────┴───────────────────────┘
//! ```

use core::fmt;

use forge_core::{DescriptorHeapId, Error, ResourceId, Result};

const CPU_SPACE: u64 = 1;
const GPU_SPACE: u64 = 2;
const SPACE_SHIFT: u32 = 56;
const HEAP_SHIFT: u32 = 32;
const HEAP_MASK: u64 = 0x00FF_FFFF;
const OFFSET_MASK: u64 = 0xFFFF_FFFF;

// =============================================================================
// HEAP DESCRIPTION
// =============================================================================

/// Kind of descriptors a heap holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant-buffer, shader-resource and unordered-access views
    CbvSrvUav,
}

/// Descriptor heap description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// Descriptor kind
    pub kind: DescriptorHeapKind,
    /// Number of slots
    pub capacity: u32,
    /// Heap can be bound to command lists
    pub shader_visible: bool,
}

impl DescriptorHeapDesc {
    /// Shader-visible view heap with `capacity` slots
    pub const fn shader_visible(capacity: u32) -> Self {
        Self {
            kind: DescriptorHeapKind::CbvSrvUav,
            capacity,
            shader_visible: true,
        }
    }
}

// =============================================================================
// VIEW DESCRIPTION
// =============================================================================

/// Element format of a buffer view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// 32-bit float elements
    R32Float,
    /// 32-bit unsigned integer elements
    R32Uint,
    /// Raw 32-bit words
    R32Typeless,
}

impl Format {
    /// Element size in bytes
    pub const fn element_size(self) -> u64 {
        match self {
            Format::R32Float | Format::R32Uint | Format::R32Typeless => 4,
        }
    }
}

/// Unordered-access view over a buffer range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnorderedAccessViewDesc {
    /// Element format
    pub format: Format,
    /// First element in the buffer
    pub first_element: u64,
    /// Number of elements in the view
    pub num_elements: u32,
}

impl UnorderedAccessViewDesc {
    /// View `num_elements` elements from the start of the buffer
    pub const fn buffer(format: Format, num_elements: u32) -> Self {
        Self {
            format,
            first_element: 0,
            num_elements,
        }
    }

    /// Byte range covered by the view
    pub const fn byte_range(&self) -> core::ops::Range<u64> {
        let size = self.format.element_size();
        let start = self.first_element * size;
        start..start + self.num_elements as u64 * size
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// CPU descriptor handle, used to write descriptors
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle {
    /// Raw pointer value
    pub ptr: u64,
}

/// GPU descriptor handle, used to bind descriptor tables
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle {
    /// Raw pointer value
    pub ptr: u64,
}

impl CpuDescriptorHandle {
    pub(crate) const fn heap_start(heap: DescriptorHeapId) -> Self {
        Self {
            ptr: (CPU_SPACE << SPACE_SHIFT) | (heap.id() << HEAP_SHIFT),
        }
    }

    /// Advance by `index` descriptors of `increment` bytes
    pub const fn offset(self, index: u32, increment: u32) -> Self {
        Self {
            ptr: self.ptr + index as u64 * increment as u64,
        }
    }

    pub(crate) fn decode(self, increment: u32) -> Result<(DescriptorHeapId, u32)> {
        decode(self.ptr, CPU_SPACE, increment)
    }
}

impl GpuDescriptorHandle {
    pub(crate) const fn heap_start(heap: DescriptorHeapId) -> Self {
        Self {
            ptr: (GPU_SPACE << SPACE_SHIFT) | (heap.id() << HEAP_SHIFT),
        }
    }

    /// Advance by `index` descriptors of `increment` bytes
    pub const fn offset(self, index: u32, increment: u32) -> Self {
        Self {
            ptr: self.ptr + index as u64 * increment as u64,
        }
    }

    pub(crate) fn decode(self, increment: u32) -> Result<(DescriptorHeapId, u32)> {
        decode(self.ptr, GPU_SPACE, increment)
    }
}

fn decode(ptr: u64, space: u64, increment: u32) -> Result<(DescriptorHeapId, u32)> {
    if ptr >> SPACE_SHIFT != space || increment == 0 {
        return Err(Error::InvalidDescriptorHandle);
    }
    let heap = (ptr >> HEAP_SHIFT) & HEAP_MASK;
    let offset = ptr & OFFSET_MASK;
    if offset % increment as u64 != 0 {
        return Err(Error::InvalidDescriptorHandle);
    }
    Ok((DescriptorHeapId::new(heap), (offset / increment as u64) as u32))
}

impl fmt::Debug for CpuDescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuDescriptorHandle(0x{:016x})", self.ptr)
    }
}

impl fmt::Debug for GpuDescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDescriptorHandle(0x{:016x})", self.ptr)
    }
}

// =============================================================================
// HEAP STORAGE
// =============================================================================

/// A view written into a heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UavView {
    pub(crate) resource: ResourceId,
    pub(crate) desc: UnorderedAccessViewDesc,
}

/// Device-side storage of one descriptor heap
#[derive(Debug)]
pub(crate) struct DescriptorHeapSlot {
    pub(crate) desc: DescriptorHeapDesc,
    views: Vec<Option<UavView>>,
}

impl DescriptorHeapSlot {
    pub(crate) fn new(desc: DescriptorHeapDesc) -> Self {
        Self {
            desc,
            views: vec![None; desc.capacity as usize],
        }
    }

    /// Overwrite a slot; `None` writes a null descriptor
    pub(crate) fn write(&mut self, index: u32, view: Option<UavView>) -> Result<()> {
        let slot = self
            .views
            .get_mut(index as usize)
            .ok_or(Error::DescriptorOutOfRange)?;
        *slot = view;
        Ok(())
    }

    pub(crate) fn view(&self, index: u32) -> Result<Option<UavView>> {
        self.views
            .get(index as usize)
            .copied()
            .ok_or(Error::DescriptorOutOfRange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_arithmetic() {
        let heap = DescriptorHeapId::new(3);
        let start = CpuDescriptorHandle::heap_start(heap);
        let h = start.offset(5, 32);
        assert_eq!(h.ptr - start.ptr, 160);
        assert_eq!(h.decode(32), Ok((heap, 5)));
    }

    #[test]
    fn test_handle_spaces_do_not_mix() {
        let heap = DescriptorHeapId::new(1);
        let gpu = GpuDescriptorHandle::heap_start(heap).offset(1, 32);
        let forged = CpuDescriptorHandle { ptr: gpu.ptr };
        assert_eq!(forged.decode(32), Err(Error::InvalidDescriptorHandle));
        assert_eq!(gpu.decode(32), Ok((heap, 1)));
    }

    #[test]
    fn test_misaligned_handle() {
        let start = GpuDescriptorHandle::heap_start(DescriptorHeapId::new(1));
        let h = GpuDescriptorHandle { ptr: start.ptr + 7 };
        assert_eq!(h.decode(32), Err(Error::InvalidDescriptorHandle));
    }

    #[test]
    fn test_heap_slot_bounds() {
        let mut slot = DescriptorHeapSlot::new(DescriptorHeapDesc::shader_visible(2));
        let view = UavView {
            resource: ResourceId::new(1),
            desc: UnorderedAccessViewDesc::buffer(Format::R32Float, 4),
        };
        slot.write(1, Some(view)).expect("in range");
        assert_eq!(slot.view(1), Ok(Some(view)));
        assert_eq!(slot.view(0), Ok(None));
        assert_eq!(slot.write(2, Some(view)), Err(Error::DescriptorOutOfRange));
    }

    #[test]
    fn test_view_byte_range() {
        let desc = UnorderedAccessViewDesc {
            format: Format::R32Typeless,
            first_element: 2,
            num_elements: 3,
        };
        assert_eq!(desc.byte_range(), 8..20);
    }
}
