//! # Resource Pool
//!
//! Allocates committed buffers, stages uploads, tracks usage states and
//! writes views into one shader-visible descriptor heap.
//!
//! Tracked states describe the buffer as of the end of everything recorded
//! so far, which is the state the next recorded barrier must start from.

use hashbrown::HashMap;

use forge_cmd::CommandChannel;
use forge_core::{DescriptorHeapId, Error, ResourceId, Result};
use forge_hal::{
    CpuDescriptorHandle, DescriptorHeapDesc, Device, Format, GpuDescriptorHandle, HeapKind,
    ResourceBarrier, ResourceDesc, ResourceFlags, ResourceStates, UnorderedAccessViewDesc,
};

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Resource pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots in the pool's descriptor heap
    pub descriptor_capacity: u32,
    /// Pool name for debugging
    pub name: &'static str,
}

impl PoolConfig {
    /// Configuration with a given descriptor capacity
    pub const fn with_capacity(descriptor_capacity: u32) -> Self {
        Self {
            descriptor_capacity,
            name: "resource_pool",
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::with_capacity(8)
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Buffer owned by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Buffer {
    id: ResourceId,
    size: u64,
    heap: HeapKind,
}

impl Buffer {
    /// Device resource
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Heap the buffer lives in
    pub fn heap(&self) -> HeapKind {
        self.heap
    }
}

/// One slot of the pool's descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Slot index
    pub index: u32,
    /// CPU handle
    pub cpu: CpuDescriptorHandle,
    /// GPU handle
    pub gpu: GpuDescriptorHandle,
}

/// Contiguous descriptor slots for a binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRange {
    /// Heap the range lives in
    pub heap: DescriptorHeapId,
    /// First slot
    pub base: u32,
    /// Number of slots
    pub count: u32,
    /// CPU handle of the first slot
    pub cpu: CpuDescriptorHandle,
    /// GPU handle of the first slot
    pub gpu: GpuDescriptorHandle,
    /// Handle increment
    pub increment: u32,
}

impl TableRange {
    /// CPU handle of slot `index` within the range
    pub fn cpu_at(&self, index: u32) -> CpuDescriptorHandle {
        self.cpu.offset(index, self.increment)
    }

    /// GPU handle of slot `index` within the range
    pub fn gpu_at(&self, index: u32) -> GpuDescriptorHandle {
        self.gpu.offset(index, self.increment)
    }
}

// =============================================================================
// RESOURCE POOL
// =============================================================================

/// A tracked buffer
#[derive(Debug, Clone, Copy)]
struct Tracked {
    buffer: Buffer,
    state: ResourceStates,
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Buffers allocated
    pub allocations: u64,
    /// Buffers released
    pub releases: u64,
    /// Bytes staged for upload
    pub bytes_uploaded: u64,
    /// Bytes read back
    pub bytes_read_back: u64,
}

/// Buffer and descriptor pool bound to one device
#[derive(Debug)]
pub struct ResourcePool<'d> {
    device: &'d Device,
    config: PoolConfig,
    heap: DescriptorHeapId,
    heap_cpu: CpuDescriptorHandle,
    heap_gpu: GpuDescriptorHandle,
    buffers: HashMap<ResourceId, Tracked>,
    staging: Vec<Buffer>,
    stats: PoolStats,
}

impl<'d> ResourcePool<'d> {
    /// Create a pool with the default configuration
    pub fn new(device: &'d Device) -> Result<Self> {
        Self::with_config(device, PoolConfig::default())
    }

    /// Create a pool
    pub fn with_config(device: &'d Device, config: PoolConfig) -> Result<Self> {
        let heap =
            device.create_descriptor_heap(&DescriptorHeapDesc::shader_visible(config.descriptor_capacity))?;
        let heap_cpu = device.cpu_descriptor_handle_for_heap_start(heap)?;
        let heap_gpu = device.gpu_descriptor_handle_for_heap_start(heap)?;
        log::debug!(
            "{}: {} descriptor slots",
            config.name,
            config.descriptor_capacity
        );

        Ok(Self {
            device,
            config,
            heap,
            heap_cpu,
            heap_gpu,
            buffers: HashMap::new(),
            staging: Vec::new(),
            stats: PoolStats::default(),
        })
    }

    /// Device the pool allocates from
    pub fn device(&self) -> &'d Device {
        self.device
    }

    /// Shader-visible descriptor heap
    pub fn heap(&self) -> DescriptorHeapId {
        self.heap
    }

    /// Descriptor heap capacity
    pub fn capacity(&self) -> u32 {
        self.config.descriptor_capacity
    }

    /// Pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Number of live buffers, staging included
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Number of staging buffers awaiting release
    pub fn pending_staging(&self) -> usize {
        self.staging.len()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a buffer
    ///
    /// Device-local buffers are created viewable as unordered access.
    pub fn allocate_buffer(
        &mut self,
        size: u64,
        heap: HeapKind,
        initial_state: ResourceStates,
    ) -> Result<Buffer> {
        let flags = match heap {
            HeapKind::Default => ResourceFlags::ALLOW_UNORDERED_ACCESS,
            HeapKind::Upload | HeapKind::Readback => ResourceFlags::empty(),
        };
        self.allocate_buffer_with_flags(size, heap, initial_state, flags)
    }

    /// Allocate a buffer with explicit resource flags
    pub fn allocate_buffer_with_flags(
        &mut self,
        size: u64,
        heap: HeapKind,
        initial_state: ResourceStates,
        flags: ResourceFlags,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let desc = ResourceDesc::buffer(size).with_flags(flags);
        let id = self
            .device
            .create_committed_resource(heap, &desc, initial_state)?;
        let buffer = Buffer { id, size, heap };
        self.buffers.insert(
            id,
            Tracked {
                buffer,
                state: initial_state,
            },
        );
        self.stats.allocations += 1;
        Ok(buffer)
    }

    /// Allocate a device-local scratch buffer in `UNORDERED_ACCESS`
    ///
    /// Returns `None` for a zero-size request.
    pub fn allocate_scratch(&mut self, size: u64) -> Result<Option<Buffer>> {
        if size == 0 {
            return Ok(None);
        }
        self.allocate_buffer(size, HeapKind::Default, ResourceStates::UNORDERED_ACCESS)
            .map(Some)
    }

    /// Destroy a buffer owned by the pool
    pub fn release(&mut self, buffer: Buffer) -> Result<()> {
        self.buffers.remove(&buffer.id).ok_or(Error::NotFound)?;
        self.stats.releases += 1;
        self.device.destroy_resource(buffer.id)
    }

    /// Destroy staging buffers of completed uploads
    ///
    /// Run only after the submission that consumed them has retired.
    pub fn release_staging(&mut self) -> Result<()> {
        for buffer in core::mem::take(&mut self.staging) {
            self.release(buffer)?;
        }
        Ok(())
    }

    // =========================================================================
    // State tracking
    // =========================================================================

    /// Tracked state of a buffer
    pub fn state(&self, buffer: Buffer) -> Result<ResourceStates> {
        self.buffers
            .get(&buffer.id)
            .map(|tracked| tracked.state)
            .ok_or(Error::NotFound)
    }

    /// Record a transition from the tracked state; no-op when already there
    pub fn transition(
        &mut self,
        channel: &mut CommandChannel<'_>,
        buffer: Buffer,
        state: ResourceStates,
    ) -> Result<()> {
        let tracked = self.buffers.get_mut(&buffer.id).ok_or(Error::NotFound)?;
        if tracked.state == state {
            return Ok(());
        }
        if buffer.heap != HeapKind::Default {
            log::warn!("{:?} buffer cannot leave {:?}", buffer.heap, tracked.state);
            return Err(Error::InvalidParameter);
        }
        let before = tracked.state;
        tracked.state = state;
        channel.record(|list| {
            list.resource_barrier(&[ResourceBarrier::transition(buffer.id, before, state)]);
        });
        Ok(())
    }

    /// Record a UAV barrier on a buffer
    pub fn uav_barrier(&self, channel: &mut CommandChannel<'_>, buffer: Buffer) {
        channel.record(|list| list.resource_barrier(&[ResourceBarrier::uav(buffer.id)]));
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Stage `data` and record its copy into `target`
    ///
    /// Leaves `target` in `UNORDERED_ACCESS`. The staging buffer lives until
    /// [`release_staging`](Self::release_staging).
    pub fn upload(
        &mut self,
        channel: &mut CommandChannel<'_>,
        target: Buffer,
        data: &[u8],
    ) -> Result<()> {
        let len = data.len() as u64;
        if len == 0 {
            return Err(Error::InvalidSize);
        }
        if len > target.size {
            return Err(Error::BufferOverflow);
        }

        let staging = self.allocate_buffer(len, HeapKind::Upload, ResourceStates::GENERIC_READ)?;
        self.staging.push(staging);
        {
            let mut mapping = self.device.map(staging.id, Some(0..0))?;
            mapping.write(0, data)?;
            mapping.unmap(0..len);
        }

        self.transition(channel, target, ResourceStates::COPY_DEST)?;
        channel.record(|list| list.copy_buffer_region(target.id, 0, staging.id, 0, len));
        self.transition(channel, target, ResourceStates::UNORDERED_ACCESS)?;

        self.stats.bytes_uploaded += len;
        log::debug!("upload {} bytes into {:?}", len, target.id);
        Ok(())
    }

    /// Stage `f32` elements into `target`
    pub fn upload_f32(
        &mut self,
        channel: &mut CommandChannel<'_>,
        target: Buffer,
        data: &[f32],
    ) -> Result<()> {
        self.upload(channel, target, bytemuck::cast_slice(data))
    }

    /// Copy the first `size` bytes of `buffer` back to the host
    ///
    /// Submits and waits. The buffer is returned to the state it was in.
    pub fn readback(
        &mut self,
        channel: &mut CommandChannel<'_>,
        buffer: Buffer,
        size: u64,
    ) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        if size > buffer.size {
            return Err(Error::BufferOverflow);
        }

        let prior = self.state(buffer)?;
        let readback = self.allocate_buffer(size, HeapKind::Readback, ResourceStates::COPY_DEST)?;
        let result = self.readback_through(channel, buffer, readback, size, prior);
        self.release(readback)?;
        let bytes = result?;

        self.stats.bytes_read_back += size;
        Ok(bytes)
    }

    /// Copy `count` `f32` elements of `buffer` back to the host
    pub fn readback_f32(
        &mut self,
        channel: &mut CommandChannel<'_>,
        buffer: Buffer,
        count: usize,
    ) -> Result<Vec<f32>> {
        let bytes = self.readback(channel, buffer, (count * 4) as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn readback_through(
        &mut self,
        channel: &mut CommandChannel<'_>,
        buffer: Buffer,
        readback: Buffer,
        size: u64,
        prior: ResourceStates,
    ) -> Result<Vec<u8>> {
        let pinned = buffer.heap != HeapKind::Default;
        if !pinned {
            self.transition(channel, buffer, ResourceStates::COPY_SOURCE)?;
        }
        channel.record(|list| list.copy_buffer_region(readback.id, 0, buffer.id, 0, size));
        if !pinned {
            self.transition(channel, buffer, prior)?;
        }
        channel.submit_and_wait()?;

        let mapping = self.device.map(readback.id, Some(0..size))?;
        let bytes = mapping.read_bytes(0..size)?;
        mapping.unmap(0..0);
        Ok(bytes)
    }

    // =========================================================================
    // Descriptors
    // =========================================================================

    /// Handles of one heap slot
    pub fn descriptor(&self, index: u32) -> Result<Descriptor> {
        if index >= self.config.descriptor_capacity {
            return Err(Error::DescriptorOutOfRange);
        }
        let increment = self.device.descriptor_handle_increment_size();
        Ok(Descriptor {
            index,
            cpu: self.heap_cpu.offset(index, increment),
            gpu: self.heap_gpu.offset(index, increment),
        })
    }

    /// Write a view of `buffer` into slot `heap_index`, replacing its content
    pub fn create_view(
        &self,
        buffer: Buffer,
        element_count: u32,
        format: Format,
        heap_index: u32,
    ) -> Result<Descriptor> {
        let descriptor = self.descriptor(heap_index)?;
        let desc = UnorderedAccessViewDesc::buffer(format, element_count);
        self.device
            .create_unordered_access_view(Some(buffer.id), &desc, descriptor.cpu)?;
        Ok(descriptor)
    }

    /// Write a null view into slot `heap_index`
    pub fn clear_view(&self, heap_index: u32) -> Result<Descriptor> {
        let descriptor = self.descriptor(heap_index)?;
        let desc = UnorderedAccessViewDesc::buffer(Format::R32Typeless, 0);
        self.device
            .create_unordered_access_view(None, &desc, descriptor.cpu)?;
        Ok(descriptor)
    }

    /// Descriptor slots `[base, base + count)` for a binding table
    pub fn table_range(&self, base: u32, count: u32) -> Result<TableRange> {
        let end = base.checked_add(count).ok_or(Error::DescriptorOutOfRange)?;
        if end > self.config.descriptor_capacity {
            log::warn!(
                "table range {}..{} exceeds {} slots",
                base,
                end,
                self.config.descriptor_capacity
            );
            return Err(Error::DescriptorOutOfRange);
        }
        let increment = self.device.descriptor_handle_increment_size();
        Ok(TableRange {
            heap: self.heap,
            base,
            count,
            cpu: self.heap_cpu.offset(base, increment),
            gpu: self.heap_gpu.offset(base, increment),
            increment,
        })
    }
}

impl Drop for ResourcePool<'_> {
    fn drop(&mut self) {
        self.staging.clear();
        for (id, _) in self.buffers.drain() {
            if let Err(e) = self.device.destroy_resource(id) {
                log::error!("{}: failed to destroy {:?}: {}", self.config.name, id, e);
            }
        }
        if let Err(e) = self.device.destroy_descriptor_heap(self.heap) {
            log::error!("{}: failed to destroy descriptor heap: {}", self.config.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_hal::{select_device, AdapterPolicy, ReferencePlatform};

    fn device() -> Device {
        select_device(&ReferencePlatform::new(), &AdapterPolicy::GraphicsHardware)
            .expect("device")
    }

    #[test]
    fn test_allocation_errors() {
        let device = device();
        let mut pool = ResourcePool::new(&device).expect("pool");
        assert_eq!(
            pool.allocate_buffer(0, HeapKind::Default, ResourceStates::COMMON),
            Err(Error::InvalidSize)
        );
        assert_eq!(
            pool.allocate_buffer(16, HeapKind::Readback, ResourceStates::UNORDERED_ACCESS),
            Err(Error::InvalidParameter)
        );
        assert_eq!(pool.allocate_scratch(0), Ok(None));
        let scratch = pool.allocate_scratch(64).expect("scratch").expect("some");
        assert_eq!(pool.state(scratch), Ok(ResourceStates::UNORDERED_ACCESS));
    }

    #[test]
    fn test_upload_readback_round_trip() {
        let device = device();
        let mut channel = CommandChannel::new(&device).expect("channel");
        let mut pool = ResourcePool::new(&device).expect("pool");

        let buffer = pool
            .allocate_buffer(16, HeapKind::Default, ResourceStates::COMMON)
            .expect("buffer");
        pool.upload_f32(&mut channel, buffer, &[1.0, 2.0, 3.0, 4.0])
            .expect("upload");
        assert_eq!(pool.state(buffer), Ok(ResourceStates::UNORDERED_ACCESS));
        channel.submit_and_wait().expect("submit");
        pool.release_staging().expect("release staging");
        assert_eq!(pool.pending_staging(), 0);

        let values = pool.readback_f32(&mut channel, buffer, 4).expect("readback");
        assert_eq!(values, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(pool.state(buffer), Ok(ResourceStates::UNORDERED_ACCESS));
        assert_eq!(pool.live_buffers(), 1);
    }

    #[test]
    fn test_upload_larger_than_target() {
        let device = device();
        let mut channel = CommandChannel::new(&device).expect("channel");
        let mut pool = ResourcePool::new(&device).expect("pool");
        let buffer = pool
            .allocate_buffer(4, HeapKind::Default, ResourceStates::COPY_DEST)
            .expect("buffer");
        assert_eq!(
            pool.upload(&mut channel, buffer, &[0; 8]),
            Err(Error::BufferOverflow)
        );
    }

    #[test]
    fn test_transition_noop_and_pinned() {
        let device = device();
        let mut channel = CommandChannel::new(&device).expect("channel");
        let mut pool = ResourcePool::new(&device).expect("pool");
        let local = pool
            .allocate_buffer(4, HeapKind::Default, ResourceStates::UNORDERED_ACCESS)
            .expect("local");
        pool.transition(&mut channel, local, ResourceStates::UNORDERED_ACCESS)
            .expect("no-op");
        assert!(channel.list_mut().is_empty());

        let upload = pool
            .allocate_buffer(4, HeapKind::Upload, ResourceStates::GENERIC_READ)
            .expect("upload");
        assert_eq!(
            pool.transition(&mut channel, upload, ResourceStates::COPY_DEST),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_views_and_ranges() {
        let device = device();
        let mut pool = ResourcePool::new(&device).expect("pool");
        let buffer = pool
            .allocate_buffer(32, HeapKind::Default, ResourceStates::UNORDERED_ACCESS)
            .expect("buffer");

        let first = pool
            .create_view(buffer, 8, Format::R32Float, 3)
            .expect("view");
        let again = pool
            .create_view(buffer, 4, Format::R32Float, 3)
            .expect("overwrite");
        assert_eq!(first, again);
        assert_eq!(
            pool.create_view(buffer, 8, Format::R32Float, 8),
            Err(Error::DescriptorOutOfRange)
        );

        let range = pool.table_range(2, 6).expect("range");
        assert_eq!(range.cpu_at(1), pool.descriptor(3).expect("slot").cpu);
        assert_eq!(pool.table_range(4, 5), Err(Error::DescriptorOutOfRange));
    }

    #[test]
    fn test_release_and_drop() {
        let device = device();
        {
            let mut pool = ResourcePool::new(&device).expect("pool");
            let a = pool
                .allocate_buffer(64, HeapKind::Default, ResourceStates::COMMON)
                .expect("a");
            pool.allocate_buffer(64, HeapKind::Default, ResourceStates::COMMON)
                .expect("b");
            pool.release(a).expect("release");
            assert_eq!(pool.release(a), Err(Error::NotFound));
            assert_eq!(device.heap_usage(HeapKind::Default).as_bytes(), 64);
        }
        assert!(device.heap_usage(HeapKind::Default).is_zero());
    }
}
