//! # Logical Device
//!
//! A device bound to one adapter and feature level. It owns the resource
//! arena that backs every buffer and descriptor heap, the kernel registry,
//! and the removed flag its queues set when a submission fails.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use forge_core::{ByteSize, DescriptorHeapId, Error, Fence, ResourceId, Result};

use crate::adapter::{AdapterAttributes, AdapterInfo};
use crate::command::{CommandAllocator, CommandList, CommandListType};
use crate::descriptor::{
    CpuDescriptorHandle, DescriptorHeapDesc, GpuDescriptorHandle, UavView,
    UnorderedAccessViewDesc,
};
use crate::kernel::DeviceKernel;
use crate::pipeline::{ComputePipelineState, RootSignature, RootSignatureDesc};
use crate::queue::CommandQueue;
use crate::resource::{
    HeapKind, Mapping, ResourceArena, ResourceDesc, ResourceFlags, ResourceStates,
};
use crate::shader::{KernelRegistry, ShaderBytecode};

// =============================================================================
// FEATURE LEVEL
// =============================================================================

/// Capability level a device is created at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    /// Compute-only core
    Core1_0,
    /// Full 11_0 feature set (requires graphics)
    Level11_0,
}

impl FeatureLevel {
    /// Adapter attributes the level requires
    pub const fn required_attributes(self) -> AdapterAttributes {
        match self {
            FeatureLevel::Core1_0 => AdapterAttributes::CORE_COMPUTE,
            FeatureLevel::Level11_0 => AdapterAttributes::GRAPHICS,
        }
    }
}

// =============================================================================
// DEVICE CONFIGURATION
// =============================================================================

/// Per-heap memory budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBudgets {
    /// Upload heap budget
    pub upload: ByteSize,
    /// Device-local heap budget
    pub default: ByteSize,
    /// Readback heap budget
    pub readback: ByteSize,
}

impl HeapBudgets {
    /// Budget of one heap kind
    pub const fn get(&self, heap: HeapKind) -> ByteSize {
        match heap {
            HeapKind::Upload => self.upload,
            HeapKind::Default => self.default,
            HeapKind::Readback => self.readback,
        }
    }
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Size in bytes of one view descriptor
    pub descriptor_increment: u32,
    /// Largest single buffer
    pub max_buffer_size: ByteSize,
    /// Memory budget per heap kind
    pub heap_budgets: HeapBudgets,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            descriptor_increment: 32,
            max_buffer_size: ByteSize::from_mib(256),
            heap_budgets: HeapBudgets {
                upload: ByteSize::from_mib(512),
                default: ByteSize::from_mib(512),
                readback: ByteSize::from_mib(512),
            },
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// State shared between a device and its queue timelines
#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) info: AdapterInfo,
    pub(crate) feature_level: FeatureLevel,
    pub(crate) config: DeviceConfig,
    pub(crate) arena: spin::Mutex<ResourceArena>,
    pub(crate) removed: spin::Mutex<Option<Error>>,
    pub(crate) kernels: spin::RwLock<KernelRegistry>,
}

impl DeviceShared {
    /// Record the first removal reason
    pub(crate) fn mark_removed(&self, reason: Error) {
        let mut removed = self.removed.lock();
        if removed.is_none() {
            log::error!("device {} removed: {}", self.info.description, reason);
            *removed = Some(reason);
        }
    }

    pub(crate) fn removed_reason(&self) -> Option<Error> {
        *self.removed.lock()
    }
}

/// Logical device
#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn create(
        info: AdapterInfo,
        feature_level: FeatureLevel,
        config: DeviceConfig,
    ) -> Result<Self> {
        if !info.supports(feature_level.required_attributes()) {
            log::warn!(
                "{} does not support feature level {:?}",
                info.description,
                feature_level
            );
            return Err(Error::DeviceCreationFailed);
        }
        if config.descriptor_increment == 0 {
            return Err(Error::DeviceCreationFailed);
        }
        log::debug!(
            "create device on {} ({:?}) at {:?}",
            info.description,
            info.luid,
            feature_level
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                info,
                feature_level,
                config,
                arena: spin::Mutex::new(ResourceArena::default()),
                removed: spin::Mutex::new(None),
                kernels: spin::RwLock::new(KernelRegistry::with_builtins()),
            }),
        })
    }

    /// Adapter the device was created on
    pub fn adapter(&self) -> &AdapterInfo {
        &self.shared.info
    }

    /// Feature level the device was created at
    pub fn feature_level(&self) -> FeatureLevel {
        self.shared.feature_level
    }

    /// Device configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Reason the device was removed, if it was
    pub fn removed_reason(&self) -> Option<Error> {
        self.shared.removed_reason()
    }

    /// Fail with the removal reason if the device was removed
    pub fn check_removed(&self) -> Result<()> {
        match self.shared.removed_reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Create a committed buffer in its own heap
    pub fn create_committed_resource(
        &self,
        heap: HeapKind,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<ResourceId> {
        if desc.size == 0 || desc.size > self.shared.config.max_buffer_size.as_bytes() {
            log::warn!("rejected buffer of {} bytes", desc.size);
            return Err(Error::InvalidSize);
        }
        let state_ok = match heap.required_state() {
            Some(required) => initial_state == required,
            None => initial_state != ResourceStates::GENERIC_READ,
        };
        if !state_ok {
            log::warn!("{:?} heap cannot start in {:?}", heap, initial_state);
            return Err(Error::InvalidParameter);
        }
        if desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) && heap != HeapKind::Default
        {
            return Err(Error::InvalidParameter);
        }

        let budget = self.shared.config.heap_budgets.get(heap).as_bytes();
        let id = self
            .shared
            .arena
            .lock()
            .create_resource(heap, desc, initial_state, budget)?;
        log::debug!(
            "create {:?} buffer {:?}: {} bytes, {:?}",
            heap,
            id,
            desc.size,
            initial_state
        );
        Ok(id)
    }

    /// Destroy a committed buffer
    pub fn destroy_resource(&self, id: ResourceId) -> Result<()> {
        self.shared.arena.lock().destroy_resource(id)?;
        log::debug!("destroy buffer {:?}", id);
        Ok(())
    }

    /// Description of a live buffer
    pub fn resource_desc(&self, id: ResourceId) -> Result<ResourceDesc> {
        Ok(self.shared.arena.lock().resource(id)?.desc)
    }

    /// Heap kind of a live buffer
    pub fn resource_heap(&self, id: ResourceId) -> Result<HeapKind> {
        Ok(self.shared.arena.lock().resource(id)?.heap)
    }

    /// Bytes committed in one heap
    pub fn heap_usage(&self, heap: HeapKind) -> ByteSize {
        ByteSize::from_bytes(self.shared.arena.lock().usage(heap))
    }

    /// Map an upload or readback buffer
    ///
    /// `read_range` is the range the CPU intends to read; `None` means the
    /// whole buffer.
    pub fn map(&self, id: ResourceId, read_range: Option<Range<u64>>) -> Result<Mapping<'_>> {
        let mut arena = self.shared.arena.lock();
        let slot = arena.resource_mut(id)?;
        if !slot.heap.is_cpu_visible() {
            log::warn!("map of device-local buffer {:?}", id);
            return Err(Error::MappingFailed);
        }
        if let Some(range) = read_range {
            if range.start > range.end || range.end > slot.desc.size {
                return Err(Error::BufferOverflow);
            }
        }
        slot.map_count += 1;
        Ok(Mapping::new(&self.shared, id, slot.heap, slot.desc.size))
    }

    // =========================================================================
    // Descriptors
    // =========================================================================

    /// Create a descriptor heap
    pub fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapId> {
        if desc.capacity == 0 {
            return Err(Error::InvalidParameter);
        }
        let id = self.shared.arena.lock().create_heap(desc);
        log::debug!("create descriptor heap {:?}: {} slots", id, desc.capacity);
        Ok(id)
    }

    /// Destroy a descriptor heap
    pub fn destroy_descriptor_heap(&self, id: DescriptorHeapId) -> Result<()> {
        self.shared.arena.lock().destroy_heap(id)?;
        log::debug!("destroy descriptor heap {:?}", id);
        Ok(())
    }

    /// Size in bytes of one view descriptor
    pub fn descriptor_handle_increment_size(&self) -> u32 {
        self.shared.config.descriptor_increment
    }

    /// CPU handle of slot 0
    pub fn cpu_descriptor_handle_for_heap_start(
        &self,
        id: DescriptorHeapId,
    ) -> Result<CpuDescriptorHandle> {
        self.shared.arena.lock().heap(id)?;
        Ok(CpuDescriptorHandle::heap_start(id))
    }

    /// GPU handle of slot 0; the heap must be shader-visible
    pub fn gpu_descriptor_handle_for_heap_start(
        &self,
        id: DescriptorHeapId,
    ) -> Result<GpuDescriptorHandle> {
        if !self.shared.arena.lock().heap(id)?.desc.shader_visible {
            return Err(Error::InvalidParameter);
        }
        Ok(GpuDescriptorHandle::heap_start(id))
    }

    /// Write an unordered-access view into a descriptor slot
    ///
    /// `None` writes a null descriptor.
    pub fn create_unordered_access_view(
        &self,
        resource: Option<ResourceId>,
        desc: &UnorderedAccessViewDesc,
        dest: CpuDescriptorHandle,
    ) -> Result<()> {
        let (heap_id, index) = dest.decode(self.shared.config.descriptor_increment)?;
        let mut arena = self.shared.arena.lock();

        let view = match resource {
            Some(id) => {
                let slot = arena.resource(id)?;
                if !slot.desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
                    log::warn!("view of {:?} without ALLOW_UNORDERED_ACCESS", id);
                    return Err(Error::InvalidParameter);
                }
                if desc.byte_range().end > forge_core::align_up(slot.desc.size, 4) {
                    return Err(Error::BufferOverflow);
                }
                Some(UavView { resource: id, desc: *desc })
            }
            None => None,
        };

        arena.heap_mut(heap_id)?.write(index, view)?;
        log::trace!("uav {:?} -> heap {:?}[{}]", resource, heap_id, index);
        Ok(())
    }

    // =========================================================================
    // Command objects
    // =========================================================================

    /// Create a command queue with its own timeline
    pub fn create_command_queue(&self, ty: CommandListType) -> Result<CommandQueue> {
        CommandQueue::new(self.shared.clone(), ty)
    }

    /// Create a command allocator
    pub fn create_command_allocator(&self, ty: CommandListType) -> Result<CommandAllocator> {
        Ok(CommandAllocator::new(ty))
    }

    /// Create a command list, open for recording
    pub fn create_command_list(&self, allocator: &mut CommandAllocator) -> Result<CommandList> {
        Ok(CommandList::new(allocator))
    }

    /// Create a fence
    pub fn create_fence(&self, initial_value: u64) -> Result<Fence> {
        Ok(Fence::new(initial_value))
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Create a root signature
    pub fn create_root_signature(&self, desc: RootSignatureDesc) -> Result<RootSignature> {
        desc.validate()?;
        Ok(RootSignature::new(desc))
    }

    /// Create a compute pipeline state from shader bytecode
    pub fn create_compute_pipeline_state(
        &self,
        root_signature: &RootSignature,
        bytecode: &ShaderBytecode,
    ) -> Result<ComputePipelineState> {
        let kernel = self.shared.kernels.read().resolve(bytecode)?;
        log::debug!("create compute pipeline '{}'", kernel.name());
        Ok(ComputePipelineState::new(root_signature.clone(), kernel))
    }

    /// Load bytecode from `<dir>/<name>.cso` and create a pipeline state
    pub fn load_compute_pipeline_state(
        &self,
        root_signature: &RootSignature,
        dir: &Path,
        name: &str,
    ) -> Result<ComputePipelineState> {
        let bytecode = ShaderBytecode::load(dir, name)?;
        self.create_compute_pipeline_state(root_signature, &bytecode)
    }

    /// Register a kernel pipelines can resolve by name
    pub fn register_kernel(&self, kernel: Arc<dyn DeviceKernel>) {
        self.shared.kernels.write().register(kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Platform, ReferencePlatform};

    fn device() -> Device {
        let platform = ReferencePlatform::new();
        let adapters = platform
            .enumerate_adapters(AdapterAttributes::CORE_COMPUTE)
            .expect("enumerate");
        adapters[2]
            .create_device(FeatureLevel::Level11_0)
            .expect("device")
    }

    #[test]
    fn test_feature_level_requires_graphics() {
        let platform = ReferencePlatform::new();
        let adapters = platform
            .enumerate_adapters(AdapterAttributes::CORE_COMPUTE)
            .expect("enumerate");
        let vpu = &adapters[1];
        assert!(vpu.create_device(FeatureLevel::Core1_0).is_ok());
        assert_eq!(
            vpu.create_device(FeatureLevel::Level11_0).map(|_| ()),
            Err(Error::DeviceCreationFailed)
        );
    }

    #[test]
    fn test_initial_state_rules() {
        let device = device();
        let desc = ResourceDesc::buffer(16);
        assert_eq!(
            device.create_committed_resource(HeapKind::Upload, &desc, ResourceStates::COPY_DEST),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            device.create_committed_resource(
                HeapKind::Default,
                &desc,
                ResourceStates::GENERIC_READ
            ),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            device.create_committed_resource(
                HeapKind::Default,
                &ResourceDesc::buffer(0),
                ResourceStates::COMMON
            ),
            Err(Error::InvalidSize)
        );
        assert!(device
            .create_committed_resource(HeapKind::Readback, &desc, ResourceStates::COPY_DEST)
            .is_ok());
    }

    #[test]
    fn test_map_rules() {
        let device = device();
        let local = device
            .create_committed_resource(
                HeapKind::Default,
                &ResourceDesc::buffer(8),
                ResourceStates::COMMON,
            )
            .expect("local");
        assert_eq!(device.map(local, None).map(|_| ()), Err(Error::MappingFailed));

        let upload = device
            .create_committed_resource(
                HeapKind::Upload,
                &ResourceDesc::buffer(8),
                ResourceStates::GENERIC_READ,
            )
            .expect("upload");
        let mut mapping = device.map(upload, Some(0..0)).expect("map");
        mapping.write(0, &[9; 8]).expect("write");
        assert_eq!(mapping.write(4, &[0; 8]), Err(Error::BufferOverflow));
        assert_eq!(mapping.read_bytes(2..4), Ok(vec![9, 9]));
        mapping.unmap(0..8);
    }

    #[test]
    fn test_readback_mapping_is_read_only() {
        let device = device();
        let readback = device
            .create_committed_resource(
                HeapKind::Readback,
                &ResourceDesc::buffer(4),
                ResourceStates::COPY_DEST,
            )
            .expect("readback");
        let mut mapping = device.map(readback, None).expect("map");
        assert_eq!(mapping.write(0, &[1]), Err(Error::MappingFailed));
    }

    #[test]
    fn test_uav_requires_flag_and_range() {
        let device = device();
        let heap = device
            .create_descriptor_heap(&DescriptorHeapDesc::shader_visible(2))
            .expect("heap");
        let start = device
            .cpu_descriptor_handle_for_heap_start(heap)
            .expect("start");
        let increment = device.descriptor_handle_increment_size();
        let view = UnorderedAccessViewDesc::buffer(crate::Format::R32Float, 4);

        let plain = device
            .create_committed_resource(
                HeapKind::Default,
                &ResourceDesc::buffer(16),
                ResourceStates::COMMON,
            )
            .expect("plain");
        assert_eq!(
            device.create_unordered_access_view(Some(plain), &view, start),
            Err(Error::InvalidParameter)
        );

        let uav = device
            .create_committed_resource(
                HeapKind::Default,
                &ResourceDesc::buffer(16).with_flags(ResourceFlags::ALLOW_UNORDERED_ACCESS),
                ResourceStates::UNORDERED_ACCESS,
            )
            .expect("uav");
        device
            .create_unordered_access_view(Some(uav), &view, start.offset(1, increment))
            .expect("slot 1");
        assert_eq!(
            device.create_unordered_access_view(Some(uav), &view, start.offset(2, increment)),
            Err(Error::DescriptorOutOfRange)
        );
        let too_long = UnorderedAccessViewDesc::buffer(crate::Format::R32Float, 5);
        assert_eq!(
            device.create_unordered_access_view(Some(uav), &too_long, start),
            Err(Error::BufferOverflow)
        );
    }

    #[test]
    fn test_budget_exhaustion() {
        let platform = ReferencePlatform::new().with_config(DeviceConfig {
            heap_budgets: HeapBudgets {
                upload: ByteSize::from_bytes(16),
                default: ByteSize::from_bytes(16),
                readback: ByteSize::from_bytes(16),
            },
            ..DeviceConfig::default()
        });
        let adapters = platform
            .enumerate_adapters(AdapterAttributes::CORE_COMPUTE)
            .expect("enumerate");
        let device = adapters[0]
            .create_device(FeatureLevel::Core1_0)
            .expect("device");
        let desc = ResourceDesc::buffer(12);
        device
            .create_committed_resource(HeapKind::Upload, &desc, ResourceStates::GENERIC_READ)
            .expect("fits");
        assert_eq!(
            device.create_committed_resource(HeapKind::Upload, &desc, ResourceStates::GENERIC_READ),
            Err(Error::OutOfMemory)
        );
        assert_eq!(device.heap_usage(HeapKind::Upload), ByteSize::from_bytes(12));
    }
}
