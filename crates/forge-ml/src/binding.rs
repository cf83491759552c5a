//! # Binding Tables
//!
//! A binding table ties a dispatch target to a contiguous range of descriptor
//! slots and writes one unordered-access view per bound buffer. Slots are
//! laid out as inputs, outputs, then the temporary and persistent resources
//! when the target needs them.

use core::fmt;
use std::sync::Arc;

use forge_core::{Error, Result};
use forge_hal::{Device, DeviceKernel, Format, HeapKind, KernelInvocation, UnorderedAccessViewDesc};
use forge_mem::{Buffer, TableRange};

use crate::compile::CompiledOperator;
use crate::initializer::OperatorInitializer;

// =============================================================================
// SLOT LAYOUT
// =============================================================================

/// What a descriptor slot accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotRule {
    /// A buffer range of at least this many bytes
    Required(u64),
    /// Nothing may be bound
    Empty,
}

impl SlotRule {
    fn check(&self, binding: Option<&BufferBinding>) -> Result<()> {
        match (self, binding) {
            (_, None) => Ok(()),
            (SlotRule::Empty, Some(_)) => {
                log::warn!("buffer bound to a slot that takes none");
                Err(Error::InvalidBinding)
            }
            (SlotRule::Required(min), Some(binding)) => {
                if binding.size < *min {
                    log::warn!("binding of {} bytes, slot needs {}", binding.size, min);
                    return Err(Error::InvalidBinding);
                }
                Ok(())
            }
        }
    }
}

/// Slot layout of a dispatch target
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BindingLayout {
    /// One group per input binding; initializer groups span an operator's inputs
    pub(crate) input_groups: Vec<Vec<SlotRule>>,
    /// Inputs are bound as buffer arrays
    pub(crate) array_inputs: bool,
    pub(crate) outputs: Vec<SlotRule>,
    pub(crate) temporary: u64,
    pub(crate) persistent: u64,
}

impl BindingLayout {
    /// Layout with one slot per input
    pub(crate) fn operator(
        inputs: Vec<SlotRule>,
        outputs: Vec<SlotRule>,
        temporary: u64,
        persistent: u64,
    ) -> Self {
        Self {
            input_groups: inputs.into_iter().map(|rule| vec![rule]).collect(),
            array_inputs: false,
            outputs,
            temporary,
            persistent,
        }
    }

    /// Layout whose inputs are arrays, one per operator
    pub(crate) fn initializer(input_groups: Vec<Vec<SlotRule>>, outputs: Vec<SlotRule>) -> Self {
        Self {
            input_groups,
            array_inputs: true,
            outputs,
            temporary: 0,
            persistent: 0,
        }
    }

    /// Input slots over all groups
    pub(crate) fn input_slots(&self) -> u32 {
        self.input_groups.iter().map(|g| g.len() as u32).sum()
    }

    /// First slot of input group `group`
    pub(crate) fn group_base(&self, group: usize) -> u32 {
        self.input_groups[..group]
            .iter()
            .map(|g| g.len() as u32)
            .sum()
    }

    fn output_base(&self) -> u32 {
        self.input_slots()
    }

    /// Slot of the temporary resource
    pub(crate) fn temporary_slot(&self) -> Option<u32> {
        (self.temporary > 0).then(|| self.output_base() + self.outputs.len() as u32)
    }

    /// Slot of the persistent resource
    pub(crate) fn persistent_slot(&self) -> Option<u32> {
        let next = self.output_base() + self.outputs.len() as u32 + (self.temporary > 0) as u32;
        (self.persistent > 0).then_some(next)
    }

    /// Descriptors the layout occupies
    pub(crate) fn descriptor_count(&self) -> u32 {
        self.input_slots()
            + self.outputs.len() as u32
            + (self.temporary > 0) as u32
            + (self.persistent > 0) as u32
    }

    /// Rule of every slot, in table order
    fn rules(&self) -> Vec<SlotRule> {
        let mut rules: Vec<SlotRule> = self.input_groups.iter().flatten().copied().collect();
        rules.extend_from_slice(&self.outputs);
        if self.temporary > 0 {
            rules.push(SlotRule::Required(self.temporary));
        }
        if self.persistent > 0 {
            rules.push(SlotRule::Required(self.persistent));
        }
        rules
    }
}

// =============================================================================
// DISPATCH TARGET
// =============================================================================

/// Something a binding table can be bound to and recorded
#[derive(Debug, Clone, Copy)]
pub enum DispatchTarget<'a> {
    /// Initialization of one or more operators
    Initializer(&'a OperatorInitializer),
    /// Execution of a compiled operator
    Operator(&'a CompiledOperator),
}

impl DispatchTarget<'_> {
    pub(crate) fn id(&self) -> u64 {
        match self {
            DispatchTarget::Initializer(init) => init.id(),
            DispatchTarget::Operator(op) => op.id(),
        }
    }

    pub(crate) fn layout(&self) -> &BindingLayout {
        match self {
            DispatchTarget::Initializer(init) => init.layout(),
            DispatchTarget::Operator(op) => op.layout(),
        }
    }

    pub(crate) fn kernel(&self) -> Arc<dyn DeviceKernel> {
        match self {
            DispatchTarget::Initializer(init) => init.kernel().clone(),
            DispatchTarget::Operator(op) => op.kernel().clone(),
        }
    }
}

/// Target and descriptor range of a binding table
#[derive(Debug, Clone, Copy)]
pub struct BindingTableDesc<'a> {
    /// What the table binds
    pub target: DispatchTarget<'a>,
    /// Descriptor slots it writes
    pub range: TableRange,
}

// =============================================================================
// BINDINGS
// =============================================================================

/// Byte range of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    /// Buffer
    pub buffer: Buffer,
    /// Start offset in bytes
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

impl BufferBinding {
    /// Bind a byte range
    pub fn new(buffer: Buffer, offset: u64, size: u64) -> Self {
        Self {
            buffer,
            offset,
            size,
        }
    }

    /// Bind the whole buffer
    pub fn whole(buffer: Buffer) -> Self {
        Self::new(buffer, 0, buffer.size())
    }

    fn view_desc(&self) -> Result<UnorderedAccessViewDesc> {
        if self.offset % 4 != 0 || self.size % 4 != 0 {
            return Err(Error::MisalignedAccess);
        }
        let end = self.offset.checked_add(self.size).ok_or(Error::BufferOverflow)?;
        if end > self.buffer.size() {
            return Err(Error::BufferOverflow);
        }
        if self.buffer.heap() != HeapKind::Default {
            log::warn!("{:?} buffer cannot be viewed", self.buffer.heap());
            return Err(Error::InvalidBinding);
        }
        let num_elements = u32::try_from(self.size / 4).map_err(|_| Error::InvalidSize)?;
        Ok(UnorderedAccessViewDesc {
            format: Format::R32Typeless,
            first_element: self.offset / 4,
            num_elements,
        })
    }
}

impl From<Buffer> for BufferBinding {
    fn from(buffer: Buffer) -> Self {
        Self::whole(buffer)
    }
}

/// Value bound to one input or output
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Binding {
    /// Nothing bound
    #[default]
    None,
    /// A single buffer range
    Buffer(BufferBinding),
    /// One optional range per element of an array input
    BufferArray(Vec<Option<BufferBinding>>),
}

impl Binding {
    /// Bind the whole of `buffer`, or nothing
    pub fn from_buffer(buffer: Option<Buffer>) -> Self {
        buffer.map_or(Binding::None, |b| Binding::Buffer(BufferBinding::whole(b)))
    }
}

// =============================================================================
// BINDING TABLE
// =============================================================================

/// Descriptor-slot bindings for one dispatch target
pub struct BindingTable<'d> {
    device: &'d Device,
    range: TableRange,
    target: u64,
    kernel: Arc<dyn DeviceKernel>,
    layout: BindingLayout,
    rules: Vec<SlotRule>,
    slots: Vec<Option<BufferBinding>>,
}

impl<'d> BindingTable<'d> {
    /// Create a table over `desc.range` with every slot empty
    pub fn new(device: &'d Device, desc: &BindingTableDesc<'_>) -> Result<Self> {
        let layout = desc.target.layout().clone();
        let mut table = Self {
            device,
            range: desc.range,
            target: desc.target.id(),
            kernel: desc.target.kernel(),
            rules: layout.rules(),
            slots: Vec::new(),
            layout,
        };
        table.reset(desc)?;
        Ok(table)
    }

    /// Rebind the table to a new target and range, clearing every slot
    pub fn reset(&mut self, desc: &BindingTableDesc<'_>) -> Result<()> {
        let layout = desc.target.layout();
        let required = layout.descriptor_count();
        if desc.range.count < required {
            log::warn!(
                "binding table of {} slots, dispatch needs {}",
                desc.range.count,
                required
            );
            return Err(Error::BindingTableTooSmall);
        }

        let null = UnorderedAccessViewDesc::buffer(Format::R32Typeless, 0);
        for index in 0..desc.range.count {
            self.device
                .create_unordered_access_view(None, &null, desc.range.cpu_at(index))?;
        }

        self.range = desc.range;
        self.target = desc.target.id();
        self.kernel = desc.target.kernel();
        self.layout = layout.clone();
        self.rules = self.layout.rules();
        self.slots = vec![None; required as usize];
        Ok(())
    }

    /// Descriptor range the table writes
    pub fn range(&self) -> TableRange {
        self.range
    }

    /// Descriptors the bound target uses
    pub fn descriptor_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Check whether a table slot holds a binding
    pub fn is_bound(&self, slot: u32) -> bool {
        matches!(self.slots.get(slot as usize), Some(Some(_)))
    }

    pub(crate) fn target_id(&self) -> u64 {
        self.target
    }

    /// Bind every input, in slot order
    ///
    /// Operator inputs take [`Binding::Buffer`] or [`Binding::None`];
    /// initializer inputs take one [`Binding::BufferArray`] per operator.
    pub fn bind_inputs(&mut self, bindings: &[Binding]) -> Result<()> {
        if bindings.len() != self.layout.input_groups.len() {
            log::warn!(
                "{} input bindings for {} inputs",
                bindings.len(),
                self.layout.input_groups.len()
            );
            return Err(Error::InvalidBinding);
        }

        for (group, binding) in bindings.iter().enumerate() {
            let width = self.layout.input_groups[group].len();
            let values: Vec<Option<BufferBinding>> = match (binding, self.layout.array_inputs) {
                (Binding::None, _) => vec![None; width],
                (Binding::Buffer(b), false) => vec![Some(*b)],
                (Binding::BufferArray(array), true) if array.len() == width => array.clone(),
                _ => return Err(Error::InvalidBinding),
            };
            let base = self.layout.group_base(group);
            for (i, value) in values.into_iter().enumerate() {
                self.write_slot(base + i as u32, value)?;
            }
        }
        Ok(())
    }

    /// Bind every output, in slot order
    pub fn bind_outputs(&mut self, bindings: &[Binding]) -> Result<()> {
        if bindings.len() != self.layout.outputs.len() {
            log::warn!(
                "{} output bindings for {} outputs",
                bindings.len(),
                self.layout.outputs.len()
            );
            return Err(Error::InvalidBinding);
        }
        let base = self.layout.output_base();
        for (i, binding) in bindings.iter().enumerate() {
            let value = single(binding)?;
            self.write_slot(base + i as u32, value)?;
        }
        Ok(())
    }

    /// Bind the temporary resource
    ///
    /// Targets without one accept only [`Binding::None`].
    pub fn bind_temporary(&mut self, binding: &Binding) -> Result<()> {
        let value = single(binding)?;
        match self.layout.temporary_slot() {
            Some(slot) => self.write_slot(slot, value),
            None if value.is_none() => Ok(()),
            None => Err(Error::InvalidBinding),
        }
    }

    /// Bind the persistent resource
    ///
    /// Targets without one accept only [`Binding::None`].
    pub fn bind_persistent(&mut self, binding: &Binding) -> Result<()> {
        let value = single(binding)?;
        match self.layout.persistent_slot() {
            Some(slot) => self.write_slot(slot, value),
            None if value.is_none() => Ok(()),
            None => Err(Error::InvalidBinding),
        }
    }

    fn write_slot(&mut self, slot: u32, value: Option<BufferBinding>) -> Result<()> {
        let rule = self.rules[slot as usize];
        rule.check(value.as_ref())?;

        let dest = self.range.cpu_at(slot);
        match value {
            Some(binding) => {
                let desc = binding.view_desc()?;
                self.device
                    .create_unordered_access_view(Some(binding.buffer.id()), &desc, dest)?;
            }
            None => {
                let null = UnorderedAccessViewDesc::buffer(Format::R32Typeless, 0);
                self.device.create_unordered_access_view(None, &null, dest)?;
            }
        }
        self.slots[slot as usize] = value;
        Ok(())
    }

    /// Check that every required slot holds a binding
    pub fn validate_complete(&self) -> Result<()> {
        for (slot, (rule, value)) in self.rules.iter().zip(&self.slots).enumerate() {
            if matches!(rule, SlotRule::Required(_)) && value.is_none() {
                log::error!("binding table slot {} is required but unbound", slot);
                return Err(Error::MissingBinding);
            }
        }
        Ok(())
    }

    /// Resolve the dispatch this table describes
    pub(crate) fn invocation(&self) -> Result<KernelInvocation> {
        self.validate_complete()?;
        Ok(KernelInvocation::new(self.kernel.clone())
            .with_table(self.range.gpu, self.descriptor_count()))
    }
}

fn single(binding: &Binding) -> Result<Option<BufferBinding>> {
    match binding {
        Binding::None => Ok(None),
        Binding::Buffer(b) => Ok(Some(*b)),
        Binding::BufferArray(_) => Err(Error::InvalidBinding),
    }
}

impl fmt::Debug for BindingTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingTable")
            .field("range", &self.range)
            .field("target", &self.target)
            .field("kernel", &self.kernel.name())
            .field("slots", &self.slots)
            .finish()
    }
}
