//! # Operator Pipeline
//!
//! Drives one operator through `Described → Compiled → Initialized →
//! Executed`. The pipeline owns the compiled operator, its binding table and
//! its temporary and persistent resources; buffers come from a
//! [`ResourcePool`] and commands go through a [`CommandChannel`].
//!
//! One binding table serves both phases. It spans
//! `max(initializer descriptors, operator descriptors)` slots and is reset
//! from the initializer to the operator between them.

use forge_cmd::CommandChannel;
use forge_core::{Error, Result};
use forge_hal::{Device, ResourceBarrier};
use forge_mem::{Buffer, ResourcePool};

use crate::binding::{Binding, BindingTable, BindingTableDesc, DispatchTarget};
use crate::compile::{CompiledOperator, ExecutionFlags};
use crate::initializer::OperatorInitializer;
use crate::operator::OperatorDesc;
use crate::recorder::CommandRecorder;

/// Lifecycle state of an operator pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Description only
    Described,
    /// Compiled, persistent resource not yet initialized
    Compiled,
    /// Initialized, ready to execute
    Initialized,
    /// Executed at least once; may execute again
    Executed,
}

impl PipelineState {
    /// Check whether execute dispatches are allowed
    pub const fn is_initialized(self) -> bool {
        matches!(self, PipelineState::Initialized | PipelineState::Executed)
    }
}

// =============================================================================
// OPERATOR PIPELINE
// =============================================================================

/// One operator and its dispatch resources
#[derive(Debug)]
pub struct OperatorPipeline<'d> {
    device: &'d Device,
    desc: OperatorDesc,
    flags: ExecutionFlags,
    descriptor_base: u32,
    state: PipelineState,
    operator: Option<CompiledOperator>,
    table: Option<BindingTable<'d>>,
    temporary: Option<Buffer>,
    persistent: Option<Buffer>,
    recorder: CommandRecorder,
    executions: u64,
}

impl<'d> OperatorPipeline<'d> {
    /// Start a pipeline from a description
    pub fn describe(device: &'d Device, desc: impl Into<OperatorDesc>) -> Self {
        Self {
            device,
            desc: desc.into(),
            flags: ExecutionFlags::empty(),
            descriptor_base: 0,
            state: PipelineState::Described,
            operator: None,
            table: None,
            temporary: None,
            persistent: None,
            recorder: CommandRecorder::new(),
            executions: 0,
        }
    }

    /// Set the execution flags used at compile time
    pub fn with_flags(mut self, flags: ExecutionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the first descriptor slot of the binding table
    pub fn with_descriptor_base(mut self, base: u32) -> Self {
        self.descriptor_base = base;
        self
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Operator description
    pub fn desc(&self) -> &OperatorDesc {
        &self.desc
    }

    /// Compiled operator, once compiled
    pub fn compiled(&self) -> Option<&CompiledOperator> {
        self.operator.as_ref()
    }

    /// Temporary resource, once allocated
    pub fn temporary(&self) -> Option<Buffer> {
        self.temporary
    }

    /// Persistent resource, once initialized
    pub fn persistent(&self) -> Option<Buffer> {
        self.persistent
    }

    /// Execute dispatches recorded so far
    pub fn executions(&self) -> u64 {
        self.executions
    }

    // =========================================================================
    // Compile
    // =========================================================================

    /// Compile the description
    pub fn compile(&mut self) -> Result<&CompiledOperator> {
        if self.state != PipelineState::Described {
            log::warn!("compile in state {:?}", self.state);
            return Err(Error::InvalidState);
        }
        let op = CompiledOperator::compile(&self.desc, self.flags)?;
        self.state = PipelineState::Compiled;
        Ok(&*self.operator.insert(op))
    }

    // =========================================================================
    // Initialize
    // =========================================================================

    /// Run the initialization dispatch
    ///
    /// `weights` holds one entry per operator input and may only carry
    /// buffers for owned-by-runtime inputs; pass an empty slice when there
    /// are none. Owned weights must already be uploaded into recorded work
    /// on `channel`. Submits and waits.
    pub fn initialize(
        &mut self,
        pool: &mut ResourcePool<'d>,
        channel: &mut CommandChannel<'_>,
        weights: &[Option<Buffer>],
    ) -> Result<()> {
        match self.state {
            PipelineState::Compiled => {}
            PipelineState::Described => {
                log::warn!("initialize before compile");
                return Err(Error::InvalidState);
            }
            PipelineState::Initialized | PipelineState::Executed => {
                log::warn!("operator initialized twice");
                return Err(Error::OperatorAlreadyInitialized);
            }
        }
        let op = self.operator.as_ref().ok_or(Error::InvalidState)?;
        let props = op.binding_properties();

        let persistent = pool.allocate_scratch(props.persistent_resource_size)?;
        let table = match Self::run_initializer(
            self.device,
            op,
            self.descriptor_base,
            persistent,
            pool,
            channel,
            weights,
        ) {
            Ok(table) => table,
            Err(e) => {
                if let Some(buffer) = persistent {
                    pool.release(buffer)?;
                }
                return Err(e);
            }
        };

        self.persistent = persistent;
        self.table = Some(table);
        self.state = PipelineState::Initialized;
        log::debug!("{:?} operator initialized", self.desc.kind());
        Ok(())
    }

    fn run_initializer(
        device: &'d Device,
        op: &CompiledOperator,
        descriptor_base: u32,
        persistent: Option<Buffer>,
        pool: &mut ResourcePool<'d>,
        channel: &mut CommandChannel<'_>,
        weights: &[Option<Buffer>],
    ) -> Result<BindingTable<'d>> {
        let initializer = OperatorInitializer::new(&[op]);
        let count = initializer
            .binding_properties()
            .required_descriptor_count
            .max(op.binding_properties().required_descriptor_count);
        let range = pool.table_range(descriptor_base, count)?;

        let target = DispatchTarget::Initializer(&initializer);
        let mut table = BindingTable::new(device, &BindingTableDesc { target, range })?;

        let inputs = if weights.is_empty() {
            Binding::None
        } else {
            Binding::BufferArray(weights.iter().map(|w| w.map(Into::into)).collect())
        };
        table.bind_inputs(&[inputs])?;
        table.bind_outputs(&[Binding::from_buffer(persistent)])?;

        CommandRecorder::new().record_dispatch(channel, pool.heap(), target, &table)?;
        channel.record(|list| list.resource_barrier(&[ResourceBarrier::uav_all()]));
        channel.submit_and_wait()?;
        Ok(table)
    }

    // =========================================================================
    // Execute
    // =========================================================================

    /// Bind inputs and outputs and record the execute dispatch
    ///
    /// Owned-by-runtime inputs must be `None`. Records only; the caller
    /// submits through `channel`. Bindings are refreshed on every call.
    pub fn execute(
        &mut self,
        pool: &mut ResourcePool<'d>,
        channel: &mut CommandChannel<'_>,
        inputs: &[Option<Buffer>],
        outputs: &[Option<Buffer>],
    ) -> Result<()> {
        if !self.state.is_initialized() {
            log::error!("execute in state {:?}", self.state);
            return Err(Error::OperatorNotInitialized);
        }
        let op = self.operator.as_ref().ok_or(Error::OperatorNotInitialized)?;
        let props = op.binding_properties();

        if props.temporary_resource_size > 0 && self.temporary.is_none() {
            self.temporary = pool.allocate_scratch(props.temporary_resource_size)?;
        }

        let table = self.table.as_mut().ok_or(Error::InvalidState)?;
        let target = DispatchTarget::Operator(op);
        let range = table.range();
        table.reset(&BindingTableDesc { target, range })?;

        if props.temporary_resource_size > 0 {
            table.bind_temporary(&Binding::from_buffer(self.temporary))?;
        }
        if props.persistent_resource_size > 0 {
            table.bind_persistent(&Binding::from_buffer(self.persistent))?;
        }
        let inputs: Vec<Binding> = inputs.iter().map(|b| Binding::from_buffer(*b)).collect();
        let outputs: Vec<Binding> = outputs.iter().map(|b| Binding::from_buffer(*b)).collect();
        table.bind_inputs(&inputs)?;
        table.bind_outputs(&outputs)?;

        self.recorder
            .record_dispatch(channel, pool.heap(), target, table)?;
        channel.record(|list| list.resource_barrier(&[ResourceBarrier::uav_all()]));

        self.state = PipelineState::Executed;
        self.executions += 1;
        Ok(())
    }

    /// Return the temporary and persistent resources to `pool`
    pub fn release(self, pool: &mut ResourcePool<'d>) -> Result<()> {
        for buffer in [self.temporary, self.persistent].into_iter().flatten() {
            pool.release(buffer)?;
        }
        Ok(())
    }
}
