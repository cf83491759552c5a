//! # Command Recorder
//!
//! Records initializer and operator dispatches into a command channel.

use forge_cmd::CommandChannel;
use forge_core::{DescriptorHeapId, Error, Result};

use crate::binding::{BindingTable, DispatchTarget};

/// Records dispatches of initializers and compiled operators
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRecorder;

impl CommandRecorder {
    /// Create a recorder
    pub fn new() -> Self {
        Self
    }

    /// Record `target` with the bindings of `table`
    ///
    /// The table must currently target `target` and be completely bound.
    /// Binds `heap` before the dispatch.
    pub fn record_dispatch(
        &self,
        channel: &mut CommandChannel<'_>,
        heap: DescriptorHeapId,
        target: DispatchTarget<'_>,
        table: &BindingTable<'_>,
    ) -> Result<()> {
        if table.target_id() != target.id() {
            log::warn!("binding table targets another dispatchable");
            return Err(Error::InvalidParameter);
        }
        let invocation = table.invocation()?;
        log::trace!(
            "record {} over {} descriptors",
            invocation.kernel.name(),
            table.descriptor_count()
        );
        channel.record(|list| {
            list.set_descriptor_heaps(&[heap]);
            list.dispatch_kernel(invocation);
        });
        Ok(())
    }
}
