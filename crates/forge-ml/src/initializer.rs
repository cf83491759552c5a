//! # Operator Initializer
//!
//! One dispatch that prepares the persistent resources of a set of compiled
//! operators. Each operator contributes one input array, holding a binding
//! per operator input, and one output: its persistent resource.
//!
//! Only owned-by-runtime weights are read. Operators without owned weights
//! take no bindings and the dispatch has nothing to do for them.

use std::sync::Arc;

use forge_hal::DeviceKernel;

use crate::binding::{BindingLayout, SlotRule};
use crate::compile::{next_dispatchable_id, BindingProperties, CompiledOperator};
use crate::kernels::{InitializerKernel, PackEntry};

/// Initialization dispatch for one or more compiled operators
#[derive(Debug)]
pub struct OperatorInitializer {
    id: u64,
    operators: Vec<u64>,
    layout: BindingLayout,
    kernel: Arc<dyn DeviceKernel>,
    properties: BindingProperties,
}

impl OperatorInitializer {
    /// Create an initializer for `operators`
    pub fn new(operators: &[&CompiledOperator]) -> Self {
        let mut groups = Vec::with_capacity(operators.len());
        let mut outputs = Vec::with_capacity(operators.len());
        let mut weights = Vec::new();

        for (index, op) in operators.iter().enumerate() {
            let mut group = vec![SlotRule::Empty; op.input_count()];
            let persistent = op.binding_properties().persistent_resource_size;
            if let Some(packing) = op.weights() {
                let filter = packing.filter_input as usize;
                group[filter] = SlotRule::Required((packing.filter_len * 4) as u64);
                if let Some((bias, len)) = packing.bias {
                    group[bias as usize] = SlotRule::Required((len * 4) as u64);
                }
                weights.push((index, packing));
            }
            outputs.push(if persistent > 0 {
                SlotRule::Required(persistent)
            } else {
                SlotRule::Empty
            });
            groups.push(group);
        }

        let layout = BindingLayout::initializer(groups, outputs);
        let entries = weights
            .into_iter()
            .map(|(index, packing)| {
                let base = layout.group_base(index);
                PackEntry {
                    filter_slot: base + packing.filter_input,
                    filter_len: packing.filter_len,
                    bias: packing.bias.map(|(slot, len)| (base + slot, len)),
                    output_slot: layout.input_slots() + index as u32,
                }
            })
            .collect();

        let properties = BindingProperties {
            required_descriptor_count: layout.descriptor_count(),
            temporary_resource_size: 0,
            persistent_resource_size: 0,
        };
        log::debug!(
            "initializer for {} operators: {} descriptors",
            operators.len(),
            properties.required_descriptor_count
        );

        Self {
            id: next_dispatchable_id(),
            operators: operators.iter().map(|op| op.id()).collect(),
            layout,
            kernel: Arc::new(InitializerKernel::new(entries)),
            properties,
        }
    }

    /// Binding requirements of the initialization dispatch
    pub fn binding_properties(&self) -> BindingProperties {
        self.properties
    }

    /// Number of operators it initializes
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    /// Check whether `op` is one of the operators it initializes
    pub fn covers(&self, op: &CompiledOperator) -> bool {
        self.operators.contains(&op.id())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    pub(crate) fn kernel(&self) -> &Arc<dyn DeviceKernel> {
        &self.kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::ExecutionFlags;
    use crate::operator::{ConvolutionDesc, OperatorDesc};
    use crate::tensor::{DataType, TensorDesc};

    fn tensor(sizes: &[u32]) -> TensorDesc {
        TensorDesc::new(DataType::Float32, sizes).expect("tensor")
    }

    #[test]
    fn test_identity_initializer_has_two_descriptors() {
        let op = CompiledOperator::compile(
            &OperatorDesc::identity(tensor(&[4]), tensor(&[4])),
            ExecutionFlags::empty(),
        )
        .expect("compile");
        let init = OperatorInitializer::new(&[&op]);
        let props = init.binding_properties();
        assert_eq!(props.required_descriptor_count, 2);
        assert_eq!(props.temporary_resource_size, 0);
        assert!(init.covers(&op));
    }

    #[test]
    fn test_owned_filter_slots() {
        let desc = ConvolutionDesc::new(
            tensor(&[1, 1, 2, 2]),
            tensor(&[1, 1, 1, 1]).owned_by_runtime(),
            tensor(&[1, 1, 2, 2]),
        );
        let conv = CompiledOperator::compile(&desc.into(), ExecutionFlags::empty())
            .expect("compile");
        let identity = CompiledOperator::compile(
            &OperatorDesc::identity(tensor(&[4]), tensor(&[4])),
            ExecutionFlags::empty(),
        )
        .expect("compile");

        let init = OperatorInitializer::new(&[&conv, &identity]);
        // 3 conv inputs + 1 identity input + 2 outputs
        assert_eq!(init.binding_properties().required_descriptor_count, 6);
        assert_eq!(init.operator_count(), 2);
        assert_eq!(init.layout().input_groups[0][1], SlotRule::Required(4));
        assert_eq!(init.layout().outputs[0], SlotRule::Required(4));
        assert_eq!(init.layout().outputs[1], SlotRule::Empty);
    }
}
