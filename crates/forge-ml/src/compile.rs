//! # Operator Compilation
//!
//! Validates an operator description and fixes everything a dispatch needs:
//! the binding layout, the temporary and persistent resource sizes, and the
//! kernel that runs on the device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use forge_core::{CompileError, Result};
use forge_hal::DeviceKernel;

use crate::binding::{BindingLayout, SlotRule};
use crate::kernels::{
    ConvGeometry, ConvolutionKernel, ConvolutionSlots, IdentityKernel, WeightSource,
};
use crate::operator::{ConvolutionDesc, IdentityDesc, OperatorDesc, OperatorKind};
use crate::tensor::{DataType, TensorDesc, MAX_TENSOR_BYTES};

bitflags::bitflags! {
    /// Per-operator execution flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExecutionFlags: u32 {
        /// Use direct algorithms instead of scratch-backed ones
        const DISABLE_META_COMMANDS = 1 << 0;
    }
}

/// Resources a dispatch needs bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingProperties {
    /// Descriptors the binding table must provide
    pub required_descriptor_count: u32,
    /// Scratch bytes needed during the dispatch
    pub temporary_resource_size: u64,
    /// Bytes that must persist from initialization to every execution
    pub persistent_resource_size: u64,
}

static NEXT_DISPATCHABLE: AtomicU64 = AtomicU64::new(1);

/// Unique identity for a dispatchable object
pub(crate) fn next_dispatchable_id() -> u64 {
    NEXT_DISPATCHABLE.fetch_add(1, Ordering::Relaxed)
}

/// Owned weights an initializer copies into the persistent resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WeightPacking {
    /// Input slot of the filter within the operator's inputs
    pub(crate) filter_input: u32,
    /// Filter elements
    pub(crate) filter_len: usize,
    /// Bias input slot and elements, when the bias is owned too
    pub(crate) bias: Option<(u32, usize)>,
}

// =============================================================================
// COMPILED OPERATOR
// =============================================================================

/// Validated, immutable operator ready for dispatch
#[derive(Debug)]
pub struct CompiledOperator {
    id: u64,
    desc: OperatorDesc,
    flags: ExecutionFlags,
    properties: BindingProperties,
    layout: BindingLayout,
    kernel: Arc<dyn DeviceKernel>,
    weights: Option<WeightPacking>,
}

impl CompiledOperator {
    /// Validate `desc` and compile it
    pub fn compile(desc: &OperatorDesc, flags: ExecutionFlags) -> Result<Self> {
        let compiled = match desc {
            OperatorDesc::Identity(identity) => compile_identity(identity)?,
            OperatorDesc::Convolution(conv) => compile_convolution(conv, flags)?,
        };
        let properties = BindingProperties {
            required_descriptor_count: compiled.layout.descriptor_count(),
            temporary_resource_size: compiled.layout.temporary,
            persistent_resource_size: compiled.layout.persistent,
        };
        log::debug!(
            "compiled {:?}: {} descriptors, temporary {} B, persistent {} B",
            desc.kind(),
            properties.required_descriptor_count,
            properties.temporary_resource_size,
            properties.persistent_resource_size
        );

        Ok(Self {
            id: next_dispatchable_id(),
            desc: desc.clone(),
            flags,
            properties,
            layout: compiled.layout,
            kernel: compiled.kernel,
            weights: compiled.weights,
        })
    }

    /// Source description
    pub fn desc(&self) -> &OperatorDesc {
        &self.desc
    }

    /// Operator kind
    pub fn kind(&self) -> OperatorKind {
        self.desc.kind()
    }

    /// Execution flags it was compiled with
    pub fn flags(&self) -> ExecutionFlags {
        self.flags
    }

    /// Execute-phase binding requirements
    pub fn binding_properties(&self) -> BindingProperties {
        self.properties
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

    pub(crate) fn weights(&self) -> Option<WeightPacking> {
        self.weights
    }

    /// Number of input slots
    pub(crate) fn input_count(&self) -> usize {
        self.layout.input_groups.len()
    }
}

struct Compiled {
    layout: BindingLayout,
    kernel: Arc<dyn DeviceKernel>,
    weights: Option<WeightPacking>,
}

// =============================================================================
// IDENTITY
// =============================================================================

fn compile_identity(desc: &IdentityDesc) -> core::result::Result<Compiled, CompileError> {
    let (input, output) = (&desc.input, &desc.output);
    input.validate()?;
    output.validate()?;
    if input.is_owned_by_runtime() || output.is_owned_by_runtime() {
        return Err(CompileError::UnsupportedTensorFlags);
    }
    if input.data_type != output.data_type {
        return Err(CompileError::DataTypeMismatch);
    }
    if input.sizes != output.sizes {
        return Err(CompileError::ShapeMismatch);
    }

    let packed = input.is_packed() && output.is_packed();
    if !packed && !input.data_type.is_32bit() {
        return Err(CompileError::UnsupportedStrides);
    }

    let kernel = if packed {
        IdentityKernel::packed(input.element_count() * input.data_type.size_bytes())
    } else {
        IdentityKernel::strided(
            input.sizes.clone(),
            input.effective_strides(),
            output.effective_strides(),
        )
    };

    Ok(Compiled {
        layout: BindingLayout::operator(
            vec![SlotRule::Required(input.byte_size())],
            vec![SlotRule::Required(output.byte_size())],
            0,
            0,
        ),
        kernel: Arc::new(kernel),
        weights: None,
    })
}

// =============================================================================
// CONVOLUTION
// =============================================================================

fn check_conv_tensor(tensor: &TensorDesc) -> core::result::Result<(), CompileError> {
    if tensor.rank() != 4 {
        return Err(CompileError::InvalidRank);
    }
    tensor.validate()?;
    if tensor.data_type != DataType::Float32 {
        return Err(CompileError::UnsupportedDataType);
    }
    if !tensor.is_packed() {
        return Err(CompileError::UnsupportedStrides);
    }
    Ok(())
}

/// Output extent of one spatial dimension
///
/// `kernel`, `dilation` and `stride` are non-zero. A padded input past
/// `u32::MAX` is an invalid parameter; a window past it can never fit.
fn output_extent(
    input: u32,
    [start, end]: [u32; 2],
    kernel: u32,
    dilation: u32,
    stride: u32,
) -> core::result::Result<u32, CompileError> {
    let padded = start
        .checked_add(end)
        .and_then(|pad| pad.checked_add(input))
        .ok_or(CompileError::InvalidConvolutionParameters)?;
    let window = (kernel - 1)
        .checked_mul(dilation)
        .and_then(|span| span.checked_add(1))
        .ok_or(CompileError::InvalidConvolutionWindow)?;
    if window > padded {
        return Err(CompileError::InvalidConvolutionWindow);
    }
    Ok((padded - window) / stride + 1)
}

fn compile_convolution(
    desc: &ConvolutionDesc,
    flags: ExecutionFlags,
) -> core::result::Result<Compiled, CompileError> {
    check_conv_tensor(&desc.input)?;
    check_conv_tensor(&desc.filter)?;
    check_conv_tensor(&desc.output)?;
    if let Some(bias) = &desc.bias {
        check_conv_tensor(bias)?;
    }

    if desc.strides.contains(&0)
        || desc.dilations.contains(&0)
        || desc.group_count == 0
        || desc.output_padding != [0, 0]
    {
        return Err(CompileError::InvalidConvolutionParameters);
    }

    let filter_owned = desc.filter.is_owned_by_runtime();
    let bias_owned = desc.bias.as_ref().map_or(false, TensorDesc::is_owned_by_runtime);
    if desc.input.is_owned_by_runtime()
        || desc.output.is_owned_by_runtime()
        || (bias_owned && !filter_owned)
    {
        return Err(CompileError::UnsupportedTensorFlags);
    }

    let [n, c, h, w] = dims4(&desc.input);
    let [k, cg, kh, kw] = dims4(&desc.filter);
    let [on, ok, oh, ow] = dims4(&desc.output);
    let groups = desc.group_count;

    if c % groups != 0 || k % groups != 0 || cg != c / groups || ok != k {
        return Err(CompileError::ChannelMismatch);
    }
    if let Some(bias) = &desc.bias {
        if dims4(bias) != [1, k, 1, 1] {
            return Err(CompileError::ChannelMismatch);
        }
    }

    let expected_h = output_extent(
        h,
        [desc.start_padding[0], desc.end_padding[0]],
        kh,
        desc.dilations[0],
        desc.strides[0],
    )?;
    let expected_w = output_extent(
        w,
        [desc.start_padding[1], desc.end_padding[1]],
        kw,
        desc.dilations[1],
        desc.strides[1],
    )?;
    if on != n || oh != expected_h || ow != expected_w {
        return Err(CompileError::OutputShapeMismatch);
    }

    let geometry = ConvGeometry {
        batch: n as usize,
        channels: c as usize,
        height: h as usize,
        width: w as usize,
        filters: k as usize,
        groups: groups as usize,
        kernel: [kh as usize, kw as usize],
        output: [oh as usize, ow as usize],
        strides: [desc.strides[0] as usize, desc.strides[1] as usize],
        dilations: [desc.dilations[0] as usize, desc.dilations[1] as usize],
        start_padding: [desc.start_padding[0] as usize, desc.start_padding[1] as usize],
    };

    let filter_len = geometry.filter_len();
    let temporary = if flags.contains(ExecutionFlags::DISABLE_META_COMMANDS) {
        0
    } else {
        // C/G * KH * KW * OH * OW floats
        [cg, kh, kw, oh, ow]
            .iter()
            .try_fold(4u64, |bytes, &d| bytes.checked_mul(d as u64))
            .filter(|&bytes| bytes <= MAX_TENSOR_BYTES)
            .ok_or(CompileError::TensorTooLarge)?
    };
    let persistent = if filter_owned {
        let bias_len = if bias_owned { k as u64 } else { 0 };
        (filter_len as u64)
            .checked_add(bias_len)
            .and_then(|len| len.checked_mul(4))
            .and_then(|bytes| forge_core::checked_align_up(bytes, 4))
            .ok_or(CompileError::TensorTooLarge)?
    } else {
        0
    };

    let filter_rule = if filter_owned {
        SlotRule::Empty
    } else {
        SlotRule::Required(desc.filter.byte_size())
    };
    let bias_rule = match &desc.bias {
        Some(bias) if !bias_owned => SlotRule::Required(bias.byte_size()),
        _ => SlotRule::Empty,
    };
    let layout = BindingLayout::operator(
        vec![
            SlotRule::Required(desc.input.byte_size()),
            filter_rule,
            bias_rule,
        ],
        vec![SlotRule::Required(desc.output.byte_size())],
        temporary,
        persistent,
    );

    let slots = ConvolutionSlots {
        input: 0,
        output: 3,
        temporary: layout.temporary_slot(),
    };
    let persistent_slot = layout.persistent_slot();
    let filter_source = match persistent_slot {
        Some(slot) if filter_owned => WeightSource::Persistent { slot, offset: 0 },
        _ => WeightSource::Slot(1),
    };
    let bias_source = match (&desc.bias, persistent_slot) {
        (None, _) => WeightSource::Absent,
        (Some(_), Some(slot)) if bias_owned => WeightSource::Persistent {
            slot,
            offset: filter_len,
        },
        (Some(_), _) => WeightSource::Slot(2),
    };

    let weights = filter_owned.then_some(WeightPacking {
        filter_input: 1,
        filter_len,
        bias: bias_owned.then_some((2, k as usize)),
    });

    Ok(Compiled {
        layout,
        kernel: Arc::new(ConvolutionKernel::new(
            geometry,
            desc.mode,
            slots,
            filter_source,
            bias_source,
        )),
        weights,
    })
}

fn dims4(tensor: &TensorDesc) -> [u32; 4] {
    let mut dims = [0; 4];
    for (out, &size) in dims.iter_mut().zip(tensor.sizes.iter()) {
        *out = size;
    }
    dims
}
