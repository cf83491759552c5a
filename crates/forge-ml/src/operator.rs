//! # Operator Descriptions
//!
//! What an operator computes, before compilation. Descriptions are plain
//! data: nothing is validated until [`CompiledOperator::compile`].
//!
//! [`CompiledOperator::compile`]: crate::compile::CompiledOperator::compile

use crate::tensor::TensorDesc;

/// Operator kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    /// Elementwise identity
    Identity,
    /// 2D convolution
    Convolution,
}

// =============================================================================
// IDENTITY
// =============================================================================

/// `output = input`, element by element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDesc {
    /// Input tensor
    pub input: TensorDesc,
    /// Output tensor
    pub output: TensorDesc,
}

// =============================================================================
// CONVOLUTION
// =============================================================================

/// Filter orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConvolutionMode {
    /// Filter applied as stored
    #[default]
    CrossCorrelation,
    /// Filter flipped in both spatial dimensions
    Convolution,
}

/// 2D convolution over NCHW tensors
///
/// Spatial parameters are `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionDesc {
    /// Input `[N, C, H, W]`
    pub input: TensorDesc,
    /// Filter `[K, C / groups, KH, KW]`
    pub filter: TensorDesc,
    /// Optional bias `[1, K, 1, 1]`
    pub bias: Option<TensorDesc>,
    /// Output `[N, K, OH, OW]`
    pub output: TensorDesc,
    /// Filter orientation
    pub mode: ConvolutionMode,
    /// Window step
    pub strides: [u32; 2],
    /// Filter tap spacing
    pub dilations: [u32; 2],
    /// Padding before the first row/column
    pub start_padding: [u32; 2],
    /// Padding after the last row/column
    pub end_padding: [u32; 2],
    /// Output padding; must be zero
    pub output_padding: [u32; 2],
    /// Channel groups
    pub group_count: u32,
}

impl ConvolutionDesc {
    /// Unit strides and dilations, no padding, one group, cross-correlation
    pub fn new(input: TensorDesc, filter: TensorDesc, output: TensorDesc) -> Self {
        Self {
            input,
            filter,
            bias: None,
            output,
            mode: ConvolutionMode::CrossCorrelation,
            strides: [1, 1],
            dilations: [1, 1],
            start_padding: [0, 0],
            end_padding: [0, 0],
            output_padding: [0, 0],
            group_count: 1,
        }
    }

    /// Add a bias tensor
    pub fn with_bias(mut self, bias: TensorDesc) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Set the filter orientation
    pub fn with_mode(mut self, mode: ConvolutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set window strides
    pub fn with_strides(mut self, strides: [u32; 2]) -> Self {
        self.strides = strides;
        self
    }

    /// Set filter dilations
    pub fn with_dilations(mut self, dilations: [u32; 2]) -> Self {
        self.dilations = dilations;
        self
    }

    /// Set start and end padding
    pub fn with_padding(mut self, start: [u32; 2], end: [u32; 2]) -> Self {
        self.start_padding = start;
        self.end_padding = end;
        self
    }

    /// Set output padding
    pub fn with_output_padding(mut self, output_padding: [u32; 2]) -> Self {
        self.output_padding = output_padding;
        self
    }

    /// Set the group count
    pub fn with_group_count(mut self, group_count: u32) -> Self {
        self.group_count = group_count;
        self
    }
}

// =============================================================================
// OPERATOR DESCRIPTION
// =============================================================================

/// Any supported operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorDesc {
    /// Identity
    Identity(IdentityDesc),
    /// 2D convolution
    Convolution(ConvolutionDesc),
}

impl OperatorDesc {
    /// Identity from `input` to `output`
    pub fn identity(input: TensorDesc, output: TensorDesc) -> Self {
        OperatorDesc::Identity(IdentityDesc { input, output })
    }

    /// Operator kind
    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorDesc::Identity(_) => OperatorKind::Identity,
            OperatorDesc::Convolution(_) => OperatorKind::Convolution,
        }
    }

    /// Input slots in binding order; absent optional inputs are `None`
    pub fn inputs(&self) -> Vec<Option<&TensorDesc>> {
        match self {
            OperatorDesc::Identity(desc) => vec![Some(&desc.input)],
            OperatorDesc::Convolution(desc) => {
                vec![Some(&desc.input), Some(&desc.filter), desc.bias.as_ref()]
            }
        }
    }

    /// Output slots in binding order
    pub fn outputs(&self) -> Vec<&TensorDesc> {
        match self {
            OperatorDesc::Identity(desc) => vec![&desc.output],
            OperatorDesc::Convolution(desc) => vec![&desc.output],
        }
    }
}

impl From<IdentityDesc> for OperatorDesc {
    fn from(desc: IdentityDesc) -> Self {
        OperatorDesc::Identity(desc)
    }
}

impl From<ConvolutionDesc> for OperatorDesc {
    fn from(desc: ConvolutionDesc) -> Self {
        OperatorDesc::Convolution(desc)
    }
}
