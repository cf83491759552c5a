//! # FORGE Error Handling
//!
//! Error types for the compute stack.
//!
//! Every device or driver call that can fail is checked where it is made and
//! propagated unchanged. Nothing in the stack retries: the first error aborts
//! the run.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// FORGE Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// FORGE unified error type
///
/// Errors are categorized by the layer that detects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Object is in the wrong state for the operation
    InvalidState,
    /// Resource not found
    NotFound,
    /// Operation not supported by this device
    NotSupported,

    // =========================================================================
    // Adapter Errors
    // =========================================================================
    /// No adapter satisfies the selection policy
    NoMatchingAdapter,
    /// Logical device could not be created on the adapter
    DeviceCreationFailed,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Zero or oversized buffer request
    InvalidSize,
    /// Heap budget exhausted
    OutOfMemory,
    /// Buffer cannot be mapped (wrong heap or already mapped)
    MappingFailed,
    /// Access past the end of a buffer
    BufferOverflow,
    /// Offset or size not aligned to the element size
    MisalignedAccess,

    // =========================================================================
    // Resource / Descriptor Errors
    // =========================================================================
    /// Buffer usage state does not match the operation
    ResourceStateMismatch,
    /// Descriptor slot outside the heap capacity
    DescriptorOutOfRange,
    /// Descriptor handle does not belong to a live heap
    InvalidDescriptorHandle,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Recording into a closed command list
    CommandListClosed,
    /// Submitting a command list that is still recording
    CommandListNotClosed,
    /// Command recorded with inconsistent state
    InvalidCommand,
    /// Device was removed after a failed submission
    DeviceRemoved,

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Fence wait timeout (waits are infinite; never produced)
    FenceTimeout,

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// Shader bytecode blob is empty
    InvalidBytecode,
    /// No kernel registered for the bytecode
    KernelNotFound,
    /// Compiled kernel artifact could not be read
    KernelArtifactUnreadable,

    // =========================================================================
    // Operator Errors
    // =========================================================================
    /// Operator description failed to compile
    Compilation(CompileError),
    /// Execute dispatched before the operator was initialized
    OperatorNotInitialized,
    /// Operator initialized more than once
    OperatorAlreadyInitialized,
    /// Binding table range smaller than the dispatch requires
    BindingTableTooSmall,
    /// Required binding missing at dispatch time
    MissingBinding,
    /// Binding does not fit its slot
    InvalidBinding,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Adapter
            Self::NoMatchingAdapter => write!(f, "no adapter matches the selection policy"),
            Self::DeviceCreationFailed => write!(f, "device creation failed"),

            // Memory
            Self::InvalidSize => write!(f, "invalid buffer size"),
            Self::OutOfMemory => write!(f, "out of device memory"),
            Self::MappingFailed => write!(f, "buffer mapping failed"),
            Self::BufferOverflow => write!(f, "buffer overflow"),
            Self::MisalignedAccess => write!(f, "misaligned buffer access"),

            // Resource
            Self::ResourceStateMismatch => write!(f, "resource state mismatch"),
            Self::DescriptorOutOfRange => write!(f, "descriptor index out of range"),
            Self::InvalidDescriptorHandle => write!(f, "invalid descriptor handle"),

            // Command
            Self::CommandListClosed => write!(f, "command list is closed"),
            Self::CommandListNotClosed => write!(f, "command list is not closed"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::DeviceRemoved => write!(f, "device removed"),

            // Sync
            Self::FenceTimeout => write!(f, "fence wait timeout"),

            // Pipeline
            Self::InvalidBytecode => write!(f, "invalid shader bytecode"),
            Self::KernelNotFound => write!(f, "kernel not found"),
            Self::KernelArtifactUnreadable => write!(f, "kernel artifact unreadable"),

            // Operator
            Self::Compilation(e) => write!(f, "operator compilation failed: {}", e),
            Self::OperatorNotInitialized => write!(f, "operator not initialized"),
            Self::OperatorAlreadyInitialized => write!(f, "operator already initialized"),
            Self::BindingTableTooSmall => write!(f, "binding table too small"),
            Self::MissingBinding => write!(f, "missing binding"),
            Self::InvalidBinding => write!(f, "invalid binding"),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Reasons an operator description fails to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileError {
    /// Tensor rank outside the supported range
    InvalidRank,
    /// A dimension has zero extent
    ZeroExtent,
    /// Stride count differs from the dimension count
    StrideCountMismatch,
    /// Tensor data type is unknown
    UnknownDataType,
    /// Input and output data types differ
    DataTypeMismatch,
    /// Data type not supported by the operator
    UnsupportedDataType,
    /// Input and output shapes differ
    ShapeMismatch,
    /// Strided layout not supported by the operator
    UnsupportedStrides,
    /// Tensor flags not allowed on this operand
    UnsupportedTensorFlags,
    /// Stride, dilation, group or padding value invalid
    InvalidConvolutionParameters,
    /// Channel counts of input, filter and output disagree
    ChannelMismatch,
    /// Filter window larger than the padded input
    InvalidConvolutionWindow,
    /// Declared output shape differs from the computed one
    OutputShapeMismatch,
    /// Element count or byte size exceeds the addressable range
    TensorTooLarge,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidRank => "invalid tensor rank",
            Self::ZeroExtent => "zero tensor extent",
            Self::StrideCountMismatch => "stride count does not match dimension count",
            Self::UnknownDataType => "unknown data type",
            Self::DataTypeMismatch => "data type mismatch",
            Self::UnsupportedDataType => "unsupported data type",
            Self::ShapeMismatch => "shape mismatch",
            Self::UnsupportedStrides => "unsupported strides",
            Self::UnsupportedTensorFlags => "unsupported tensor flags",
            Self::InvalidConvolutionParameters => "invalid convolution parameters",
            Self::ChannelMismatch => "channel mismatch",
            Self::InvalidConvolutionWindow => "filter window exceeds padded input",
            Self::OutputShapeMismatch => "output shape mismatch",
            Self::TensorTooLarge => "tensor size overflows",
        };
        f.write_str(msg)
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compilation(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let s = format!("{}", Error::Compilation(CompileError::OutputShapeMismatch));
        assert!(s.contains("output shape mismatch"));
        assert_eq!(Error::DeviceRemoved.to_string(), "device removed");
    }

    #[test]
    fn test_error_conversion() {
        let error: Error = CompileError::ZeroExtent.into();
        assert!(matches!(error, Error::Compilation(CompileError::ZeroExtent)));
    }
}
