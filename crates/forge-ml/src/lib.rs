//! # FORGE Tensor Operators
//!
//! Tensor descriptors, operator compilation and the two-phase
//! initialize-then-execute dispatch protocol.
//!
//! ## Operator Lifecycle
//!
//! ```text
//! ┌───────────┐  compile  ┌───────────┐ initialize ┌─────────────┐ execute ┌──────────┐
//! │ Described │──────────▶│ Compiled  │───────────▶│ Initialized │────────▶│ Executed │◀─┐
//! └───────────┘           └───────────┘            └─────────────┘         └────┬─────┘  │
//!                                                                                └────────┘
//! ```
//!
//! ## Binding Phases
//!
//! 1. The initializer binds owned-by-runtime weights as inputs and the
//!    persistent resource as output, and copies the weights in
//! 2. The binding table is reset to the compiled operator
//! 3. Temporary and persistent resources are rebound when non-zero
//! 4. Inputs and outputs are bound, then the dispatch and a UAV barrier are
//!    recorded

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod compile;
pub mod initializer;
mod kernels;
pub mod operator;
pub mod pipeline;
pub mod recorder;
pub mod shader;
pub mod tensor;

// Re-exports
pub use binding::{Binding, BindingTable, BindingTableDesc, BufferBinding, DispatchTarget};
pub use compile::{BindingProperties, CompiledOperator, ExecutionFlags};
pub use initializer::OperatorInitializer;
pub use operator::{ConvolutionDesc, ConvolutionMode, IdentityDesc, OperatorDesc, OperatorKind};
pub use pipeline::{OperatorPipeline, PipelineState};
pub use recorder::CommandRecorder;
pub use shader::{ShaderPass, ShaderPassDesc};
pub use tensor::{
    tensor_byte_size, DataType, TensorDesc, TensorFlags, MAX_DIMENSIONS, MAX_TENSOR_BYTES,
};
