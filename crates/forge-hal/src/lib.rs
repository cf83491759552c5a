//! # FORGE Device Layer
//!
//! Explicit command-queue device model: adapters, logical devices, committed
//! buffers, descriptor heaps, command lists, command queues, root signatures
//! and compute pipeline states.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Device Execution                           │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐    │
//! │  │   Platform   │───▶│   Adapter    │───▶│      Device      │    │
//! │  │ (enumerate)  │    │  (selected)  │    │ (resource arena) │    │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘    │
//! │                                                    │              │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────▼─────────┐    │
//! │  │ Command List │───▶│Command Queue │───▶│ Timeline thread  │    │
//! │  │ (recording)  │    │ (submission) │    │   (executor)     │    │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. Commands are recorded into a [`CommandList`]
//! 2. The list is closed, which surfaces any recording error
//! 3. The queue hands the recorded commands to the device timeline
//! 4. The timeline executes them in order against device memory
//! 5. A fence signal retires the submission

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod builtin;
pub mod command;
pub mod descriptor;
pub mod device;
mod executor;
pub mod kernel;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod resource;
pub mod select;
pub mod shader;

// Re-exports
pub use adapter::{Adapter, AdapterAttributes, AdapterInfo};
pub use command::{
    Command, CommandAllocator, CommandList, CommandListState, CommandListType, ResourceBarrier,
};
pub use descriptor::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapKind, Format, GpuDescriptorHandle,
    UnorderedAccessViewDesc,
};
pub use device::{Device, DeviceConfig, FeatureLevel, HeapBudgets};
pub use kernel::{DescriptorTable, DeviceKernel, KernelContext, KernelInvocation};
pub use pipeline::{
    ComputePipelineState, DescriptorRange, RootParameter, RootSignature, RootSignatureDesc,
};
pub use platform::{Platform, ReferencePlatform};
pub use queue::CommandQueue;
pub use resource::{HeapKind, Mapping, ResourceDesc, ResourceFlags, ResourceStates};
pub use select::{select_adapter, select_device, AdapterPolicy};
pub use shader::{KernelRegistry, ShaderBytecode};
