//! # Shader Passes
//!
//! Dispatch of a precompiled compute shader over a `Channel x Height x Width`
//! block, outside the operator protocol. The shader binds its dimensions as
//! three root constants and its input and output as a two-view descriptor
//! table, and runs `ceil(H / 32) x ceil(W / 16)` thread groups.

use std::path::PathBuf;

use forge_cmd::CommandChannel;
use forge_core::{div_up, Result};
use forge_hal::builtin::IDENTITY_GROUP_SIZE;
use forge_hal::{
    ComputePipelineState, DescriptorRange, Device, Format, ResourceBarrier, RootParameter,
    RootSignature, RootSignatureDesc,
};
use forge_mem::{Buffer, ResourcePool};

const CONSTANTS_PARAMETER: u32 = 0;
const TABLE_PARAMETER: u32 = 1;

/// Shader pass description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderPassDesc {
    /// Directory holding compiled `.cso` artifacts
    pub kernel_dir: PathBuf,
    /// Artifact name without extension
    pub kernel_name: String,
    /// Block height
    pub height: u32,
    /// Block width
    pub width: u32,
    /// Block channels
    pub channels: u32,
    /// First of the two descriptor slots the pass writes
    pub descriptor_base: u32,
}

impl ShaderPassDesc {
    /// The identity shader over a `[C, H, W]` block
    pub fn identity(kernel_dir: impl Into<PathBuf>, [channels, height, width]: [u32; 3]) -> Self {
        Self {
            kernel_dir: kernel_dir.into(),
            kernel_name: "identity".into(),
            height,
            width,
            channels,
            descriptor_base: 0,
        }
    }

    /// Elements in the block
    pub fn element_count(&self) -> u64 {
        self.height as u64 * self.width as u64 * self.channels as u64
    }
}

/// Loaded shader pass, ready to record
#[derive(Debug, Clone)]
pub struct ShaderPass {
    desc: ShaderPassDesc,
    root_signature: RootSignature,
    pipeline: ComputePipelineState,
}

impl ShaderPass {
    /// Create the root signature and load the pipeline from disk
    pub fn new(device: &Device, desc: ShaderPassDesc) -> Result<Self> {
        let root_signature = device.create_root_signature(RootSignatureDesc {
            parameters: vec![
                RootParameter::Constants {
                    num_values: 3,
                    shader_register: 0,
                },
                RootParameter::DescriptorTable {
                    ranges: vec![DescriptorRange {
                        count: 2,
                        base_register: 0,
                    }],
                },
            ],
        })?;
        let pipeline =
            device.load_compute_pipeline_state(&root_signature, &desc.kernel_dir, &desc.kernel_name)?;
        log::debug!(
            "shader pass '{}' over {}x{}x{}",
            pipeline.name(),
            desc.channels,
            desc.height,
            desc.width
        );

        Ok(Self {
            desc,
            root_signature,
            pipeline,
        })
    }

    /// Pass description
    pub fn desc(&self) -> &ShaderPassDesc {
        &self.desc
    }

    /// Thread groups the pass dispatches
    pub fn thread_groups(&self) -> [u32; 3] {
        [
            div_up(self.desc.height, IDENTITY_GROUP_SIZE[0]),
            div_up(self.desc.width, IDENTITY_GROUP_SIZE[1]),
            1,
        ]
    }

    /// Write the views and record the dispatch and a UAV barrier
    ///
    /// Both buffers must be in `UNORDERED_ACCESS` when the work executes.
    pub fn record(
        &self,
        pool: &ResourcePool<'_>,
        channel: &mut CommandChannel<'_>,
        input: Buffer,
        output: Buffer,
    ) -> Result<()> {
        let count = u32::try_from(self.desc.element_count())
            .map_err(|_| forge_core::Error::InvalidSize)?;
        let base = self.desc.descriptor_base;
        let table = pool.create_view(input, count, Format::R32Float, base)?;
        pool.create_view(output, count, Format::R32Float, base + 1)?;

        let constants = [self.desc.height, self.desc.width, self.desc.channels];
        let [x, y, z] = self.thread_groups();
        let heap = pool.heap();
        channel.record(|list| {
            list.set_descriptor_heaps(&[heap]);
            list.set_compute_root_signature(&self.root_signature);
            list.set_compute_root_32bit_constants(CONSTANTS_PARAMETER, &constants, 0);
            list.set_compute_root_descriptor_table(TABLE_PARAMETER, table.gpu);
            list.set_pipeline_state(&self.pipeline);
            list.dispatch(x, y, z);
            list.resource_barrier(&[ResourceBarrier::uav_all()]);
        });
        Ok(())
    }
}
