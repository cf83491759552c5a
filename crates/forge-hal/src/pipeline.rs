//! # Root Signatures and Pipeline States
//!
//! A root signature declares what a compute kernel binds: root constants and
//! descriptor tables. A compute pipeline state pairs a root signature with a
//! kernel resolved from shader bytecode.

use std::sync::Arc;

use forge_core::{Error, Result};

use crate::kernel::DeviceKernel;

/// Root signature size limit in 32-bit values
pub const MAX_ROOT_SIGNATURE_DWORDS: u32 = 64;

// =============================================================================
// ROOT SIGNATURE
// =============================================================================

/// Contiguous range of unordered-access registers in a descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    /// Number of descriptors
    pub count: u32,
    /// First `u` register
    pub base_register: u32,
}

/// One root signature slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootParameter {
    /// Inline 32-bit constants in a `b` register
    Constants {
        /// Number of 32-bit values
        num_values: u32,
        /// `b` register
        shader_register: u32,
    },
    /// Table of unordered-access views
    DescriptorTable {
        /// Register ranges, in table order
        ranges: Vec<DescriptorRange>,
    },
}

impl RootParameter {
    /// Cost in root signature DWORDs
    pub fn cost(&self) -> u32 {
        match self {
            RootParameter::Constants { num_values, .. } => *num_values,
            RootParameter::DescriptorTable { .. } => 1,
        }
    }

    /// Descriptors a table addresses (0 for constants)
    pub fn descriptor_count(&self) -> u32 {
        match self {
            RootParameter::Constants { .. } => 0,
            RootParameter::DescriptorTable { ranges } => ranges.iter().map(|r| r.count).sum(),
        }
    }
}

/// Root signature description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootSignatureDesc {
    /// Parameters by root index
    pub parameters: Vec<RootParameter>,
}

impl RootSignatureDesc {
    /// Check DWORD budget and table shapes
    pub fn validate(&self) -> Result<()> {
        let cost: u32 = self.parameters.iter().map(RootParameter::cost).sum();
        if cost > MAX_ROOT_SIGNATURE_DWORDS {
            log::warn!("root signature uses {} DWORDs", cost);
            return Err(Error::InvalidParameter);
        }
        for parameter in &self.parameters {
            if let RootParameter::DescriptorTable { ranges } = parameter {
                if ranges.is_empty() || ranges.iter().any(|r| r.count == 0) {
                    return Err(Error::InvalidParameter);
                }
            }
        }
        Ok(())
    }
}

/// Created root signature
#[derive(Debug, Clone)]
pub struct RootSignature {
    desc: Arc<RootSignatureDesc>,
}

impl RootSignature {
    pub(crate) fn new(desc: RootSignatureDesc) -> Self {
        Self {
            desc: Arc::new(desc),
        }
    }

    /// Get the description
    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }

    /// Get the parameter at a root index
    pub fn parameter(&self, index: u32) -> Option<&RootParameter> {
        self.desc.parameters.get(index as usize)
    }

    /// Check whether two handles name the same root signature object
    pub fn same_as(&self, other: &RootSignature) -> bool {
        Arc::ptr_eq(&self.desc, &other.desc)
    }
}

// =============================================================================
// PIPELINE STATE
// =============================================================================

/// Compute pipeline state object
#[derive(Debug, Clone)]
pub struct ComputePipelineState {
    root_signature: RootSignature,
    kernel: Arc<dyn DeviceKernel>,
}

impl ComputePipelineState {
    pub(crate) fn new(root_signature: RootSignature, kernel: Arc<dyn DeviceKernel>) -> Self {
        Self {
            root_signature,
            kernel,
        }
    }

    /// Root signature the pipeline was created with
    pub fn root_signature(&self) -> &RootSignature {
        &self.root_signature
    }

    /// Resolved kernel
    pub fn kernel(&self) -> &Arc<dyn DeviceKernel> {
        &self.kernel
    }

    /// Kernel name
    pub fn name(&self) -> &str {
        self.kernel.name()
    }
}
