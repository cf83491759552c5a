//! # Adapters
//!
//! Compute-capable device candidates reported by a platform.

use forge_core::{ByteSize, Luid, Result};

use crate::device::{Device, DeviceConfig, FeatureLevel};

// =============================================================================
// ADAPTER ATTRIBUTES
// =============================================================================

bitflags::bitflags! {
    /// Capabilities an adapter advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdapterAttributes: u32 {
        /// Supports the compute-only core feature level
        const CORE_COMPUTE = 1 << 0;
        /// Supports graphics (feature level 11_0 and above)
        const GRAPHICS = 1 << 1;
        /// Exposes machine-learning acceleration
        const GENERIC_ML = 1 << 2;
    }
}

// =============================================================================
// ADAPTER INFO
// =============================================================================

/// Immutable description of one adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Stable identity
    pub luid: Luid,
    /// Driver description string
    pub description: String,
    /// Hardware (as opposed to software) adapter
    pub is_hardware: bool,
    /// Supported capability set
    pub attributes: AdapterAttributes,
    /// Dedicated adapter memory
    pub dedicated_memory: ByteSize,
}

impl AdapterInfo {
    /// Check for a capability
    pub fn supports(&self, attributes: AdapterAttributes) -> bool {
        self.attributes.contains(attributes)
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

/// An enumerated adapter, ready to create a device on
#[derive(Debug, Clone)]
pub struct Adapter {
    info: AdapterInfo,
    config: DeviceConfig,
}

impl Adapter {
    /// Wrap adapter info with the platform's device configuration
    pub fn new(info: AdapterInfo, config: DeviceConfig) -> Self {
        Self { info, config }
    }

    /// Get adapter info
    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Get the driver description
    pub fn description(&self) -> &str {
        &self.info.description
    }

    /// Check hardware flag
    pub fn is_hardware(&self) -> bool {
        self.info.is_hardware
    }

    /// Create a logical device at `feature_level`
    pub fn create_device(&self, feature_level: FeatureLevel) -> Result<Device> {
        Device::create(self.info.clone(), feature_level, self.config.clone())
    }
}
