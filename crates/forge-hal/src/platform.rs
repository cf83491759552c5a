//! # Platform Abstraction
//!
//! Sources of adapters.
//!
//! A platform enumerates the adapters it can create devices on, in a stable
//! order. [`ReferencePlatform`] is the CPU-backed implementation: its
//! adapters create devices whose queues execute on a host timeline thread.

use forge_core::{ByteSize, Luid, Result};

use crate::adapter::{Adapter, AdapterAttributes, AdapterInfo};
use crate::device::DeviceConfig;

// =============================================================================
// PLATFORM TRAIT
// =============================================================================

/// Platform abstraction trait
pub trait Platform {
    /// Get platform name
    fn name(&self) -> &'static str;

    /// Enumerate adapters supporting every attribute in `required`
    ///
    /// Order is stable for the lifetime of the platform.
    fn enumerate_adapters(&self, required: AdapterAttributes) -> Result<Vec<Adapter>>;
}

// =============================================================================
// REFERENCE PLATFORM
// =============================================================================

/// CPU-backed platform
#[derive(Debug, Clone)]
pub struct ReferencePlatform {
    adapters: Vec<AdapterInfo>,
    config: DeviceConfig,
}

impl ReferencePlatform {
    /// Platform with the default adapter set
    pub fn new() -> Self {
        Self::with_adapters(default_adapters())
    }

    /// Platform with a caller-supplied ordered adapter set
    pub fn with_adapters(adapters: Vec<AdapterInfo>) -> Self {
        Self {
            adapters,
            config: DeviceConfig::default(),
        }
    }

    /// Replace the device configuration
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }
}

impl Default for ReferencePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for ReferencePlatform {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn enumerate_adapters(&self, required: AdapterAttributes) -> Result<Vec<Adapter>> {
        let adapters: Vec<Adapter> = self
            .adapters
            .iter()
            .filter(|info| info.supports(required))
            .map(|info| Adapter::new(info.clone(), self.config.clone()))
            .collect();
        log::debug!(
            "{} platform: {} of {} adapters support {:?}",
            self.name(),
            adapters.len(),
            self.adapters.len(),
            required
        );
        Ok(adapters)
    }
}

/// Adapters the reference platform ships with, in enumeration order
pub fn default_adapters() -> Vec<AdapterInfo> {
    vec![
        AdapterInfo {
            luid: Luid::new(0x0001_0000, 0),
            description: "Forge Reference Rasterizer".into(),
            is_hardware: false,
            attributes: AdapterAttributes::CORE_COMPUTE | AdapterAttributes::GRAPHICS,
            dedicated_memory: ByteSize::ZERO,
        },
        AdapterInfo {
            luid: Luid::new(0x0002_0000, 0),
            description: "Forge Virtual VPU".into(),
            is_hardware: true,
            attributes: AdapterAttributes::CORE_COMPUTE | AdapterAttributes::GENERIC_ML,
            dedicated_memory: ByteSize::from_mib(512),
        },
        AdapterInfo {
            luid: Luid::new(0x0003_0000, 0),
            description: "Forge Virtual GPU".into(),
            is_hardware: true,
            attributes: AdapterAttributes::CORE_COMPUTE
                | AdapterAttributes::GENERIC_ML
                | AdapterAttributes::GRAPHICS,
            dedicated_memory: ByteSize::from_mib(2048),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_enumeration_order() {
        let platform = ReferencePlatform::new();
        let adapters = platform
            .enumerate_adapters(AdapterAttributes::CORE_COMPUTE)
            .expect("enumerate");
        let names: Vec<&str> = adapters.iter().map(Adapter::description).collect();
        assert_eq!(
            names,
            ["Forge Reference Rasterizer", "Forge Virtual VPU", "Forge Virtual GPU"]
        );
    }

    #[test]
    fn test_attribute_filter() {
        let platform = ReferencePlatform::new();
        let graphics = platform
            .enumerate_adapters(AdapterAttributes::GRAPHICS)
            .expect("enumerate");
        assert_eq!(graphics.len(), 2);
        assert!(!graphics[0].is_hardware());
    }
}
