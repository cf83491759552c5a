//! # Adapter Selection
//!
//! Picks one adapter from a platform's enumeration and creates the logical
//! device on it. The first adapter in enumeration order that satisfies the
//! policy wins, so selection is deterministic for a fixed platform.

use forge_core::{Error, Result};

use crate::adapter::{Adapter, AdapterAttributes};
use crate::device::{Device, FeatureLevel};
use crate::platform::Platform;

/// Adapter selection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterPolicy {
    /// Hardware adapter whose description contains the name
    /// (case-insensitive); device created at [`FeatureLevel::Core1_0`]
    NamedClass(String),
    /// Hardware adapter with graphics; device created at
    /// [`FeatureLevel::Level11_0`]
    GraphicsHardware,
}

impl AdapterPolicy {
    /// Check whether an adapter satisfies the policy
    pub fn matches(&self, adapter: &Adapter) -> bool {
        if !adapter.is_hardware() {
            return false;
        }
        match self {
            AdapterPolicy::NamedClass(name) => adapter
                .description()
                .to_lowercase()
                .contains(&name.to_lowercase()),
            AdapterPolicy::GraphicsHardware => {
                adapter.info().supports(AdapterAttributes::GRAPHICS)
            }
        }
    }

    /// Feature level devices are created at under this policy
    pub fn feature_level(&self) -> FeatureLevel {
        match self {
            AdapterPolicy::NamedClass(_) => FeatureLevel::Core1_0,
            AdapterPolicy::GraphicsHardware => FeatureLevel::Level11_0,
        }
    }
}

/// Find the first adapter satisfying `policy`
pub fn select_adapter<'a>(adapters: &'a [Adapter], policy: &AdapterPolicy) -> Result<&'a Adapter> {
    adapters
        .iter()
        .find(|adapter| policy.matches(adapter))
        .ok_or_else(|| {
            log::error!("no adapter matches {:?}", policy);
            Error::NoMatchingAdapter
        })
}

/// Enumerate compute adapters, select one and create its device
pub fn select_device(platform: &dyn Platform, policy: &AdapterPolicy) -> Result<Device> {
    let adapters = platform.enumerate_adapters(AdapterAttributes::CORE_COMPUTE)?;
    let adapter = select_adapter(&adapters, policy)?;
    log::info!("Use adapter : {}", adapter.description());
    adapter.create_device(policy.feature_level())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterInfo;
    use crate::platform::ReferencePlatform;
    use forge_core::{ByteSize, Luid};

    fn adapter(low: u32, description: &str, hardware: bool, attributes: AdapterAttributes) -> AdapterInfo {
        AdapterInfo {
            luid: Luid::new(low, 0),
            description: description.into(),
            is_hardware: hardware,
            attributes: AdapterAttributes::CORE_COMPUTE | attributes,
            dedicated_memory: ByteSize::ZERO,
        }
    }

    #[test]
    fn test_named_class_case_insensitive() {
        let device = select_device(
            &ReferencePlatform::new(),
            &AdapterPolicy::NamedClass("vpu".into()),
        )
        .expect("select");
        assert_eq!(device.adapter().description, "Forge Virtual VPU");
        assert_eq!(device.feature_level(), FeatureLevel::Core1_0);
    }

    #[test]
    fn test_graphics_hardware_skips_software() {
        let device = select_device(&ReferencePlatform::new(), &AdapterPolicy::GraphicsHardware)
            .expect("select");
        assert_eq!(device.adapter().description, "Forge Virtual GPU");
        assert_eq!(device.feature_level(), FeatureLevel::Level11_0);
    }

    #[test]
    fn test_named_class_requires_hardware() {
        let platform = ReferencePlatform::with_adapters(vec![adapter(
            1,
            "Software VPU",
            false,
            AdapterAttributes::GENERIC_ML,
        )]);
        assert_eq!(
            select_device(&platform, &AdapterPolicy::NamedClass("VPU".into())).map(|_| ()),
            Err(Error::NoMatchingAdapter)
        );
    }

    #[test]
    fn test_first_match_wins() {
        let platform = ReferencePlatform::with_adapters(vec![
            adapter(1, "Alpha GPU", true, AdapterAttributes::GRAPHICS),
            adapter(2, "Beta GPU", true, AdapterAttributes::GRAPHICS),
        ]);
        for _ in 0..3 {
            let device =
                select_device(&platform, &AdapterPolicy::GraphicsHardware).expect("select");
            assert_eq!(device.adapter().luid, Luid::new(1, 0));
        }
    }

    #[test]
    fn test_compute_filter_applies_first() {
        let mut graphics_only = adapter(1, "Display GPU", true, AdapterAttributes::GRAPHICS);
        graphics_only.attributes = AdapterAttributes::GRAPHICS;
        let platform = ReferencePlatform::with_adapters(vec![graphics_only]);
        assert_eq!(
            select_device(&platform, &AdapterPolicy::GraphicsHardware).map(|_| ()),
            Err(Error::NoMatchingAdapter)
        );
    }
}
