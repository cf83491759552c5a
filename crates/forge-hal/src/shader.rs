//! # Shader Bytecode
//!
//! Compiled kernel artifacts and the registry that maps them to device
//! kernels.
//!
//! Bytecode is an opaque blob loaded from `<dir>/<name>.cso`. The reference
//! device does not interpret the blob: it resolves the pipeline kernel by the
//! artifact name.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;

use forge_core::{Error, Result};

use crate::builtin::IdentityShader;
use crate::kernel::DeviceKernel;

/// Compiled shader extension
pub const BYTECODE_EXTENSION: &str = "cso";

// =============================================================================
// BYTECODE
// =============================================================================

/// Compiled compute shader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBytecode {
    name: String,
    blob: Vec<u8>,
}

impl ShaderBytecode {
    /// Wrap an in-memory blob
    pub fn from_blob(name: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            blob,
        }
    }

    /// Read `<dir>/<name>.cso`
    pub fn load(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = dir
            .as_ref()
            .join(name)
            .with_extension(BYTECODE_EXTENSION);
        match std::fs::read(&path) {
            Ok(blob) => {
                log::debug!("loaded {} ({} bytes)", path.display(), blob.len());
                Ok(Self::from_blob(name, blob))
            }
            Err(e) => {
                log::error!("cannot read {}: {}", path.display(), e);
                Err(Error::KernelArtifactUnreadable)
            }
        }
    }

    /// Artifact name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw blob
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }
}

// =============================================================================
// KERNEL REGISTRY
// =============================================================================

/// Kernels a device can build pipelines for
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn DeviceKernel>>,
}

impl KernelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in kernels
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IdentityShader));
        registry
    }

    /// Register a kernel under its name, replacing any previous one
    pub fn register(&mut self, kernel: Arc<dyn DeviceKernel>) {
        log::debug!("register kernel '{}'", kernel.name());
        self.kernels.insert(kernel.name().to_owned(), kernel);
    }

    /// Look up a kernel by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceKernel>> {
        self.kernels.get(name).cloned()
    }

    /// Resolve the kernel for a bytecode artifact
    pub fn resolve(&self, bytecode: &ShaderBytecode) -> Result<Arc<dyn DeviceKernel>> {
        if bytecode.blob.is_empty() {
            log::error!("shader '{}' has an empty blob", bytecode.name);
            return Err(Error::InvalidBytecode);
        }
        self.get(&bytecode.name).ok_or_else(|| {
            log::error!("no kernel registered for shader '{}'", bytecode.name);
            Error::KernelNotFound
        })
    }

    /// Number of registered kernels
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Check for an empty registry
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
