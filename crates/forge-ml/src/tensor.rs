//! # Tensor Descriptors
//!
//! Data types, dimensions, strides and the byte-size rules buffers are
//! allocated by.

use arrayvec::ArrayVec;

use forge_core::{checked_align_up, CompileError, Error, Result};

/// Maximum tensor rank
pub const MAX_DIMENSIONS: usize = 8;

/// Largest byte size a tensor may describe
pub const MAX_TENSOR_BYTES: u64 = isize::MAX as u64;

/// Fixed-capacity dimension list
pub type Dimensions = ArrayVec<u32, MAX_DIMENSIONS>;

// =============================================================================
// DATA TYPE
// =============================================================================

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Not specified
    Unknown,
    /// IEEE 754 single precision
    Float32,
    /// IEEE 754 half precision
    Float16,
    /// Unsigned 32-bit integer
    UInt32,
    /// Unsigned 16-bit integer
    UInt16,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 32-bit integer
    Int32,
    /// Signed 16-bit integer
    Int16,
    /// Signed 8-bit integer
    Int8,
}

impl DataType {
    /// Element size in bytes; 0 for `Unknown`
    pub const fn size_bytes(self) -> u64 {
        match self {
            DataType::Unknown => 0,
            DataType::Float32 | DataType::UInt32 | DataType::Int32 => 4,
            DataType::Float16 | DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt8 | DataType::Int8 => 1,
        }
    }

    /// Check for a 32-bit element type
    pub const fn is_32bit(self) -> bool {
        self.size_bytes() == 4
    }
}

bitflags::bitflags! {
    /// Tensor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TensorFlags: u32 {
        /// Contents are handed to the runtime once, at initialization
        const OWNED_BY_RUNTIME = 1 << 0;
    }
}

// =============================================================================
// SIZING
// =============================================================================

/// Minimum buffer size for a tensor, in bytes
///
/// Without strides: `round_up_4(product(sizes) * element_size)`.
/// With strides: `round_up_4((sum((size_i - 1) * stride_i) + 1) * element_size)`.
/// `None` when the size does not fit in a `u64`.
pub fn tensor_byte_size(
    data_type: DataType,
    sizes: &[u32],
    strides: Option<&[u32]>,
) -> Option<u64> {
    let elements = match strides {
        None => element_product(sizes)?,
        Some(_) if sizes.contains(&0) => 0,
        Some(strides) => sizes
            .iter()
            .zip(strides)
            .try_fold(1u64, |span, (&size, &stride)| {
                span.checked_add((size as u64 - 1).checked_mul(stride as u64)?)
            })?,
    };
    checked_align_up(elements.checked_mul(data_type.size_bytes())?, 4)
}

fn element_product(sizes: &[u32]) -> Option<u64> {
    sizes
        .iter()
        .try_fold(1u64, |count, &size| count.checked_mul(size as u64))
}

/// Row-major strides for `sizes`
pub fn default_strides(sizes: &[u32]) -> Dimensions {
    let mut strides: Dimensions = sizes.iter().take(MAX_DIMENSIONS).map(|_| 0).collect();
    let mut stride = 1u32;
    for (out, &size) in strides.iter_mut().zip(sizes).rev() {
        *out = stride;
        stride = stride.saturating_mul(size);
    }
    strides
}

// =============================================================================
// TENSOR DESCRIPTOR
// =============================================================================

/// Buffer tensor description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    /// Element type
    pub data_type: DataType,
    /// Dimension sizes, outermost first
    pub sizes: Dimensions,
    /// Element strides, or packed row-major when `None`
    pub strides: Option<Dimensions>,
    /// Flags
    pub flags: TensorFlags,
}

impl TensorDesc {
    /// Describe a packed tensor
    pub fn new(data_type: DataType, sizes: &[u32]) -> Result<Self> {
        Ok(Self {
            data_type,
            sizes: to_dimensions(sizes)?,
            strides: None,
            flags: TensorFlags::empty(),
        })
    }

    /// Set explicit element strides
    pub fn with_strides(mut self, strides: &[u32]) -> Result<Self> {
        self.strides = Some(to_dimensions(strides)?);
        Ok(self)
    }

    /// Replace the flags
    pub fn with_flags(mut self, flags: TensorFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Mark the tensor as owned by the runtime
    pub fn owned_by_runtime(self) -> Self {
        let flags = self.flags | TensorFlags::OWNED_BY_RUNTIME;
        self.with_flags(flags)
    }

    /// Check the owned-by-runtime flag
    pub fn is_owned_by_runtime(&self) -> bool {
        self.flags.contains(TensorFlags::OWNED_BY_RUNTIME)
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Number of logical elements
    ///
    /// Saturates at `u64::MAX`; [`validate`](Self::validate) rejects such
    /// tensors.
    pub fn element_count(&self) -> u64 {
        element_product(&self.sizes).unwrap_or(u64::MAX)
    }

    /// Minimum buffer size in bytes, saturating like
    /// [`element_count`](Self::element_count)
    pub fn byte_size(&self) -> u64 {
        tensor_byte_size(self.data_type, &self.sizes, self.strides.as_deref())
            .unwrap_or(u64::MAX)
    }

    /// Effective strides, packed when none were given
    pub fn effective_strides(&self) -> Dimensions {
        match &self.strides {
            Some(strides) => strides.clone(),
            None => default_strides(&self.sizes),
        }
    }

    /// Check for packed row-major layout
    pub fn is_packed(&self) -> bool {
        match &self.strides {
            None => true,
            Some(strides) => *strides == default_strides(&self.sizes),
        }
    }

    /// Structural checks shared by every operator
    pub fn validate(&self) -> core::result::Result<(), CompileError> {
        if self.sizes.is_empty() {
            return Err(CompileError::InvalidRank);
        }
        if self.sizes.iter().any(|&s| s == 0) {
            return Err(CompileError::ZeroExtent);
        }
        if let Some(strides) = &self.strides {
            if strides.len() != self.sizes.len() {
                return Err(CompileError::StrideCountMismatch);
            }
        }
        if self.data_type == DataType::Unknown {
            return Err(CompileError::UnknownDataType);
        }
        // Both the logical extent and the strided span must be addressable
        let logical = element_product(&self.sizes)
            .and_then(|count| count.checked_mul(self.data_type.size_bytes()));
        let span = tensor_byte_size(self.data_type, &self.sizes, self.strides.as_deref());
        let fits = |bytes: Option<u64>| bytes.map_or(false, |b| b <= MAX_TENSOR_BYTES);
        if !fits(logical) || !fits(span) {
            return Err(CompileError::TensorTooLarge);
        }
        Ok(())
    }
}

fn to_dimensions(values: &[u32]) -> Result<Dimensions> {
    Dimensions::try_from(values).map_err(|_| Error::Compilation(CompileError::InvalidRank))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstrided_size() {
        assert_eq!(tensor_byte_size(DataType::Float32, &[1, 2, 3, 4], None), Some(96));
        assert_eq!(tensor_byte_size(DataType::Float16, &[3], None), Some(8));
        assert_eq!(tensor_byte_size(DataType::UInt8, &[5], None), Some(8));
        assert_eq!(tensor_byte_size(DataType::Unknown, &[7, 7], None), Some(0));
    }

    #[test]
    fn test_default_strides_match_packed_size() {
        let cases: [&[u32]; 4] = [&[1, 2, 3, 4], &[7], &[3, 1, 5], &[2, 2, 2, 2, 2, 2, 2, 2]];
        for sizes in cases {
            for data_type in [DataType::Float32, DataType::Float16, DataType::Int8] {
                let strides = default_strides(sizes);
                assert_eq!(
                    tensor_byte_size(data_type, sizes, Some(strides.as_slice())),
                    tensor_byte_size(data_type, sizes, None),
                    "{:?} {:?}",
                    sizes,
                    data_type
                );
            }
        }
    }

    #[test]
    fn test_padded_strides() {
        // Rows padded to 8 elements
        let size = tensor_byte_size(DataType::Float32, &[3, 5], Some(&[8, 1][..]));
        assert_eq!(size, Some((2 * 8 + 4 + 1) * 4));
    }

    #[test]
    fn test_size_overflow() {
        let huge = [65536u32; 8];
        assert_eq!(tensor_byte_size(DataType::Float32, &huge, None), None);
        assert_eq!(
            tensor_byte_size(DataType::Float32, &[3, 3], Some(&[u32::MAX, u32::MAX][..])),
            Some((2 * 2 * u32::MAX as u64 + 1) * 4)
        );
        assert_eq!(
            tensor_byte_size(DataType::Int8, &[u32::MAX; 4], Some(&[u32::MAX; 4][..])),
            None
        );

        let t = TensorDesc::new(DataType::Float32, &huge).expect("desc");
        assert_eq!(t.element_count(), u64::MAX);
        assert_eq!(t.byte_size(), u64::MAX);
        assert_eq!(t.validate(), Err(CompileError::TensorTooLarge));

        // Fits in u64 elements, not in addressable bytes
        let wide = TensorDesc::new(DataType::Float32, &[u32::MAX, u32::MAX]).expect("desc");
        assert_eq!(wide.validate(), Err(CompileError::TensorTooLarge));

        // Broadcast strides keep the span small but not the element count
        let broadcast = t.with_strides(&[0; 8]).expect("strides");
        assert_eq!(broadcast.byte_size(), 4);
        assert_eq!(broadcast.validate(), Err(CompileError::TensorTooLarge));
    }

    #[test]
    fn test_default_strides() {
        assert_eq!(default_strides(&[1, 2, 3, 4]).as_slice(), &[24, 12, 4, 1]);
    }

    #[test]
    fn test_rank_limits() {
        assert_eq!(
            TensorDesc::new(DataType::Float32, &[1; 9]).map(|_| ()),
            Err(Error::Compilation(CompileError::InvalidRank))
        );
        let empty = TensorDesc::new(DataType::Float32, &[]).expect("desc");
        assert_eq!(empty.validate(), Err(CompileError::InvalidRank));
    }

    #[test]
    fn test_validate() {
        let zero = TensorDesc::new(DataType::Float32, &[1, 0]).expect("desc");
        assert_eq!(zero.validate(), Err(CompileError::ZeroExtent));

        let strided = TensorDesc::new(DataType::Float32, &[2, 2])
            .and_then(|t| t.with_strides(&[2]))
            .expect("desc");
        assert_eq!(strided.validate(), Err(CompileError::StrideCountMismatch));

        let unknown = TensorDesc::new(DataType::Unknown, &[2]).expect("desc");
        assert_eq!(unknown.validate(), Err(CompileError::UnknownDataType));
    }

    #[test]
    fn test_packed_detection() {
        let t = TensorDesc::new(DataType::Float32, &[2, 3])
            .and_then(|t| t.with_strides(&[3, 1]))
            .expect("desc");
        assert!(t.is_packed());
        let t = t.with_strides(&[1, 2]).expect("desc");
        assert!(!t.is_packed());
        assert!(TensorDesc::new(DataType::Float32, &[2])
            .expect("desc")
            .owned_by_runtime()
            .is_owned_by_runtime());
    }
}
