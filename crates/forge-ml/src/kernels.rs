//! # Operator Kernels
//!
//! Device code for compiled operators and initializers. Slot numbers are
//! positions in the dispatch's descriptor table, fixed at compile time.

use forge_core::{Error, Result};
use forge_hal::{DeviceKernel, KernelContext};

use crate::operator::ConvolutionMode;
use crate::tensor::Dimensions;

// =============================================================================
// IDENTITY
// =============================================================================

#[derive(Debug, Clone)]
enum IdentityPlan {
    /// Both tensors packed: one byte copy
    Packed { bytes: u64 },
    /// Element copy through strides, 32-bit elements
    Strided {
        sizes: Dimensions,
        input_strides: Dimensions,
        output_strides: Dimensions,
    },
}

/// `output = input`
#[derive(Debug, Clone)]
pub(crate) struct IdentityKernel {
    plan: IdentityPlan,
}

impl IdentityKernel {
    const INPUT: u32 = 0;
    const OUTPUT: u32 = 1;

    pub(crate) fn packed(bytes: u64) -> Self {
        Self {
            plan: IdentityPlan::Packed { bytes },
        }
    }

    pub(crate) fn strided(
        sizes: Dimensions,
        input_strides: Dimensions,
        output_strides: Dimensions,
    ) -> Self {
        Self {
            plan: IdentityPlan::Strided {
                sizes,
                input_strides,
                output_strides,
            },
        }
    }
}

impl DeviceKernel for IdentityKernel {
    fn name(&self) -> &str {
        "forge.identity"
    }

    fn execute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        match &self.plan {
            IdentityPlan::Packed { bytes } => {
                let input = ctx.view_bytes(Self::INPUT)?;
                let len = *bytes as usize;
                if input.len() < len {
                    return Err(Error::BufferOverflow);
                }
                let data = input[..len].to_vec();
                ctx.write_bytes(Self::OUTPUT, &data)
            }
            IdentityPlan::Strided {
                sizes,
                input_strides,
                output_strides,
            } => {
                let input = ctx.read_words(Self::INPUT)?;
                let output = ctx.view_words_mut(Self::OUTPUT)?;
                for_each_index(sizes, |index| {
                    let src = linear_offset(index, input_strides);
                    let dst = linear_offset(index, output_strides);
                    match (input.get(src), output.get_mut(dst)) {
                        (Some(&value), Some(slot)) => {
                            *slot = value;
                            Ok(())
                        }
                        _ => Err(Error::BufferOverflow),
                    }
                })
            }
        }
    }
}

fn linear_offset(index: &[u32], strides: &[u32]) -> usize {
    index
        .iter()
        .zip(strides)
        .map(|(&i, &s)| i as usize * s as usize)
        .sum()
}

/// Visit every multi-index of `sizes` in row-major order
fn for_each_index(sizes: &[u32], mut f: impl FnMut(&[u32]) -> Result<()>) -> Result<()> {
    if sizes.iter().any(|&s| s == 0) {
        return Ok(());
    }
    let mut index: Dimensions = sizes.iter().map(|_| 0).collect();
    loop {
        f(&index)?;
        let mut dim = sizes.len();
        loop {
            if dim == 0 {
                return Ok(());
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < sizes[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

// =============================================================================
// CONVOLUTION
// =============================================================================

/// Shape of a 2D convolution, NCHW
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub(crate) batch: usize,
    pub(crate) channels: usize,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) filters: usize,
    pub(crate) groups: usize,
    pub(crate) kernel: [usize; 2],
    pub(crate) output: [usize; 2],
    pub(crate) strides: [usize; 2],
    pub(crate) dilations: [usize; 2],
    pub(crate) start_padding: [usize; 2],
}

impl ConvGeometry {
    fn group_channels(&self) -> usize {
        self.channels / self.groups
    }

    fn group_filters(&self) -> usize {
        self.filters / self.groups
    }

    fn taps(&self) -> usize {
        self.group_channels() * self.kernel[0] * self.kernel[1]
    }

    fn output_pixels(&self) -> usize {
        self.output[0] * self.output[1]
    }

    /// Filter elements
    pub(crate) fn filter_len(&self) -> usize {
        self.filters * self.taps()
    }

    /// Elements of one group's column matrix
    pub(crate) fn column_len(&self) -> usize {
        self.taps() * self.output_pixels()
    }

    fn input_len(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    fn output_len(&self) -> usize {
        self.batch * self.filters * self.output_pixels()
    }

    /// Input coordinate a tap reads, or `None` inside the padding
    fn source(&self, axis: usize, out: usize, tap: usize) -> Option<usize> {
        let pos = out * self.strides[axis] + tap * self.dilations[axis];
        let extent = if axis == 0 { self.height } else { self.width };
        pos.checked_sub(self.start_padding[axis])
            .filter(|&p| p < extent)
    }
}

/// Where a weight tensor comes from at execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WeightSource {
    /// No tensor; contributes zero
    Absent,
    /// Bound directly at a table slot
    Slot(u32),
    /// Packed into the persistent resource at an element offset
    Persistent { slot: u32, offset: usize },
}

/// Table slots of the convolution kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvolutionSlots {
    pub(crate) input: u32,
    pub(crate) output: u32,
    /// Column scratch; direct evaluation when absent
    pub(crate) temporary: Option<u32>,
}

/// 2D convolution, float32
#[derive(Debug, Clone)]
pub(crate) struct ConvolutionKernel {
    geometry: ConvGeometry,
    mode: ConvolutionMode,
    slots: ConvolutionSlots,
    filter: WeightSource,
    bias: WeightSource,
}

impl ConvolutionKernel {
    pub(crate) fn new(
        geometry: ConvGeometry,
        mode: ConvolutionMode,
        slots: ConvolutionSlots,
        filter: WeightSource,
        bias: WeightSource,
    ) -> Self {
        Self {
            geometry,
            mode,
            slots,
            filter,
            bias,
        }
    }

    fn load(ctx: &KernelContext<'_>, source: WeightSource, len: usize) -> Result<Vec<f32>> {
        let (data, offset) = match source {
            WeightSource::Absent => return Ok(vec![0.0; len]),
            WeightSource::Slot(slot) => (ctx.read_f32(slot)?, 0),
            WeightSource::Persistent { slot, offset } => (ctx.read_f32(slot)?, offset),
        };
        data.get(offset..offset + len)
            .map(<[f32]>::to_vec)
            .ok_or(Error::BufferOverflow)
    }

    /// Weight of filter `k` at channel-in-group `c`, tap `(i, j)`
    fn weight(&self, filter: &[f32], k: usize, c: usize, i: usize, j: usize) -> f32 {
        let g = &self.geometry;
        let [kh, kw] = g.kernel;
        let (i, j) = match self.mode {
            ConvolutionMode::CrossCorrelation => (i, j),
            ConvolutionMode::Convolution => (kh - 1 - i, kw - 1 - j),
        };
        filter[((k * g.group_channels() + c) * kh + i) * kw + j]
    }

    fn input_at(&self, input: &[f32], b: usize, channel: usize, y: usize, x: usize) -> f32 {
        let g = &self.geometry;
        input[((b * g.channels + channel) * g.height + y) * g.width + x]
    }

    fn direct(&self, input: &[f32], filter: &[f32], bias: &[f32], out: &mut [f32]) {
        let g = self.geometry;
        let [kh, kw] = g.kernel;
        let [oh, ow] = g.output;
        for b in 0..g.batch {
            for k in 0..g.filters {
                let group = k / g.group_filters();
                for y in 0..oh {
                    for x in 0..ow {
                        let mut acc = 0.0f32;
                        for c in 0..g.group_channels() {
                            let channel = group * g.group_channels() + c;
                            for i in 0..kh {
                                let Some(sy) = g.source(0, y, i) else { continue };
                                for j in 0..kw {
                                    let Some(sx) = g.source(1, x, j) else { continue };
                                    acc += self.input_at(input, b, channel, sy, sx)
                                        * self.weight(filter, k, c, i, j);
                                }
                            }
                        }
                        out[((b * g.filters + k) * oh + y) * ow + x] = acc + bias[k];
                    }
                }
            }
        }
    }

    fn im2col(
        &self,
        ctx: &mut KernelContext<'_>,
        slot: u32,
        input: &[f32],
        filter: &[f32],
        bias: &[f32],
        out: &mut [f32],
    ) -> Result<()> {
        let g = self.geometry;
        let [kh, kw] = g.kernel;
        let [oh, ow] = g.output;
        let pixels = g.output_pixels();
        let taps = g.taps();

        let columns = ctx.view_f32_mut(slot)?;
        if columns.len() < g.column_len() {
            return Err(Error::BufferOverflow);
        }

        for b in 0..g.batch {
            for group in 0..g.groups {
                // Unfold the group's receptive fields, one column per pixel
                for c in 0..g.group_channels() {
                    let channel = group * g.group_channels() + c;
                    for i in 0..kh {
                        for j in 0..kw {
                            let row = (c * kh + i) * kw + j;
                            for y in 0..oh {
                                for x in 0..ow {
                                    let value = match (g.source(0, y, i), g.source(1, x, j)) {
                                        (Some(sy), Some(sx)) => {
                                            self.input_at(input, b, channel, sy, sx)
                                        }
                                        _ => 0.0,
                                    };
                                    columns[row * pixels + y * ow + x] = value;
                                }
                            }
                        }
                    }
                }

                for k in group * g.group_filters()..(group + 1) * g.group_filters() {
                    for p in 0..pixels {
                        let mut acc = 0.0f32;
                        for row in 0..taps {
                            let c = row / (kh * kw);
                            let i = (row / kw) % kh;
                            let j = row % kw;
                            acc += columns[row * pixels + p] * self.weight(filter, k, c, i, j);
                        }
                        out[(b * g.filters + k) * pixels + p] = acc + bias[k];
                    }
                }
            }
        }
        Ok(())
    }
}

impl DeviceKernel for ConvolutionKernel {
    fn name(&self) -> &str {
        "forge.convolution"
    }

    fn execute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let g = self.geometry;
        let input = ctx.read_f32(self.slots.input)?;
        if input.len() < g.input_len() {
            return Err(Error::BufferOverflow);
        }
        let filter = Self::load(ctx, self.filter, g.filter_len())?;
        let bias = Self::load(ctx, self.bias, g.filters)?;

        let mut out = vec![0.0f32; g.output_len()];
        match self.slots.temporary {
            Some(slot) => self.im2col(ctx, slot, &input, &filter, &bias, &mut out)?,
            None => self.direct(&input, &filter, &bias, &mut out),
        }
        ctx.write_f32(self.slots.output, &out)
    }
}

// =============================================================================
// INITIALIZER
// =============================================================================

/// One operator's weights to pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PackEntry {
    pub(crate) filter_slot: u32,
    pub(crate) filter_len: usize,
    pub(crate) bias: Option<(u32, usize)>,
    pub(crate) output_slot: u32,
}

/// Copies owned weights into persistent resources
#[derive(Debug, Clone, Default)]
pub(crate) struct InitializerKernel {
    entries: Vec<PackEntry>,
}

impl InitializerKernel {
    pub(crate) fn new(entries: Vec<PackEntry>) -> Self {
        Self { entries }
    }
}

fn prefix(mut data: Vec<f32>, len: usize) -> Result<Vec<f32>> {
    if data.len() < len {
        return Err(Error::BufferOverflow);
    }
    data.truncate(len);
    Ok(data)
}

impl DeviceKernel for InitializerKernel {
    fn name(&self) -> &str {
        "forge.initializer"
    }

    fn execute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        for entry in &self.entries {
            let mut packed = prefix(ctx.read_f32(entry.filter_slot)?, entry.filter_len)?;
            if let Some((slot, len)) = entry.bias {
                packed.extend(prefix(ctx.read_f32(slot)?, len)?);
            }
            ctx.write_f32(entry.output_slot, &packed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_each_index_row_major() {
        let mut seen = Vec::new();
        for_each_index(&[2, 3], |index| {
            seen.push((index[0], index[1]));
            Ok(())
        })
        .expect("visit");
        assert_eq!(seen, [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_source_respects_padding() {
        let g = ConvGeometry {
            batch: 1,
            channels: 1,
            height: 4,
            width: 4,
            filters: 1,
            groups: 1,
            kernel: [3, 3],
            output: [4, 4],
            strides: [1, 1],
            dilations: [1, 1],
            start_padding: [1, 1],
        };
        assert_eq!(g.source(0, 0, 0), None);
        assert_eq!(g.source(0, 0, 1), Some(0));
        assert_eq!(g.source(0, 3, 2), None);
        assert_eq!(g.column_len(), 9 * 16);
    }
}
