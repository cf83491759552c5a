//! # Built-in Kernels
//!
//! Kernels every reference device can resolve without registration.

use forge_core::{Error, Result};

use crate::kernel::{DeviceKernel, KernelContext};

/// Thread-group size of the identity shader
pub const IDENTITY_GROUP_SIZE: [u32; 3] = [32, 16, 1];

/// Elementwise copy `u1 = u0` over a `Channel x Height x Width` block
///
/// Root constants are `[height, width, channel]`. Thread `(x, y)` copies
/// element `c * H * W + x * W + y` for every channel `c`; threads outside
/// `H x W` do nothing. Matches `kernels/identity.hlsl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityShader;

impl DeviceKernel for IdentityShader {
    fn name(&self) -> &str {
        "identity"
    }

    fn execute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let height = ctx.constant(0)? as usize;
        let width = ctx.constant(1)? as usize;
        let channel = ctx.constant(2)? as usize;
        let [groups_x, groups_y, _] = ctx.thread_groups();

        let plane = height.checked_mul(width).ok_or(Error::InvalidSize)?;
        if plane.checked_mul(channel).is_none() {
            return Err(Error::InvalidSize);
        }

        let input = ctx.read_words(0)?;
        let output = ctx.view_words_mut(1)?;
        let rows = covered(groups_x, IDENTITY_GROUP_SIZE[0], height);
        let columns = covered(groups_y, IDENTITY_GROUP_SIZE[1], width);

        for x in 0..rows {
            for y in 0..columns {
                for c in 0..channel {
                    let index = c * plane + x * width + y;
                    if let (Some(src), Some(dst)) = (input.get(index), output.get_mut(index)) {
                        *dst = *src;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Extent of one dimension reached by `groups` groups of `group_size` threads
fn covered(groups: u32, group_size: u32, extent: usize) -> usize {
    (groups.saturating_mul(group_size) as usize).min(extent)
}
