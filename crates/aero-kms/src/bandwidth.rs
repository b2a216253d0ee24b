//! Aggregate memory bandwidth bookkeeping.
//!
//! Every pipe contributes the data rate of its visible planes. The sum across all pipes is
//! checked against the platform limit for the total number of active planes.

use tracing::debug;

use crate::hw::HardwareOps;
use crate::mode::ModeTiming;
use crate::state::PipeState;
use crate::{KmsError, Result};

/// Data rate of one plane in kB/s.
///
/// Downscaling fetches more source pixels per output pixel, so the rate grows with the
/// source/destination area ratio. Upscaling never lowers it below one source pixel per output
/// pixel.
pub fn plane_data_rate(
    mode: &ModeTiming,
    bytes_per_pixel: u32,
    src: (u32, u32),
    dst: (u32, u32),
) -> u64 {
    let dst_area = u128::from(dst.0) * u128::from(dst.1);
    if dst_area == 0 {
        return 0;
    }
    let src_area = u128::from(src.0) * u128::from(src.1);
    let base = u128::from(mode.clock_khz) * u128::from(bytes_per_pixel);
    let rate = if src_area > dst_area {
        (base * src_area).div_ceil(dst_area)
    } else {
        base
    };
    rate.min(u128::from(u64::MAX)) as u64
}

/// Per-pipe data rate and active plane count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthState {
    pub data_rate: Vec<u64>,
    pub active_planes: Vec<u32>,
}

impl BandwidthState {
    pub fn new(pipes: usize) -> Self {
        Self {
            data_rate: vec![0; pipes],
            active_planes: vec![0; pipes],
        }
    }

    /// Record the contribution of `pipe`.
    pub fn update(&mut self, pipe: &PipeState) {
        let index = pipe.id.index();
        if let Some(rate) = self.data_rate.get_mut(index) {
            *rate = pipe.data_rate();
        }
        if let Some(planes) = self.active_planes.get_mut(index) {
            *planes = pipe.active_plane_count();
        }
    }

    /// Total data rate in kB/s.
    pub fn total_data_rate(&self) -> u64 {
        self.data_rate.iter().sum()
    }

    pub fn total_active_planes(&self) -> u32 {
        self.active_planes.iter().sum()
    }
}

/// Reject `new` if its aggregate rate exceeds what the platform supports for its plane count.
///
/// An unchanged state is not checked again, even if the limit would now reject it.
pub fn check(hw: &dyn HardwareOps, old: &BandwidthState, new: &BandwidthState) -> Result<()> {
    if old == new {
        return Ok(());
    }

    let active_planes = new.total_active_planes();
    let required = new.total_data_rate().div_ceil(1000);
    let available = hw.max_data_rate(active_planes);
    debug!(required, available, active_planes, "bandwidth check");

    if required > u64::from(available) {
        return Err(KmsError::Bandwidth {
            required: required.min(u64::from(u32::MAX)) as u32,
            available,
            active_planes,
        });
    }
    Ok(())
}
