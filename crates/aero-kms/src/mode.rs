//! Display mode timings and the mode blob encoding.

use crate::object::RefreshRange;
use crate::{KmsError, Result};

/// Number of `u32` fields in an encoded mode blob.
const MODE_BLOB_FIELDS: usize = 11;

/// Exact byte length of a mode blob passed with the `Mode` property.
pub const MODE_BLOB_LEN: usize = MODE_BLOB_FIELDS * 4;

/// Mode timing as programmed into a timing generator.
///
/// Horizontal values are in pixels, vertical values in lines, `clock_khz` is the pixel clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeTiming {
    pub clock_khz: u32,
    pub hdisplay: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub htotal: u32,
    pub vdisplay: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vtotal: u32,
    pub vrefresh: u32,
    pub flags: u32,
}

impl ModeTiming {
    /// Standard CEA 1920x1080@60 timing (148.5 MHz, 2200x1125 total).
    pub fn fhd_60() -> Self {
        Self {
            clock_khz: 148_500,
            hdisplay: 1920,
            hsync_start: 2008,
            hsync_end: 2052,
            htotal: 2200,
            vdisplay: 1080,
            vsync_start: 1084,
            vsync_end: 1089,
            vtotal: 1125,
            vrefresh: 60,
            flags: 0,
        }
    }

    /// 1280x720@60 (74.25 MHz, 1650x750 total).
    pub fn hd_60() -> Self {
        Self {
            clock_khz: 74_250,
            hdisplay: 1280,
            hsync_start: 1390,
            hsync_end: 1430,
            htotal: 1650,
            vdisplay: 720,
            vsync_start: 725,
            vsync_end: 730,
            vtotal: 750,
            vrefresh: 60,
            flags: 0,
        }
    }

    /// First line of the vertical blanking interval.
    pub fn vblank_start(&self) -> u32 {
        self.vdisplay
    }

    pub fn to_blob(&self) -> [u8; MODE_BLOB_LEN] {
        let fields = [
            self.clock_khz,
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vrefresh,
            self.flags,
        ];
        let mut out = [0u8; MODE_BLOB_LEN];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Decode and validate a mode blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != MODE_BLOB_LEN {
            return Err(KmsError::Invalid("mode blob length"));
        }
        let mut fields = [0u32; MODE_BLOB_FIELDS];
        for (field, chunk) in fields.iter_mut().zip(blob.chunks_exact(4)) {
            *field = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let mode = Self {
            clock_khz: fields[0],
            hdisplay: fields[1],
            hsync_start: fields[2],
            hsync_end: fields[3],
            htotal: fields[4],
            vdisplay: fields[5],
            vsync_start: fields[6],
            vsync_end: fields[7],
            vtotal: fields[8],
            vrefresh: fields[9],
            flags: fields[10],
        };
        mode.validate()?;
        Ok(mode)
    }

    fn validate(&self) -> Result<()> {
        let ordered = |a: u32, b: u32, c: u32, d: u32| a > 0 && a <= b && b <= c && c <= d;
        if self.clock_khz == 0
            || !ordered(self.hdisplay, self.hsync_start, self.hsync_end, self.htotal)
            || !ordered(self.vdisplay, self.vsync_start, self.vsync_end, self.vtotal)
        {
            return Err(KmsError::Invalid("mode timing"));
        }
        // Reserves one blanking line so "vtotal - 1" style arithmetic never underflows.
        if self.vtotal <= self.vdisplay {
            return Err(KmsError::Invalid("mode has no vertical blanking"));
        }
        Ok(())
    }

    /// Convert a duration in microseconds to a (rounded up) number of scanlines.
    pub fn usecs_to_scanlines(&self, usecs: u32) -> u32 {
        if self.htotal == 0 {
            return 1;
        }
        let lines = (u64::from(usecs) * u64::from(self.clock_khz))
            .div_ceil(1000 * u64::from(self.htotal));
        lines.min(u64::from(u32::MAX)) as u32
    }

    /// Compute the variable-refresh vtotal window for a sink's refresh range.
    pub fn vrr_timing(&self, range: RefreshRange) -> Option<VrrTiming> {
        if !range.is_vrr_capable() || self.htotal == 0 {
            return None;
        }
        let clock_hz = u64::from(self.clock_khz) * 1000;
        let htotal = u64::from(self.htotal);
        let vtotal = u64::from(self.vtotal);
        let min_div = htotal * u64::from(range.max_hz);
        let max_div = htotal * u64::from(range.min_hz);
        if min_div == 0 || max_div == 0 {
            return None;
        }
        let vmin = vtotal.max((clock_hz + min_div / 2) / min_div);
        let vmax = vtotal.max(clock_hz.div_ceil(max_div));
        Some(VrrTiming {
            vmin: vmin.min(u64::from(u32::MAX)) as u32,
            vmax: vmax.min(u64::from(u32::MAX)) as u32,
        })
    }
}

/// Variable-refresh vtotal window of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrrTiming {
    pub vmin: u32,
    pub vmax: u32,
}

impl VrrTiming {
    /// First vblank line of the shortest frame, keeping the fixed-mode blanking length.
    pub fn vmin_vblank_start(&self, mode: &ModeTiming) -> u32 {
        self.vmin
            .saturating_sub(mode.vtotal.saturating_sub(mode.vdisplay))
    }
}
