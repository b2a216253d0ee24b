//! Frame counters, scanline reads and vblank evasion.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::hw::HardwareOps;
use crate::mode::ModeTiming;
use crate::object::{PipeId, MAX_PIPES};
use crate::regs::counter;
use crate::state::PipeState;

/// Hardware frame counter encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCounterStyle {
    /// 24-bit counter split over two registers that must be sampled twice.
    Legacy24,
    /// Single 32-bit counter that increments at vblank start.
    Wide32,
}

impl FrameCounterStyle {
    pub fn mask(self) -> u32 {
        match self {
            FrameCounterStyle::Legacy24 => 0x00ff_ffff,
            FrameCounterStyle::Wide32 => u32::MAX,
        }
    }

    /// Frame count at which a write armed during frame `count` becomes visible.
    pub fn next(self, count: u32) -> u32 {
        count.wrapping_add(1) & self.mask()
    }

    /// Wrap-safe `current >= target`.
    pub fn passed(self, current: u32, target: u32) -> bool {
        let sign = match self {
            FrameCounterStyle::Legacy24 => 0x0080_0000,
            FrameCounterStyle::Wide32 => 0x8000_0000,
        };
        current.wrapping_sub(target) & sign == 0
    }
}

/// Scanout timing the flip path needs for a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutTiming {
    pub mode: ModeTiming,
    /// Total lines of the current frame (the VRR maximum when variable refresh is on).
    pub vtotal: u32,
    pub vrr_active: bool,
}

impl ScanoutTiming {
    /// Timing of an enabled pipe, `None` when it is disabled.
    pub fn of(pipe: &PipeState) -> Option<Self> {
        Some(Self {
            mode: pipe.mode?,
            vtotal: pipe.effective_vtotal()?,
            vrr_active: pipe.vrr_enabled && pipe.vrr.is_some(),
        })
    }
}

/// Translate a raw hardware scanline into the logical scanline.
pub fn hw_to_scanline(dsl: u32, vtotal: u32, offset: u32) -> u32 {
    if vtotal == 0 {
        return dsl;
    }
    (dsl + offset) % vtotal
}

/// Translate a logical scanline into the hardware scanline the counter will report.
pub fn scanline_to_hw(scanline: i32, vtotal: u32, offset: u32) -> u32 {
    if vtotal == 0 {
        return scanline.max(0) as u32;
    }
    let vtotal = i64::from(vtotal);
    (i64::from(scanline) + vtotal - i64::from(offset)).rem_euclid(vtotal) as u32
}

pub fn read_scanline(hw: &dyn HardwareOps, pipe: PipeId, vtotal: u32) -> u32 {
    let dsl = hw.read(counter::pipedsl(pipe)) & counter::PIPEDSL_LINE_MASK;
    hw_to_scanline(dsl, vtotal, hw.scanline_offset(pipe))
}

/// Current frame count, cooked so both encodings increment at vblank start.
pub fn read_frame_count(
    hw: &dyn HardwareOps,
    pipe: PipeId,
    mode: &ModeTiming,
    retries: u32,
) -> u32 {
    match hw.frame_counter_style() {
        FrameCounterStyle::Wide32 => hw.read(counter::pipe_frmcount(pipe)),
        FrameCounterStyle::Legacy24 => read_legacy_frame_count(hw, pipe, mode, retries),
    }
}

fn read_legacy_frame_count(
    hw: &dyn HardwareOps,
    pipe: PipeId,
    mode: &ModeTiming,
    retries: u32,
) -> u32 {
    let mut attempts = 0;
    loop {
        // All four reads must land in the same frame.
        let low1 = hw.read(counter::pipeframepixel(pipe)) >> counter::PIPEFRAMEPIXEL_LOW_SHIFT;
        let high = (hw.read(counter::pipeframe(pipe)) & counter::PIPEFRAME_HIGH_MASK) << 8;
        let dsl = hw.read(counter::pipedsl(pipe)) & counter::PIPEDSL_LINE_MASK;
        let low2 = hw.read(counter::pipeframepixel(pipe)) >> counter::PIPEFRAMEPIXEL_LOW_SHIFT;

        let settled = low1 == low2;
        if !settled {
            attempts += 1;
            if attempts < retries {
                continue;
            }
            warn!(pipe = %pipe, "timed out while determining vblank count");
        }

        // The raw counter increments one line before the end of the frame; count the blanking
        // lines before that as the next frame.
        let in_vblank = dsl >= mode.vdisplay && dsl < mode.vtotal.saturating_sub(1);
        return (high | low2).wrapping_add(u32::from(in_vblank)) & 0x00ff_ffff;
    }
}

/// Per-pipe vblank wait queue, signalled from the interrupt consumer.
#[derive(Debug)]
pub struct VblankWaiter {
    seqs: Mutex<[u32; MAX_PIPES]>,
    cond: Condvar,
}

impl Default for VblankWaiter {
    fn default() -> Self {
        Self {
            seqs: Mutex::new([0; MAX_PIPES]),
            cond: Condvar::new(),
        }
    }
}

impl VblankWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [u32; MAX_PIPES]> {
        match self.seqs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn notify(&self, pipe: PipeId, seq: u32) {
        if let Some(slot) = self.lock().get_mut(pipe.index()) {
            *slot = seq;
        }
        self.cond.notify_all();
    }

    pub fn last_seq(&self, pipe: PipeId) -> u32 {
        self.lock().get(pipe.index()).copied().unwrap_or(0)
    }

    /// Wait until a vblank newer than `seen` is signalled on `pipe`. Returns false on timeout.
    pub fn wait_timeout(&self, pipe: PipeId, seen: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut seqs = self.lock();
        loop {
            if seqs.get(pipe.index()).is_some_and(|&s| s != seen) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            seqs = match self.cond.wait_timeout(seqs, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Outcome of a vblank evasion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evasion {
    /// Scanline after the wait.
    pub scanline: u32,
    /// The scanline was still inside the unsafe window when the timeout expired.
    pub missed: bool,
}

/// Longest single sleep between scanline samples.
const EVASION_POLL: Duration = Duration::from_micros(100);

/// Wait until the scanline is outside the window of `usecs` before vblank start, so that
/// double-buffered writes issued next latch together at the coming vblank.
pub fn evade(
    hw: &dyn HardwareOps,
    waiter: &VblankWaiter,
    pipe: PipeId,
    timing: &ScanoutTiming,
    usecs: u32,
    timeout: Duration,
) -> Evasion {
    let vblank_start = timing.mode.vblank_start();
    let min = vblank_start.saturating_sub(timing.mode.usecs_to_scanlines(usecs));
    let max = vblank_start.saturating_sub(1);
    let inside = |line: u32| line >= min && line <= max;

    let deadline = Instant::now() + timeout;
    let mut scanline = read_scanline(hw, pipe, timing.vtotal);
    while inside(scanline) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let seen = waiter.last_seq(pipe);
        waiter.wait_timeout(pipe, seen, (deadline - now).min(EVASION_POLL));
        scanline = read_scanline(hw, pipe, timing.vtotal);
    }

    let missed = inside(scanline);
    if missed {
        warn!(
            pipe = %pipe,
            scanline,
            vblank_start,
            "page flipping close to vblank start (DSL={scanline}, VBL={vblank_start})"
        );
    }
    Evasion { scanline, missed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_counter_comparison_is_wrap_safe() {
        let style = FrameCounterStyle::Wide32;
        assert!(style.passed(5, 5));
        assert!(style.passed(1, u32::MAX));
        assert!(!style.passed(u32::MAX, 1));
        assert_eq!(style.next(u32::MAX), 0);
    }

    #[test]
    fn legacy_counter_wraps_at_24_bits() {
        let style = FrameCounterStyle::Legacy24;
        assert_eq!(style.next(0x00ff_ffff), 0);
        assert!(style.passed(0, 0x00ff_ffff));
        assert!(!style.passed(0x00ff_fff0, 2));
    }

    #[test]
    fn scanline_translation_applies_the_offset_modulo_vtotal() {
        assert_eq!(scanline_to_hw(0, 1125, 1), 1124);
        assert_eq!(hw_to_scanline(1124, 1125, 1), 0);
        assert_eq!(scanline_to_hw(-1, 1125, 1), 1123);
        assert_eq!(scanline_to_hw(1080, 1125, 0), 1080);
    }

    #[test]
    fn waiter_times_out_without_a_vblank() {
        let waiter = VblankWaiter::new();
        assert!(!waiter.wait_timeout(PipeId(0), 0, Duration::from_millis(1)));
        waiter.notify(PipeId(0), 7);
        assert!(waiter.wait_timeout(PipeId(0), 0, Duration::from_millis(1)));
        assert_eq!(waiter.last_seq(PipeId(0)), 7);
    }
}
