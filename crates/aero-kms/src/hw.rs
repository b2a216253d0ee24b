//! Boundaries between the commit engine and the outside world.
//!
//! [`HardwareOps`] is the per-generation strategy: register access, the counter encodings and the
//! register layouts of pipes and planes. It is selected once when the controller is created.
//! [`BufferManager`] covers buffer residency (pin/unpin) and GPU fences.

use std::time::Duration;

use crate::flip::FlipTarget;
use crate::mode::{ModeTiming, VrrTiming};
use crate::object::{BoHandle, PipeId, RingId, SinkId};
use crate::regs::Reg;
use crate::state::Rotation;
use crate::vblank::FrameCounterStyle;
use crate::Result;

/// One register write of a direct or batched programming sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub reg: Reg,
    pub value: u32,
}

impl RegWrite {
    pub const fn new(reg: Reg, value: u32) -> Self {
        Self { reg, value }
    }
}

/// Scanout parameters of a primary or overlay plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneRegs {
    pub enabled: bool,
    /// Address returned by [`BufferManager::pin`].
    pub surface_addr: u32,
    pub stride: u32,
    pub format: u32,
    /// Source offset in whole pixels.
    pub src_x: u32,
    pub src_y: u32,
    /// Source size in whole pixels.
    pub src_w: u32,
    pub src_h: u32,
    /// Destination rectangle on the pipe, already clipped.
    pub dst_x: u32,
    pub dst_y: u32,
    pub dst_w: u32,
    pub dst_h: u32,
    pub rotation: Rotation,
    pub scaler: Option<ScalerMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerMode {
    Normal,
    HighQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorRegs {
    pub enabled: bool,
    pub addr: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Per-generation display engine operations.
///
/// Register programming hooks return the writes to perform instead of performing them, so the
/// flip path can route them either through direct MMIO or through a command buffer.
pub trait HardwareOps: Send + Sync {
    fn read(&self, reg: Reg) -> u32;

    fn write(&self, reg: Reg, value: u32);

    fn frame_counter_style(&self) -> FrameCounterStyle;

    /// Timestamp of the most recent vblank of `pipe`.
    fn vblank_timestamp(&self, pipe: PipeId) -> Duration;

    /// Block until the next vblank of `pipe`.
    fn wait_for_vblank(&self, pipe: PipeId);

    /// Maximum aggregate data rate in MB/s for the given number of active planes.
    fn max_data_rate(&self, active_planes: u32) -> u32;

    fn num_scalers(&self, pipe: PipeId) -> u32;

    /// Hardware scanline lags the logical scanline by this many lines.
    fn scanline_offset(&self, _pipe: PipeId) -> u32 {
        1
    }

    fn has_command_buffer(&self) -> bool {
        false
    }

    /// Memory wake-up latency used for the command buffer dewake scanline. Zero disables dewake.
    fn wake_latency_us(&self) -> u32 {
        0
    }

    /// Surface address latched by the hardware for `target`, when the generation can report it.
    fn latched_surface(&self, _target: FlipTarget) -> Option<u32> {
        None
    }

    fn pipe_disable(&self, pipe: PipeId) -> Result<()>;

    fn pipe_mode_set(&self, pipe: PipeId, mode: &ModeTiming, vrr: Option<VrrTiming>)
        -> Result<()>;

    fn pipe_enable(&self, pipe: PipeId) -> Result<()>;

    /// Power down a pipe that stays disabled after a modeset.
    fn pipe_off(&self, pipe: PipeId) -> Result<()>;

    /// Route every sink to its pipe (or detach it) and set its power state.
    fn route_outputs(&self, routes: &[SinkRoute]) -> Result<()>;

    /// Writes that program the primary plane (`FlipTarget::Pipe`) or an overlay.
    fn plane_writes(&self, target: FlipTarget, regs: &PlaneRegs) -> Result<Vec<RegWrite>>;

    fn cursor_writes(&self, pipe: PipeId, regs: &CursorRegs) -> Vec<RegWrite>;

    /// Copy a finished command buffer to device-visible memory and return its address.
    fn upload_command_buffer(&self, pipe: PipeId, engine: u8, words: &[u32]) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkRoute {
    pub sink: SinkId,
    pub pipe: Option<PipeId>,
    pub dpms_on: bool,
}

/// GPU fence: rendering to a buffer is done once `ring` has passed `seqno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    pub ring: RingId,
    pub seqno: u32,
}

impl Fence {
    /// Wrap-safe comparison of a ring's current seqno against this fence.
    pub fn passed(&self, current: u32) -> bool {
        current.wrapping_sub(self.seqno) as i32 >= 0
    }
}

/// Buffer residency and GPU synchronization.
///
/// Pin and unpin serialize on the implementation's own memory-management lock.
pub trait BufferManager: Send + Sync {
    /// Make `bo` resident for scanout and return its device address.
    fn pin(&self, bo: BoHandle) -> Result<u32>;

    fn unpin(&self, bo: BoHandle);

    fn pin_cursor(&self, bo: BoHandle) -> Result<u32>;

    fn unpin_cursor(&self, bo: BoHandle);

    /// Last write fence of `bo`, if rendering may still be outstanding.
    fn last_fence(&self, bo: BoHandle) -> Option<Fence>;

    fn ring_seqno(&self, ring: RingId) -> u32;

    /// Block until all rendering to `bo` is done.
    fn finish(&self, bo: BoHandle);

    fn is_wedged(&self) -> bool {
        false
    }
}
