//! State snapshots of pipes, surfaces and sinks.
//!
//! A transaction owns an independent old and new copy of every object. Copies that point at a
//! framebuffer hold a reference on it: [`StateObject::duplicate`] takes one and
//! [`StateObject::destroy`] drops it, on every path.

use bitflags::bitflags;

use crate::framebuffer::FbTable;
use crate::hw::ScalerMode;
use crate::mode::{ModeTiming, VrrTiming};
use crate::object::{BoHandle, FbId, PipeId, SinkId, SurfaceId};

bitflags! {
    /// Per-pipe dirty flags computed by the check phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipeDirty: u8 {
        /// Timing, routing or enable state changed: a full modeset is needed.
        const MODE = 1 << 0;
        /// Scanout buffer, pan offset or primary visibility changed.
        const FB = 1 << 1;
        const CURSOR = 1 << 2;
        /// Enable state or active area changed.
        const ACTIVE = 1 << 3;
    }
}

bitflags! {
    /// Surface rotation and reflection. Exactly one rotation bit must be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rotation: u32 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

impl Rotation {
    const ROTATE_MASK: Rotation = Rotation::ROTATE_0
        .union(Rotation::ROTATE_90)
        .union(Rotation::ROTATE_180)
        .union(Rotation::ROTATE_270);

    pub fn is_valid(self) -> bool {
        self.intersection(Self::ROTATE_MASK).bits().count_ones() == 1
    }

    /// 90 and 270 degree rotations swap the source width and height.
    pub fn swaps_axes(self) -> bool {
        self.intersects(Rotation::ROTATE_90 | Rotation::ROTATE_270)
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

/// Common reference-counting behaviour of state objects.
pub trait StateObject: Clone {
    fn framebuffer(&self) -> Option<FbId>;

    fn duplicate(&self, fbs: &mut FbTable) -> Self {
        if let Some(fb) = self.framebuffer() {
            fbs.get(fb);
        }
        self.clone()
    }

    fn destroy(self, fbs: &mut FbTable) {
        if let Some(fb) = self.framebuffer() {
            fbs.put(fb);
        }
    }
}

/// Old and proposed copies of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePair<T> {
    pub old: T,
    pub new: T,
}

impl<T: StateObject> StatePair<T> {
    pub fn begin(live: &T, fbs: &mut FbTable) -> Self {
        Self {
            old: live.duplicate(fbs),
            new: live.duplicate(fbs),
        }
    }

    pub fn destroy(self, fbs: &mut FbTable) {
        self.old.destroy(fbs);
        self.new.destroy(fbs);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorState {
    pub handle: Option<BoHandle>,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Address of the pinned cursor image.
    pub addr: u32,
}

impl CursorState {
    pub fn is_visible(&self) -> bool {
        self.handle.is_some() && self.width != 0 && self.height != 0
    }
}

/// Plane index inside [`PipeState::active_planes`] and [`PipeState::plane_data_rate`].
pub const PRIMARY_PLANE: usize = 0;

pub fn overlay_plane(surface: SurfaceId) -> usize {
    surface.index() + 1
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeState {
    pub id: PipeId,
    /// `None` when the pipe is disabled.
    pub mode: Option<ModeTiming>,
    pub fb: Option<FbId>,
    /// Pan offset inside the framebuffer.
    pub x: u32,
    pub y: u32,
    pub sink_mask: u32,
    pub encoder_mask: u32,
    pub cursor: CursorState,
    pub vrr_enabled: bool,
    pub vrr: Option<VrrTiming>,
    /// A fullscreen overlay hides the primary plane.
    pub primary_disabled: bool,
    /// Bit [`PRIMARY_PLANE`] for the primary plane, bit `1 + n` for overlay `n`. The cursor is
    /// never counted.
    pub active_planes: u64,
    pub plane_data_rate: Vec<u64>,
    /// Overlays (bit n) that need a scaler.
    pub scaler_users: u64,
    pub scaler_hq: bool,
    /// Address of the pinned scanout buffer.
    pub scanout_addr: u32,
    /// A property was set on this pipe in the current transaction.
    pub changed: bool,
    pub dirty: PipeDirty,
}

impl PipeState {
    pub fn new(id: PipeId, surfaces: usize) -> Self {
        Self {
            id,
            mode: None,
            fb: None,
            x: 0,
            y: 0,
            sink_mask: 0,
            encoder_mask: 0,
            cursor: CursorState::default(),
            vrr_enabled: false,
            vrr: None,
            primary_disabled: false,
            active_planes: 0,
            plane_data_rate: vec![0; surfaces + 1],
            scaler_users: 0,
            scaler_hq: false,
            scanout_addr: 0,
            changed: false,
            dirty: PipeDirty::empty(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode.is_some()
    }

    pub fn data_rate(&self) -> u64 {
        self.plane_data_rate.iter().sum()
    }

    pub fn active_plane_count(&self) -> u32 {
        self.active_planes.count_ones()
    }

    pub fn needs_modeset(&self) -> bool {
        self.dirty.contains(PipeDirty::MODE)
    }

    /// Total lines of the current frame: the VRR maximum when variable refresh is running.
    pub fn effective_vtotal(&self) -> Option<u32> {
        let mode = self.mode.as_ref()?;
        Some(match (self.vrr_enabled, self.vrr) {
            (true, Some(vrr)) => vrr.vmax,
            _ => mode.vtotal,
        })
    }
}

impl StateObject for PipeState {
    fn framebuffer(&self) -> Option<FbId> {
        self.fb
    }
}

/// Source rectangle in 16.16 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrcRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Destination rectangle on the pipe, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DstRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceState {
    pub id: SurfaceId,
    pub pipe: Option<PipeId>,
    pub fb: Option<FbId>,
    pub src: SrcRect,
    pub dst: DstRect,
    pub rotation: Rotation,
    /// Derived by the check phase.
    pub visible: bool,
    pub clipped_src: SrcRect,
    pub clipped_dst: DstRect,
    pub scaler: Option<ScalerMode>,
    pub data_rate: u64,
    pub scanout_addr: u32,
    pub changed: bool,
    pub dirty: bool,
}

impl SurfaceState {
    pub fn new(id: SurfaceId) -> Self {
        Self {
            id,
            pipe: None,
            fb: None,
            src: SrcRect::default(),
            dst: DstRect::default(),
            rotation: Rotation::ROTATE_0,
            visible: false,
            clipped_src: SrcRect::default(),
            clipped_dst: DstRect::default(),
            scaler: None,
            data_rate: 0,
            scanout_addr: 0,
            changed: false,
            dirty: false,
        }
    }

    pub fn is_visible_on(&self, pipe: PipeId) -> bool {
        self.visible && self.pipe == Some(pipe)
    }

    /// Geometry and buffer, the inputs that decide whether the surface must be reprogrammed.
    pub fn same_configuration(&self, other: &SurfaceState) -> bool {
        self.pipe == other.pipe
            && self.fb == other.fb
            && self.src == other.src
            && self.dst == other.dst
            && self.rotation == other.rotation
    }
}

impl StateObject for SurfaceState {
    fn framebuffer(&self) -> Option<FbId> {
        self.fb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dpms {
    On,
    #[default]
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkState {
    pub id: SinkId,
    pub pipe: Option<PipeId>,
    pub dpms: Dpms,
}

impl SinkState {
    pub fn new(id: SinkId) -> Self {
        Self {
            id,
            pipe: None,
            dpms: Dpms::Off,
        }
    }
}

impl StateObject for SinkState {
    fn framebuffer(&self) -> Option<FbId> {
        None
    }
}
