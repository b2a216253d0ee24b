//! Object ids and the arena layout of a display controller.
//!
//! Pipes, surfaces and sinks live in plain vectors and are addressed by small integer ids. Every
//! cross-reference between objects (surface → pipe, sink → pipe) is an id, never a pointer.

use std::fmt;

/// Maximum number of pipes addressable by the register helpers in [`crate::regs`].
pub const MAX_PIPES: usize = 4;

/// Output pipeline (timing generator) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeId(pub u8);

/// Overlay surface (plane) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u8);

/// Output sink (connector) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkId(pub u8);

/// Framebuffer id. Ids are never zero; a property value of zero means "no framebuffer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FbId(pub u32);

/// Buffer object backing a framebuffer or cursor image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoHandle(pub u32);

/// GPU ring whose sequence numbers back buffer fences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId(pub u8);

impl PipeId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl SurfaceId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl SinkId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn bit(self) -> u32 {
        1u32 << self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", char::from(b'A' + self.0))
    }
}

impl fmt::Display for FbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Any object a transaction can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectId {
    Pipe(PipeId),
    Surface(SurfaceId),
    Sink(SinkId),
}

/// Properties accepted by `Transaction::set_property`.
///
/// `SrcX`/`SrcY` are the pan offset (whole pixels) on a pipe and the 16.16 fixed-point source
/// origin on a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Mode,
    FbId,
    SrcX,
    SrcY,
    ConnectorIds,
    CursorHandle,
    CursorX,
    CursorY,
    CursorW,
    CursorH,
    VrrEnabled,
    PipeId,
    SrcW,
    SrcH,
    DstX,
    DstY,
    DstW,
    DstH,
    Rotation,
}

/// Refresh range advertised by a sink, in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRange {
    pub min_hz: u32,
    pub max_hz: u32,
}

impl RefreshRange {
    /// Variable refresh is only worth enabling with more than 10 Hz of range.
    pub fn is_vrr_capable(&self) -> bool {
        self.max_hz > self.min_hz && self.max_hz - self.min_hz > 10
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceDesc {
    /// Bitmask of pipes this surface can be attached to.
    pub possible_pipes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDesc {
    /// Encoder driving this sink. Several sinks may share one encoder.
    pub encoder: u8,
    /// Bitmask of pipes the encoder can be routed to.
    pub possible_pipes: u32,
    pub refresh_range: Option<RefreshRange>,
}

/// Static description of the objects a controller exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayLayout {
    pub pipes: u8,
    pub surfaces: Vec<SurfaceDesc>,
    pub sinks: Vec<SinkDesc>,
}

impl DisplayLayout {
    /// `pipes` pipes, each with `surfaces_per_pipe` dedicated overlays and one dedicated sink with
    /// its own encoder.
    pub fn simple(pipes: u8, surfaces_per_pipe: u8) -> Self {
        let mut surfaces = Vec::new();
        let mut sinks = Vec::new();
        for pipe in 0..pipes {
            for _ in 0..surfaces_per_pipe {
                surfaces.push(SurfaceDesc {
                    possible_pipes: 1 << pipe,
                });
            }
            sinks.push(SinkDesc {
                encoder: pipe,
                possible_pipes: 1 << pipe,
                refresh_range: None,
            });
        }
        Self {
            pipes,
            surfaces,
            sinks,
        }
    }

    pub fn pipe_ids(&self) -> impl Iterator<Item = PipeId> {
        (0..self.pipes).map(PipeId)
    }

    pub fn surface_ids(&self) -> impl Iterator<Item = SurfaceId> {
        (0..self.surfaces.len()).map(|i| SurfaceId(i as u8))
    }

    pub fn sink_ids(&self) -> impl Iterator<Item = SinkId> {
        (0..self.sinks.len()).map(|i| SinkId(i as u8))
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        match object {
            ObjectId::Pipe(p) => p.0 < self.pipes,
            ObjectId::Surface(s) => s.index() < self.surfaces.len(),
            ObjectId::Sink(s) => s.index() < self.sinks.len(),
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.pipes == 0 || usize::from(self.pipes) > MAX_PIPES {
            return Err(crate::KmsError::InvalidConfig(format!(
                "layout must have 1..={MAX_PIPES} pipes, got {}",
                self.pipes
            )));
        }
        if self.sinks.len() > 32 || self.surfaces.len() > 60 {
            return Err(crate::KmsError::InvalidConfig(
                "too many sinks or surfaces for the plane/sink bitmasks".into(),
            ));
        }
        let beyond = |mask: u32| mask >> self.pipes != 0;
        for (index, sink) in self.sinks.iter().enumerate() {
            if sink.encoder >= 32 {
                return Err(crate::KmsError::InvalidConfig(format!(
                    "sink {index}: encoder {} does not fit the encoder mask",
                    sink.encoder
                )));
            }
            if beyond(sink.possible_pipes) {
                return Err(crate::KmsError::InvalidConfig(format!(
                    "sink {index}: possible pipes {:#x} name a pipe outside the layout",
                    sink.possible_pipes
                )));
            }
        }
        for (index, surface) in self.surfaces.iter().enumerate() {
            if beyond(surface.possible_pipes) {
                return Err(crate::KmsError::InvalidConfig(format!(
                    "surface {index}: possible pipes {:#x} name a pipe outside the layout",
                    surface.possible_pipes
                )));
            }
        }
        Ok(())
    }
}
