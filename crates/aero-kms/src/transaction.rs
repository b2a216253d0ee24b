//! The transaction container and property updates.
//!
//! A [`Transaction`] snapshots every pipe, surface and sink of its controller at begin time.
//! Properties only ever touch the proposed (`new`) half of a pair; the live state is replaced
//! wholesale by a successful commit. Checking lives in `check.rs`, committing in `commit.rs`.

use std::fmt;

use bitflags::bitflags;
use tracing::{debug, error};

use crate::bandwidth::BandwidthState;
use crate::controller::DisplayController;
use crate::mode::{ModeTiming, MODE_BLOB_LEN};
use crate::object::{BoHandle, FbId, ObjectId, PipeId, Property, SinkId, SurfaceId};
use crate::state::{PipeState, Rotation, SinkState, StatePair, SurfaceState};
use crate::{KmsError, Result};

/// Fixed cursor edge length; anything else (other than 0) is rejected.
pub const CURSOR_SIZE: u32 = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Return before the hardware latches; completion arrives as events.
        const NONBLOCK = 1 << 0;
        /// Permit a full modeset.
        const ALLOW_MODESET = 1 << 1;
        /// Deliver a completion event per touched object.
        const EVENT = 1 << 2;
    }
}

/// Borrowed old/new pair returned by [`Transaction::get_object_state`].
#[derive(Debug, Clone, Copy)]
pub enum ObjectState<'t> {
    Pipe(&'t StatePair<PipeState>),
    Surface(&'t StatePair<SurfaceState>),
    Sink(&'t StatePair<SinkState>),
}

/// An in-progress configuration change. Ends (and releases its references) on drop.
pub struct Transaction<'a> {
    pub(crate) ctl: &'a mut DisplayController,
    pub(crate) user_data: u64,
    pub(crate) flags: CommitFlags,
    pub(crate) pipes: Vec<StatePair<PipeState>>,
    pub(crate) surfaces: Vec<StatePair<SurfaceState>>,
    pub(crate) sinks: Vec<StatePair<SinkState>>,
    /// Bandwidth state the proposed configuration would produce.
    pub(crate) bandwidth: BandwidthState,
    /// The last check found something to program.
    pub(crate) dirty: bool,
    /// The proposed state was discarded after a failure.
    pub(crate) restore_state: bool,
    /// Hardware was partially programmed and must be restored to the old state.
    pub(crate) restore_hw: bool,
    pub(crate) committed: bool,
    ended: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("user_data", &self.user_data)
            .field("flags", &self.flags)
            .field("dirty", &self.dirty)
            .field("restore_state", &self.restore_state)
            .field("restore_hw", &self.restore_hw)
            .finish_non_exhaustive()
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(ctl: &'a mut DisplayController, user_data: u64) -> Self {
        let DisplayController {
            pipes,
            surfaces,
            sinks,
            fbs,
            bandwidth,
            ..
        } = &mut *ctl;
        let pipes = pipes.iter().map(|s| StatePair::begin(s, fbs)).collect();
        let surfaces = surfaces.iter().map(|s| StatePair::begin(s, fbs)).collect();
        let sinks = sinks.iter().map(|s| StatePair::begin(s, fbs)).collect();
        let bandwidth = bandwidth.clone();
        Self {
            ctl,
            user_data,
            flags: CommitFlags::empty(),
            pipes,
            surfaces,
            sinks,
            bandwidth,
            dirty: false,
            restore_state: false,
            restore_hw: false,
            committed: false,
            ended: false,
        }
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub fn get_object_state(&self, object: ObjectId) -> Result<ObjectState<'_>> {
        let state = match object {
            ObjectId::Pipe(id) => self.pipes.get(id.index()).map(ObjectState::Pipe),
            ObjectId::Surface(id) => self.surfaces.get(id.index()).map(ObjectState::Surface),
            ObjectId::Sink(id) => self.sinks.get(id.index()).map(ObjectState::Sink),
        };
        state.ok_or(KmsError::NotFound(object))
    }

    /// Update one property of the proposed state.
    ///
    /// Blob-valued properties (`Mode`, `ConnectorIds`) take their payload from `blob`; every other
    /// property uses `value`. Signed properties use the two's complement encoding of `value`.
    pub fn set_property(
        &mut self,
        object: ObjectId,
        property: Property,
        value: u64,
        blob: Option<&[u8]>,
    ) -> Result<()> {
        match object {
            ObjectId::Pipe(id) => self.set_pipe_property(id, property, value, blob),
            ObjectId::Surface(id) => self.set_surface_property(id, property, value),
            ObjectId::Sink(id) => {
                if id.index() >= self.sinks.len() {
                    return Err(KmsError::NotFound(object));
                }
                Err(KmsError::UnknownProperty { object, property })
            }
        }
    }

    fn lookup_fb(&self, value: u64) -> Result<Option<FbId>> {
        if value == 0 {
            return Ok(None);
        }
        let raw = u32::try_from(value).map_err(|_| KmsError::UnknownFramebuffer(u32::MAX))?;
        let id = FbId(raw);
        if self.ctl.fbs.lookup(id).is_none() {
            return Err(KmsError::UnknownFramebuffer(raw));
        }
        Ok(Some(id))
    }

    /// Swap the framebuffer reference held by a proposed state.
    fn replace_fb(&mut self, slot: FbSlot, fb: Option<FbId>) {
        let current = match slot {
            FbSlot::Pipe(i) => &mut self.pipes[i].new.fb,
            FbSlot::Surface(i) => &mut self.surfaces[i].new.fb,
        };
        if *current == fb {
            return;
        }
        let previous = std::mem::replace(current, fb);
        if let Some(fb) = fb {
            self.ctl.fbs.get(fb);
        }
        if let Some(previous) = previous {
            self.ctl.fbs.put(previous);
        }
    }

    fn set_pipe_property(
        &mut self,
        id: PipeId,
        property: Property,
        value: u64,
        blob: Option<&[u8]>,
    ) -> Result<()> {
        let object = ObjectId::Pipe(id);
        let index = id.index();
        if index >= self.pipes.len() {
            return Err(KmsError::NotFound(object));
        }

        match property {
            Property::Mode => {
                let mode = match blob {
                    None | Some([]) => None,
                    Some(blob) if blob.len() != MODE_BLOB_LEN => {
                        return Err(KmsError::Invalid("mode blob length"))
                    }
                    Some(blob) => Some(ModeTiming::from_blob(blob)?),
                };
                self.pipes[index].new.mode = mode;
            }
            Property::FbId => {
                let fb = self.lookup_fb(value)?;
                self.replace_fb(FbSlot::Pipe(index), fb);
            }
            Property::SrcX => self.pipes[index].new.x = to_u32(value)?,
            Property::SrcY => self.pipes[index].new.y = to_u32(value)?,
            Property::ConnectorIds => {
                let sinks = self.parse_connector_ids(id, blob.unwrap_or_default())?;
                self.set_sinks(id, &sinks);
            }
            Property::CursorHandle => {
                self.pipes[index].new.cursor.handle = match to_u32(value)? {
                    0 => None,
                    handle => Some(BoHandle(handle)),
                };
            }
            Property::CursorX => self.pipes[index].new.cursor.x = to_i32(value)?,
            Property::CursorY => self.pipes[index].new.cursor.y = to_i32(value)?,
            Property::CursorW | Property::CursorH => {
                let size = to_u32(value)?;
                if size != 0 && size != CURSOR_SIZE {
                    return Err(KmsError::Invalid("cursor size"));
                }
                let cursor = &mut self.pipes[index].new.cursor;
                if property == Property::CursorW {
                    cursor.width = size;
                } else {
                    cursor.height = size;
                }
            }
            Property::VrrEnabled => {
                self.pipes[index].new.vrr_enabled = match value {
                    0 => false,
                    1 => true,
                    _ => return Err(KmsError::Invalid("vrr_enabled must be 0 or 1")),
                };
            }
            _ => return Err(KmsError::UnknownProperty { object, property }),
        }

        self.pipes[index].new.changed = true;
        debug!(pipe = %id, ?property, value, "pipe property set");
        Ok(())
    }

    fn parse_connector_ids(&self, pipe: PipeId, blob: &[u8]) -> Result<Vec<SinkId>> {
        if blob.len() % 4 != 0 {
            return Err(KmsError::Invalid("connector id blob length"));
        }
        let count = blob.len() / 4;
        if count > self.sinks.len() {
            return Err(KmsError::Range("more connector ids than sinks"));
        }

        let mut seen = 0u32;
        let mut sinks = Vec::with_capacity(count);
        for chunk in blob.chunks_exact(4) {
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let sink = u8::try_from(raw)
                .ok()
                .map(SinkId)
                .filter(|sink| sink.index() < self.sinks.len())
                .ok_or(KmsError::NotFound(ObjectId::Sink(SinkId(u8::MAX))))?;
            if seen & sink.bit() != 0 {
                return Err(KmsError::Invalid("duplicate connector id"));
            }
            seen |= sink.bit();
            if self.ctl.layout.sinks[sink.index()].possible_pipes & (1 << pipe.0) == 0 {
                return Err(KmsError::Invalid("sink cannot be routed to pipe"));
            }
            sinks.push(sink);
        }
        Ok(sinks)
    }

    /// Attach `sinks` to `pipe`. Only this pipe's masks are recomputed.
    fn set_sinks(&mut self, pipe: PipeId, sinks: &[SinkId]) {
        let layout = &self.ctl.layout;
        let previous = self.pipes[pipe.index()].new.sink_mask;

        let mut sink_mask = 0;
        let mut encoder_mask = 0;
        for sink in sinks {
            sink_mask |= sink.bit();
            encoder_mask |= 1u32 << layout.sinks[sink.index()].encoder;
        }

        for pair in &mut self.sinks {
            let bit = pair.new.id.bit();
            if sink_mask & bit != 0 {
                pair.new.pipe = Some(pipe);
            } else if previous & bit != 0 && pair.new.pipe == Some(pipe) {
                pair.new.pipe = None;
            }
        }

        let state = &mut self.pipes[pipe.index()].new;
        state.sink_mask = sink_mask;
        state.encoder_mask = encoder_mask;
    }

    fn set_surface_property(&mut self, id: SurfaceId, property: Property, value: u64) -> Result<()> {
        let object = ObjectId::Surface(id);
        let index = id.index();
        if index >= self.surfaces.len() {
            return Err(KmsError::NotFound(object));
        }

        match property {
            Property::PipeId => {
                let pipe = match value {
                    0 => None,
                    v => {
                        let pipe = u8::try_from(v - 1)
                            .ok()
                            .map(PipeId)
                            .filter(|p| p.index() < self.pipes.len())
                            .ok_or(KmsError::NotFound(ObjectId::Pipe(PipeId(u8::MAX))))?;
                        if self.ctl.layout.surfaces[index].possible_pipes & (1 << pipe.0) == 0 {
                            return Err(KmsError::Invalid("surface cannot be attached to pipe"));
                        }
                        Some(pipe)
                    }
                };
                self.surfaces[index].new.pipe = pipe;
            }
            Property::FbId => {
                let fb = self.lookup_fb(value)?;
                self.replace_fb(FbSlot::Surface(index), fb);
            }
            Property::SrcX => self.surfaces[index].new.src.x = to_u32(value)?,
            Property::SrcY => self.surfaces[index].new.src.y = to_u32(value)?,
            Property::SrcW => self.surfaces[index].new.src.w = to_u32(value)?,
            Property::SrcH => self.surfaces[index].new.src.h = to_u32(value)?,
            Property::DstX => self.surfaces[index].new.dst.x = to_i32(value)?,
            Property::DstY => self.surfaces[index].new.dst.y = to_i32(value)?,
            Property::DstW => self.surfaces[index].new.dst.w = to_u32(value)?,
            Property::DstH => self.surfaces[index].new.dst.h = to_u32(value)?,
            Property::Rotation => {
                let rotation = u32::try_from(value)
                    .ok()
                    .and_then(Rotation::from_bits)
                    .filter(|r| r.is_valid())
                    .ok_or(KmsError::Invalid("rotation"))?;
                self.surfaces[index].new.rotation = rotation;
            }
            _ => return Err(KmsError::UnknownProperty { object, property }),
        }

        self.surfaces[index].new.changed = true;
        debug!(surface = id.0, ?property, value, "surface property set");
        Ok(())
    }

    /// Finish the transaction: replay the old state into the hardware if a commit failed half
    /// way, then drop every state reference.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        if self.restore_hw {
            if let Err(err) = self.restore_hardware() {
                error!(%err, "failed to restore the previous display configuration");
            }
            self.restore_hw = false;
        }
        if self.restore_state {
            debug!(user_data = self.user_data, "proposed state discarded");
        }

        let fbs = &mut self.ctl.fbs;
        for pair in self.pipes.drain(..) {
            pair.destroy(fbs);
        }
        for pair in self.surfaces.drain(..) {
            pair.destroy(fbs);
        }
        for pair in self.sinks.drain(..) {
            pair.destroy(fbs);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[derive(Debug, Clone, Copy)]
enum FbSlot {
    Pipe(usize),
    Surface(usize),
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| KmsError::Range("property value does not fit 32 bits"))
}

fn to_i32(value: u64) -> Result<i32> {
    i32::try_from(value as i64).map_err(|_| KmsError::Range("property value does not fit 32 bits"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBuffers, SimHardware};
    use crate::{DisplayConfig, DisplayLayout};
    use std::sync::Arc;

    fn controller() -> DisplayController {
        DisplayController::new(
            DisplayLayout::simple(2, 1),
            DisplayConfig::default(),
            Arc::new(SimHardware::default()),
            Arc::new(SimBuffers::new()),
        )
        .unwrap()
    }

    fn sink_blob(ids: &[u32]) -> Vec<u8> {
        ids.iter().flat_map(|id| id.to_le_bytes()).collect()
    }

    #[test]
    fn sinks_have_no_writable_properties() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        let sink = ObjectId::Sink(SinkId(0));
        assert_eq!(
            txn.set_property(sink, Property::FbId, 0, None),
            Err(KmsError::UnknownProperty {
                object: sink,
                property: Property::FbId
            })
        );
        assert_eq!(
            txn.set_property(ObjectId::Sink(SinkId(9)), Property::FbId, 0, None),
            Err(KmsError::NotFound(ObjectId::Sink(SinkId(9))))
        );
    }

    #[test]
    fn cursor_size_must_be_zero_or_sixty_four() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        let pipe = ObjectId::Pipe(PipeId(0));
        assert!(txn.set_property(pipe, Property::CursorW, 64, None).is_ok());
        assert!(txn.set_property(pipe, Property::CursorH, 0, None).is_ok());
        assert_eq!(
            txn.set_property(pipe, Property::CursorW, 32, None),
            Err(KmsError::Invalid("cursor size"))
        );
    }

    #[test]
    fn connector_blob_is_validated() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        let pipe = ObjectId::Pipe(PipeId(0));
        let set = |txn: &mut Transaction<'_>, blob: &[u8]| {
            txn.set_property(pipe, Property::ConnectorIds, 0, Some(blob))
        };

        assert_eq!(set(&mut txn, &[0, 0, 0]), Err(KmsError::Invalid("connector id blob length")));
        assert_eq!(
            set(&mut txn, &sink_blob(&[0, 1, 1])),
            Err(KmsError::Range("more connector ids than sinks"))
        );
        assert_eq!(
            set(&mut txn, &sink_blob(&[0, 0])),
            Err(KmsError::Invalid("duplicate connector id"))
        );
        assert!(matches!(
            set(&mut txn, &sink_blob(&[7])),
            Err(KmsError::NotFound(ObjectId::Sink(_)))
        ));
        assert_eq!(
            set(&mut txn, &sink_blob(&[1])),
            Err(KmsError::Invalid("sink cannot be routed to pipe"))
        );

        set(&mut txn, &sink_blob(&[0])).unwrap();
        let ObjectState::Pipe(pair) = txn.get_object_state(pipe).unwrap() else {
            panic!("expected pipe state");
        };
        assert_eq!(pair.new.sink_mask, 0b1);
        assert_eq!(pair.new.encoder_mask, 0b1);
        assert_eq!(pair.old.sink_mask, 0);
    }

    #[test]
    fn rotation_needs_exactly_one_angle() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        let surface = ObjectId::Surface(SurfaceId(0));
        let bits = (Rotation::ROTATE_90 | Rotation::ROTATE_180).bits();
        assert_eq!(
            txn.set_property(surface, Property::Rotation, u64::from(bits), None),
            Err(KmsError::Invalid("rotation"))
        );
        let bits = (Rotation::ROTATE_180 | Rotation::REFLECT_X).bits();
        txn.set_property(surface, Property::Rotation, u64::from(bits), None)
            .unwrap();
    }

    #[test]
    fn surface_pipe_must_be_possible() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        let surface = ObjectId::Surface(SurfaceId(0));
        assert_eq!(
            txn.set_property(surface, Property::PipeId, 2, None),
            Err(KmsError::Invalid("surface cannot be attached to pipe"))
        );
        txn.set_property(surface, Property::PipeId, 1, None).unwrap();
        assert!(matches!(
            txn.set_property(surface, Property::PipeId, 5, None),
            Err(KmsError::NotFound(_))
        ));
    }

    #[test]
    fn unknown_framebuffer_is_rejected() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        assert_eq!(
            txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, 42, None),
            Err(KmsError::UnknownFramebuffer(42))
        );
    }

    #[test]
    fn negative_positions_use_twos_complement() {
        let mut ctl = controller();
        let mut txn = ctl.begin(0);
        let pipe = ObjectId::Pipe(PipeId(0));
        txn.set_property(pipe, Property::CursorX, (-12i64) as u64, None)
            .unwrap();
        let ObjectState::Pipe(pair) = txn.get_object_state(pipe).unwrap() else {
            panic!("expected pipe state");
        };
        assert_eq!(pair.new.cursor.x, -12);
        assert!(pair.new.changed);
    }
}
