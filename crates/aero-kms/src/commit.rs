//! Commit scheduling: pinning, blocking programming, flip construction and rollback.

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::check::CheckSummary;
use crate::dsb::DsbTiming;
use crate::event::PendingEvent;
use crate::flip::{FlipDescriptor, FlipTarget};
use crate::framebuffer::FbTable;
use crate::hw::{CursorRegs, HardwareOps, PlaneRegs, SinkRoute};
use crate::irq::IrqEvent;
use crate::object::{BoHandle, ObjectId, PipeId, SurfaceId};
use crate::state::{
    Dpms, PipeDirty, PipeState, SinkState, StateObject, StatePair, SurfaceState,
};
use crate::transaction::{CommitFlags, Transaction};
use crate::vblank::ScanoutTiming;
use crate::Result;

/// Buffer scanned out by a pipe's primary plane. Only enabled pipes hold a pin.
pub(crate) fn scanout_bo(pipe: &PipeState, fbs: &FbTable) -> Option<BoHandle> {
    pipe.mode?;
    Some(fbs.get_any(pipe.fb?)?.bo)
}

/// Buffer scanned out by a surface. Only visible surfaces hold a pin.
pub(crate) fn surface_bo(surface: &SurfaceState, fbs: &FbTable) -> Option<BoHandle> {
    if !surface.visible {
        return None;
    }
    Some(fbs.get_any(surface.fb?)?.bo)
}

pub(crate) fn primary_regs(pipe: &PipeState, fbs: &FbTable) -> PlaneRegs {
    let fb = pipe.fb.and_then(|fb| fbs.get_any(fb));
    match (pipe.mode, fb) {
        (Some(mode), Some(fb)) if !pipe.primary_disabled => PlaneRegs {
            enabled: true,
            surface_addr: pipe.scanout_addr,
            stride: fb.pitch,
            format: fb.format,
            src_x: pipe.x,
            src_y: pipe.y,
            src_w: mode.hdisplay,
            src_h: mode.vdisplay,
            dst_x: 0,
            dst_y: 0,
            dst_w: mode.hdisplay,
            dst_h: mode.vdisplay,
            ..PlaneRegs::default()
        },
        _ => PlaneRegs::default(),
    }
}

pub(crate) fn surface_regs(surface: &SurfaceState, fbs: &FbTable) -> PlaneRegs {
    let fb = surface.fb.and_then(|fb| fbs.get_any(fb));
    match fb {
        Some(fb) if surface.visible => PlaneRegs {
            enabled: true,
            surface_addr: surface.scanout_addr,
            stride: fb.pitch,
            format: fb.format,
            src_x: surface.clipped_src.x >> 16,
            src_y: surface.clipped_src.y >> 16,
            src_w: surface.clipped_src.w >> 16,
            src_h: surface.clipped_src.h >> 16,
            dst_x: surface.clipped_dst.x.max(0) as u32,
            dst_y: surface.clipped_dst.y.max(0) as u32,
            dst_w: surface.clipped_dst.w,
            dst_h: surface.clipped_dst.h,
            rotation: surface.rotation,
            scaler: surface.scaler,
        },
        _ => PlaneRegs::default(),
    }
}

pub(crate) fn cursor_regs(pipe: &PipeState) -> CursorRegs {
    let cursor = &pipe.cursor;
    CursorRegs {
        enabled: pipe.is_enabled() && cursor.is_visible(),
        addr: cursor.addr,
        x: cursor.x,
        y: cursor.y,
        width: cursor.width,
        height: cursor.height,
    }
}

/// Buffers pinned by this commit, released again if it fails.
#[derive(Debug, Default)]
struct Pins {
    buffers: Vec<BoHandle>,
    cursors: Vec<BoHandle>,
}

/// Buffers of the old state released once the new state is on screen.
#[derive(Debug, Default)]
struct Releases {
    buffers: Vec<BoHandle>,
    cursors: Vec<BoHandle>,
}

/// Which half of the transaction to program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Old,
    New,
}

impl Transaction<'_> {
    /// Check and apply the transaction.
    ///
    /// A blocking commit returns once the hardware latched the new state. A `NONBLOCK` commit
    /// queues flips and returns immediately; completion arrives through the event queue.
    pub fn commit(&mut self, flags: CommitFlags) -> Result<()> {
        if self.committed {
            return Err(crate::KmsError::Invalid("transaction already committed"));
        }
        let summary = self.check(flags)?;

        let mut events = if flags.contains(CommitFlags::EVENT) {
            self.reserve_events()?
        } else {
            BTreeMap::new()
        };

        if summary.is_empty() {
            for (object, event) in std::mem::take(&mut events) {
                let pipe = self.event_pipe(object);
                self.deliver(event, pipe, None);
            }
            self.committed = true;
            return Ok(());
        }

        let pins = match self.pin_new(&summary) {
            Ok(pins) => pins,
            Err(err) => {
                self.restore_state = true;
                return Err(err);
            }
        };

        let result = if flags.contains(CommitFlags::NONBLOCK) {
            self.ctl.stats.inc_commits_nonblocking();
            self.commit_nonblocking(&summary, events)
        } else {
            self.ctl.stats.inc_commits_blocking();
            self.apply_config(&summary, events)
        };

        if let Err(err) = result {
            self.unpin(&pins);
            self.restore_state = true;
            return Err(err);
        }
        self.committed = true;
        Ok(())
    }

    /// Reserve one event per touched pipe and surface.
    fn reserve_events(&self) -> Result<BTreeMap<ObjectId, PendingEvent>> {
        let mut events = BTreeMap::new();
        let touched_pipes = self
            .pipes
            .iter()
            .filter(|p| p.new.changed || !p.new.dirty.is_empty())
            .map(|p| ObjectId::Pipe(p.new.id));
        let touched_surfaces = self
            .surfaces
            .iter()
            .filter(|s| s.new.changed || s.new.dirty)
            .map(|s| ObjectId::Surface(s.new.id));
        for object in touched_pipes.chain(touched_surfaces) {
            // Dropping `events` on failure returns the space already reserved.
            events.insert(object, self.ctl.events.reserve(object, self.user_data)?);
        }
        Ok(events)
    }

    fn event_pipe(&self, object: ObjectId) -> Option<PipeId> {
        match object {
            ObjectId::Pipe(pipe) => Some(pipe),
            ObjectId::Surface(s) => {
                let pair = &self.surfaces[s.index()];
                pair.new.pipe.or(pair.old.pipe)
            }
            ObjectId::Sink(_) => None,
        }
    }

    fn deliver(&self, event: PendingEvent, pipe: Option<PipeId>, old_fb: Option<crate::object::FbId>) {
        let (sequence, timestamp) = match pipe {
            Some(pipe) => (
                self.ctl.flips.frame_count(pipe),
                self.ctl.hw.vblank_timestamp(pipe),
            ),
            None => (0, std::time::Duration::ZERO),
        };
        event.deliver(sequence, timestamp, old_fb);
    }

    /// Pin the new scanout buffers and cursors. On failure everything pinned so far is released.
    fn pin_new(&mut self, summary: &CheckSummary) -> Result<Pins> {
        let mut pins = Pins::default();
        match self.pin_new_inner(summary, &mut pins) {
            Ok(()) => Ok(pins),
            Err(err) => {
                warn!(%err, "pinning failed, releasing new buffers");
                self.unpin(&pins);
                Err(err)
            }
        }
    }

    fn pin_new_inner(&mut self, summary: &CheckSummary, pins: &mut Pins) -> Result<()> {
        let buffers = std::sync::Arc::clone(&self.ctl.buffers);

        for &pipe in &summary.dirty_pipes {
            let pair = &self.pipes[pipe.index()];
            if !pair.new.dirty.intersects(PipeDirty::FB | PipeDirty::MODE) {
                continue;
            }
            if let Some(bo) = scanout_bo(&pair.new, &self.ctl.fbs) {
                let addr = buffers.pin(bo)?;
                pins.buffers.push(bo);
                self.pipes[pipe.index()].new.scanout_addr = addr;
            }
        }

        for &surface in &summary.dirty_surfaces {
            if let Some(bo) = surface_bo(&self.surfaces[surface.index()].new, &self.ctl.fbs) {
                let addr = buffers.pin(bo)?;
                pins.buffers.push(bo);
                self.surfaces[surface.index()].new.scanout_addr = addr;
            }
        }

        for &pipe in &summary.dirty_pipes {
            let pair = &self.pipes[pipe.index()];
            if !pair.new.dirty.contains(PipeDirty::CURSOR) {
                continue;
            }
            if let Some(bo) = pair.new.cursor.handle {
                let addr = buffers.pin_cursor(bo)?;
                pins.cursors.push(bo);
                self.pipes[pipe.index()].new.cursor.addr = addr;
            }
        }
        Ok(())
    }

    fn unpin(&self, pins: &Pins) {
        for &bo in &pins.buffers {
            self.ctl.buffers.unpin(bo);
        }
        for &bo in &pins.cursors {
            self.ctl.buffers.unpin_cursor(bo);
        }
    }

    /// Old buffers the new state no longer scans out.
    fn releases(&self, summary: &CheckSummary) -> Releases {
        let fbs = &self.ctl.fbs;
        let mut releases = Releases::default();
        for &pipe in &summary.dirty_pipes {
            let pair = &self.pipes[pipe.index()];
            if pair.new.dirty.intersects(PipeDirty::FB | PipeDirty::MODE) {
                releases.buffers.extend(scanout_bo(&pair.old, fbs));
            }
            if pair.new.dirty.contains(PipeDirty::CURSOR) {
                releases.cursors.extend(pair.old.cursor.handle);
            }
        }
        for &surface in &summary.dirty_surfaces {
            releases
                .buffers
                .extend(surface_bo(&self.surfaces[surface.index()].old, fbs));
        }
        releases
    }

    /// Blocking path: program the hardware directly and wait for it to latch.
    fn apply_config(
        &mut self,
        summary: &CheckSummary,
        mut events: BTreeMap<ObjectId, PendingEvent>,
    ) -> Result<()> {
        let touched = self.touched_pipes(summary);
        let releases = self.releases(summary);
        let hw = std::sync::Arc::clone(&self.ctl.hw);

        for &pipe in &touched {
            let pair = &self.pipes[pipe.index()];
            if pair.new.needs_modeset() {
                if let Some(bo) = scanout_bo(&pair.old, &self.ctl.fbs) {
                    self.ctl.buffers.finish(bo);
                }
            }
            self.ctl.flips.clear_flips(pipe);
        }

        self.update_dpms(summary);

        if let Err(err) = self.program(Side::New, &touched) {
            error!(%err, "hardware programming failed, restoring previous configuration");
            self.restore_hw = true;
            return Err(err);
        }

        for &pipe in &touched {
            if self.pipes[pipe.index()].new.is_enabled() {
                hw.wait_for_vblank(pipe);
            }
        }

        for bo in releases.buffers {
            self.ctl.buffers.unpin(bo);
        }
        for bo in releases.cursors {
            self.ctl.buffers.unpin_cursor(bo);
        }

        self.publish();

        for (object, event) in std::mem::take(&mut events) {
            let old_fb = self.old_fb(object);
            let pipe = self.event_pipe(object);
            self.deliver(event, pipe, old_fb);
        }
        Ok(())
    }

    fn old_fb(&self, object: ObjectId) -> Option<crate::object::FbId> {
        match object {
            ObjectId::Pipe(p) => self.pipes[p.index()].old.fb,
            ObjectId::Surface(s) => self.surfaces[s.index()].old.fb,
            ObjectId::Sink(_) => None,
        }
    }

    /// Sinks on a mode-set pipe turn on, detached sinks turn off.
    fn update_dpms(&mut self, summary: &CheckSummary) {
        let modeset: Vec<PipeId> = summary
            .dirty_pipes
            .iter()
            .copied()
            .filter(|p| self.pipes[p.index()].new.needs_modeset())
            .collect();
        for pair in &mut self.sinks {
            match pair.new.pipe {
                None => pair.new.dpms = Dpms::Off,
                Some(pipe) if modeset.contains(&pipe) => {
                    pair.new.dpms = if self.pipes[pipe.index()].new.is_enabled() {
                        Dpms::On
                    } else {
                        Dpms::Off
                    };
                }
                Some(_) => {}
            }
        }
    }

    /// Program `side` of the transaction into the hardware for the given pipes.
    fn program(&self, side: Side, pipes: &[PipeId]) -> Result<()> {
        let hw: &dyn HardwareOps = &*self.ctl.hw;
        let fbs = &self.ctl.fbs;
        let pick = |pair: &StatePair<PipeState>| -> (PipeState, PipeState) {
            match side {
                Side::New => (pair.old.clone(), pair.new.clone()),
                Side::Old => (pair.new.clone(), pair.old.clone()),
            }
        };
        fn surface_of(
            side: Side,
            pair: &StatePair<SurfaceState>,
        ) -> (&SurfaceState, &SurfaceState) {
            match side {
                Side::New => (&pair.old, &pair.new),
                Side::Old => (&pair.new, &pair.old),
            }
        }
        fn sink_of(side: Side, pair: &StatePair<SinkState>) -> &SinkState {
            match side {
                Side::New => &pair.new,
                Side::Old => &pair.old,
            }
        }
        // The rollback replays a modeset in reverse, so both sides key off the proposed state.
        let modeset = |pipe: PipeId| self.pipes[pipe.index()].new.needs_modeset();

        // Disable before touching timings or routing.
        for &pipe in pipes {
            let (from, _) = pick(&self.pipes[pipe.index()]);
            if modeset(pipe) && from.is_enabled() {
                hw.pipe_disable(pipe)?;
            }
        }

        let routes: Vec<SinkRoute> = self
            .sinks
            .iter()
            .map(|pair| {
                let sink = sink_of(side, pair);
                SinkRoute {
                    sink: sink.id,
                    pipe: sink.pipe,
                    dpms_on: sink.dpms == Dpms::On,
                }
            })
            .collect();
        hw.route_outputs(&routes)?;

        for &pipe in pipes {
            if !modeset(pipe) {
                continue;
            }
            let (_, to) = pick(&self.pipes[pipe.index()]);
            match to.mode {
                Some(mode) => hw.pipe_mode_set(pipe, &mode, to.vrr.filter(|_| to.vrr_enabled))?,
                None => hw.pipe_off(pipe)?,
            }
        }

        for &pipe in pipes {
            let (_, to) = pick(&self.pipes[pipe.index()]);
            let dirty = self.pipes[pipe.index()].new.dirty;
            let full = modeset(pipe) || side == Side::Old;

            let mut writes = Vec::new();
            if to.is_enabled() && (full || dirty.contains(PipeDirty::FB)) {
                writes.extend(hw.plane_writes(FlipTarget::Pipe(pipe), &primary_regs(&to, fbs))?);
            }
            if to.is_enabled() && (full || dirty.contains(PipeDirty::CURSOR)) {
                writes.extend(hw.cursor_writes(pipe, &cursor_regs(&to)));
            }
            for write in writes {
                hw.write(write.reg, write.value);
            }
            if modeset(pipe) && to.is_enabled() {
                hw.pipe_enable(pipe)?;
            }

            // Disables first so the pipe never carries more planes than either state.
            let surfaces: Vec<(&SurfaceState, &SurfaceState)> = self
                .surfaces
                .iter()
                .map(|pair| surface_of(side, pair))
                .filter(|(from, to)| {
                    (full || to.dirty || from.dirty || !from.same_configuration(to))
                        && (from.pipe == Some(pipe) || to.pipe == Some(pipe))
                })
                .collect();
            for (from, to) in &surfaces {
                if from.is_visible_on(pipe) && !to.is_visible_on(pipe) {
                    self.write_surface(to.id, &SurfaceState::new(to.id))?;
                }
            }
            for (_, to) in &surfaces {
                if to.is_visible_on(pipe) {
                    self.write_surface(to.id, to)?;
                }
            }
        }
        Ok(())
    }

    fn write_surface(&self, id: SurfaceId, state: &SurfaceState) -> Result<()> {
        let hw = &*self.ctl.hw;
        for write in hw.plane_writes(FlipTarget::Surface(id), &surface_regs(state, &self.ctl.fbs))? {
            hw.write(write.reg, write.value);
        }
        Ok(())
    }

    /// Replay the old state after a failed blocking commit.
    pub(crate) fn restore_hardware(&mut self) -> Result<()> {
        let pipes: Vec<PipeId> = self
            .pipes
            .iter()
            .filter(|p| !p.new.dirty.is_empty() || p.old != p.new)
            .map(|p| p.new.id)
            .collect();
        warn!(pipes = pipes.len(), "restoring previous hardware state");
        self.program(Side::Old, &pipes)
    }

    /// Non-blocking path: one flip group per touched pipe, queued for the synchronizer.
    fn commit_nonblocking(
        &mut self,
        summary: &CheckSummary,
        mut events: BTreeMap<ObjectId, PendingEvent>,
    ) -> Result<()> {
        let hw = std::sync::Arc::clone(&self.ctl.hw);
        let fbs = &self.ctl.fbs;
        let async_fences = self.ctl.config.async_fences;

        let fence_of = |bo: Option<BoHandle>| {
            let bo = bo?;
            let fence = self.ctl.buffers.last_fence(bo)?;
            let pending = !fence.passed(self.ctl.buffers.ring_seqno(fence.ring));
            (async_fences && pending).then_some(fence)
        };

        let mut groups: Vec<Vec<FlipDescriptor>> = Vec::new();
        for pipe in self.touched_pipes(summary) {
            let pair = &self.pipes[pipe.index()];
            let seq = self.ctl.flips.next_seq();
            let dsb_timing = DsbTiming::for_commit(&*hw, &pair.old, &pair.new);
            let mut group = Vec::new();

            let dirty = pair.new.dirty;
            if dirty.intersects(PipeDirty::FB | PipeDirty::CURSOR) {
                let mut flip = FlipDescriptor::new(pipe, FlipTarget::Pipe(pipe), seq);
                let mut writes = Vec::new();
                let mut surface_addr = None;
                if dirty.contains(PipeDirty::FB) {
                    let regs = primary_regs(&pair.new, fbs);
                    writes.extend(hw.plane_writes(FlipTarget::Pipe(pipe), &regs)?);
                    surface_addr = regs.enabled.then_some(regs.surface_addr);
                    flip.old_fb = pair.old.fb;
                    flip.old_bo = scanout_bo(&pair.old, fbs);
                    flip.fence = fence_of(scanout_bo(&pair.new, fbs));
                }
                if dirty.contains(PipeDirty::CURSOR) {
                    writes.extend(hw.cursor_writes(pipe, &cursor_regs(&pair.new)));
                    flip.old_cursor_bo = pair.old.cursor.handle;
                }
                flip.stage(writes, surface_addr);
                flip.event = events.remove(&ObjectId::Pipe(pipe));
                flip.dsb_timing = dsb_timing;
                group.push(flip);
            } else if let Some(event) = events.remove(&ObjectId::Pipe(pipe)) {
                // Only surfaces changed; the pipe's event rides on the first surface flip.
                let mut flip = FlipDescriptor::new(pipe, FlipTarget::Pipe(pipe), seq);
                flip.stage(Vec::new(), None);
                flip.event = Some(event);
                group.push(flip);
            }

            for &surface in &summary.dirty_surfaces {
                let pair = &self.surfaces[surface.index()];
                if pair.new.pipe.or(pair.old.pipe) != Some(pipe) {
                    continue;
                }
                let mut flip = FlipDescriptor::new(pipe, FlipTarget::Surface(surface), seq);
                let regs = surface_regs(&pair.new, fbs);
                let writes = hw.plane_writes(FlipTarget::Surface(surface), &regs)?;
                flip.stage(writes, regs.enabled.then_some(regs.surface_addr));
                flip.old_fb = pair.old.fb;
                flip.old_bo = surface_bo(&pair.old, fbs);
                flip.fence = fence_of(surface_bo(&pair.new, fbs));
                flip.event = events.remove(&ObjectId::Surface(surface));
                flip.dsb_timing = dsb_timing;
                group.push(flip);
            }

            if !group.is_empty() {
                groups.push(group);
            }
        }

        // Objects that never reach the hardware complete right away.
        for (object, event) in std::mem::take(&mut events) {
            let pipe = self.event_pipe(object);
            self.deliver(event, pipe, None);
        }

        self.publish();

        let flips = std::sync::Arc::clone(&self.ctl.flips);
        for group in groups {
            debug!(pipe = %group[0].pipe, seq = group[0].seq, flips = group.len(), "queueing flip group");
            let ready = flips.queue(group);
            if !async_fences {
                flips.process_work();
            } else if ready {
                self.ctl.irq_tx.send(IrqEvent::FlipWork);
            }
        }
        Ok(())
    }

    /// Make the proposed state live.
    fn publish(&mut self) {
        let ctl = &mut *self.ctl;
        for pair in &self.pipes {
            let mut fresh = pair.new.duplicate(&mut ctl.fbs);
            fresh.dirty = PipeDirty::empty();
            fresh.changed = false;
            let id = fresh.id;
            ctl.flips.set_timing(id, ScanoutTiming::of(&fresh));
            let previous = std::mem::replace(&mut ctl.pipes[id.index()], fresh);
            previous.destroy(&mut ctl.fbs);
        }
        for pair in &self.surfaces {
            let mut fresh = pair.new.duplicate(&mut ctl.fbs);
            fresh.dirty = false;
            fresh.changed = false;
            let previous = std::mem::replace(&mut ctl.surfaces[fresh.id.index()], fresh);
            previous.destroy(&mut ctl.fbs);
        }
        for pair in &self.sinks {
            let fresh = pair.new.duplicate(&mut ctl.fbs);
            let previous = std::mem::replace(&mut ctl.sinks[fresh.id.index()], fresh);
            previous.destroy(&mut ctl.fbs);
        }
        ctl.bandwidth = self.bandwidth.clone();
        debug!(user_data = self.user_data, "new state published");
    }
}
