//! Validation and dirty tracking.
//!
//! `check` recomputes every derived field of the proposed state from scratch (clipping, scaler
//! assignment, primary visibility, data rates), compares it with the old state to build the dirty
//! sets and rejects configurations the hardware cannot scan out. It never touches the hardware.

use tracing::debug;

use crate::bandwidth::{self, plane_data_rate};
use crate::framebuffer::Framebuffer;
use crate::hw::ScalerMode;
use crate::mode::ModeTiming;
use crate::object::{PipeId, RefreshRange, SurfaceId};
use crate::state::{overlay_plane, DstRect, PipeDirty, PipeState, SrcRect, SurfaceState, PRIMARY_PLANE};
use crate::transaction::{CommitFlags, Transaction, CURSOR_SIZE};
use crate::{KmsError, Result};

/// Largest supported downscale factor.
const MAX_DOWNSCALE: u64 = 3;
/// Largest supported upscale factor.
const MAX_UPSCALE: u64 = 8;

/// Objects the checked transaction will reprogram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub dirty_pipes: Vec<PipeId>,
    pub dirty_surfaces: Vec<SurfaceId>,
    /// At least one pipe needs a full modeset.
    pub modeset: bool,
}

impl CheckSummary {
    pub fn is_empty(&self) -> bool {
        self.dirty_pipes.is_empty() && self.dirty_surfaces.is_empty()
    }
}

fn pipe_dirty(old: &PipeState, new: &PipeState) -> PipeDirty {
    let mut dirty = PipeDirty::empty();
    if old.mode != new.mode || old.sink_mask != new.sink_mask || old.vrr_enabled != new.vrr_enabled {
        dirty |= PipeDirty::MODE | PipeDirty::ACTIVE;
    }
    if old.fb != new.fb || old.x != new.x || old.y != new.y {
        dirty |= PipeDirty::FB;
    }
    let (a, b) = (&old.cursor, &new.cursor);
    if a.handle != b.handle || a.x != b.x || a.y != b.y || a.width != b.width || a.height != b.height {
        dirty |= PipeDirty::CURSOR;
    }
    dirty
}

/// Intersect the refresh ranges of every sink on a pipe.
fn common_refresh_range<'r>(ranges: impl Iterator<Item = Option<&'r RefreshRange>>) -> Option<RefreshRange> {
    let mut common: Option<RefreshRange> = None;
    for range in ranges {
        let range = range?;
        common = Some(match common {
            None => *range,
            Some(c) => RefreshRange {
                min_hz: c.min_hz.max(range.min_hz),
                max_hz: c.max_hz.min(range.max_hz),
            },
        });
    }
    common
}

/// Check that scaling `src` (16.16) onto `dst` pixels stays inside the supported ratios.
fn check_scale(src: u32, dst: u32) -> Result<()> {
    let src = u64::from(src);
    let dst = u64::from(dst) << 16;
    if src > dst * MAX_DOWNSCALE {
        return Err(KmsError::Range("downscale factor"));
    }
    if src * MAX_UPSCALE < dst {
        return Err(KmsError::Range("upscale factor"));
    }
    Ok(())
}

/// Whether the 16.16 source size differs from the destination size, after rotation.
fn is_scaled(surface: &SurfaceState) -> bool {
    let (w, h) = if surface.rotation.swaps_axes() {
        (surface.src.h, surface.src.w)
    } else {
        (surface.src.w, surface.src.h)
    };
    u64::from(w) != u64::from(surface.dst.w) << 16
        || u64::from(h) != u64::from(surface.dst.h) << 16
}

/// Clip a surface against the active area of `mode`. Returns the visible source and destination
/// rectangles, or `None` if nothing is visible.
fn clip(surface: &SurfaceState, mode: &ModeTiming) -> Option<(SrcRect, DstRect)> {
    let dst = surface.dst;
    if dst.w == 0 || dst.h == 0 {
        return None;
    }
    let left = i64::from(dst.x).max(0);
    let top = i64::from(dst.y).max(0);
    let right = (i64::from(dst.x) + i64::from(dst.w)).min(i64::from(mode.hdisplay));
    let bottom = (i64::from(dst.y) + i64::from(dst.h)).min(i64::from(mode.vdisplay));
    if right <= left || bottom <= top {
        return None;
    }

    // Source extent along the destination axes.
    let (src_w, src_h) = if surface.rotation.swaps_axes() {
        (surface.src.h, surface.src.w)
    } else {
        (surface.src.w, surface.src.h)
    };
    let scale = |offset: i64, extent: u32, total: u32| -> u32 {
        (offset as u64 * u64::from(extent) / u64::from(total)) as u32
    };
    let clip_left = left - i64::from(dst.x);
    let clip_top = top - i64::from(dst.y);
    let visible_w = (right - left) as u32;
    let visible_h = (bottom - top) as u32;

    let (sx, sw) = (scale(clip_left, src_w, dst.w), scale(i64::from(visible_w), src_w, dst.w));
    let (sy, sh) = (scale(clip_top, src_h, dst.h), scale(i64::from(visible_h), src_h, dst.h));
    let (sx, sy, sw, sh) = if surface.rotation.swaps_axes() {
        (sy, sx, sh, sw)
    } else {
        (sx, sy, sw, sh)
    };

    Some((
        SrcRect {
            x: surface.src.x + sx,
            y: surface.src.y + sy,
            w: sw,
            h: sh,
        },
        DstRect {
            x: left as i32,
            y: top as i32,
            w: visible_w,
            h: visible_h,
        },
    ))
}

impl Transaction<'_> {
    /// Validate the proposed state and compute what must be programmed.
    pub fn check(&mut self, flags: CommitFlags) -> Result<CheckSummary> {
        self.flags = flags;
        match self.check_inner(flags) {
            Ok(summary) => {
                self.dirty = !summary.is_empty();
                debug!(
                    dirty_pipes = summary.dirty_pipes.len(),
                    dirty_surfaces = summary.dirty_surfaces.len(),
                    modeset = summary.modeset,
                    "check passed"
                );
                Ok(summary)
            }
            Err(err) => {
                if err == KmsError::TryAgain {
                    self.ctl.stats.inc_try_again();
                } else {
                    self.ctl.stats.inc_check_failures();
                }
                debug!(%err, "check failed");
                Err(err)
            }
        }
    }

    fn check_inner(&mut self, flags: CommitFlags) -> Result<CheckSummary> {
        for pair in &mut self.pipes {
            pair.new.dirty = pipe_dirty(&pair.old, &pair.new);
        }

        self.check_pipes(flags)?;
        self.check_sink_conflicts()?;
        self.check_surfaces()?;
        self.assign_planes()?;

        let mut summary = CheckSummary::default();
        for pair in &self.surfaces {
            if pair.new.dirty {
                summary.dirty_surfaces.push(pair.new.id);
            }
        }
        for pair in &self.pipes {
            if !pair.new.dirty.is_empty() {
                summary.dirty_pipes.push(pair.new.id);
                summary.modeset |= pair.new.needs_modeset();
            }
        }

        if flags.contains(CommitFlags::NONBLOCK) {
            for pipe in self.touched_pipes(&summary) {
                if self.ctl.flips.has_pending(pipe) {
                    return Err(KmsError::Busy("previous flip has not completed"));
                }
            }
        }

        let mut bandwidth = self.ctl.bandwidth.clone();
        for pair in &self.pipes {
            bandwidth.update(&pair.new);
        }
        if !summary.is_empty() {
            bandwidth::check(&*self.ctl.hw, &self.ctl.bandwidth, &bandwidth)?;
        }
        self.bandwidth = bandwidth;

        Ok(summary)
    }

    /// Pipes touched by a dirty pipe or surface, in id order.
    pub(crate) fn touched_pipes(&self, summary: &CheckSummary) -> Vec<PipeId> {
        let mut mask = 0u32;
        for pipe in &summary.dirty_pipes {
            mask |= 1 << pipe.0;
        }
        for surface in &summary.dirty_surfaces {
            let pair = &self.surfaces[surface.index()];
            for pipe in [pair.old.pipe, pair.new.pipe].into_iter().flatten() {
                mask |= 1 << pipe.0;
            }
        }
        (0..self.pipes.len() as u8)
            .map(PipeId)
            .filter(|p| mask & (1 << p.0) != 0)
            .collect()
    }

    fn check_pipes(&mut self, flags: CommitFlags) -> Result<()> {
        for index in 0..self.pipes.len() {
            let pair = &self.pipes[index];
            let id = pair.new.id;

            if pair.new.needs_modeset() {
                if flags.contains(CommitFlags::NONBLOCK) {
                    return Err(KmsError::TryAgain);
                }
                if !flags.contains(CommitFlags::ALLOW_MODESET) {
                    return Err(KmsError::Invalid("modeset not allowed"));
                }
            }
            if !pair.new.changed && pair.new.dirty.is_empty() {
                continue;
            }

            let vrr = self.check_pipe(&pair.new)?;
            self.pipes[index].new.vrr = vrr;
            debug!(pipe = %id, dirty = ?self.pipes[index].new.dirty, "pipe checked");
        }
        Ok(())
    }

    /// Validate one proposed pipe and return its VRR window.
    fn check_pipe(&self, pipe: &PipeState) -> Result<Option<crate::mode::VrrTiming>> {
        if pipe.cursor.handle.is_some()
            && (pipe.cursor.width != CURSOR_SIZE || pipe.cursor.height != CURSOR_SIZE)
        {
            return Err(KmsError::Invalid("cursor must be 64x64"));
        }

        let Some(mode) = pipe.mode else {
            return Ok(None);
        };
        let fb = pipe
            .fb
            .and_then(|fb| self.ctl.fbs.get_any(fb))
            .ok_or(KmsError::Invalid("enabled pipe needs a framebuffer"))?;
        if pipe.sink_mask == 0 {
            return Err(KmsError::Invalid("enabled pipe needs a sink"));
        }
        check_scanout_fits(fb, &mode, pipe.x, pipe.y)?;

        if !pipe.vrr_enabled {
            return Ok(None);
        }
        let sinks = &self.ctl.layout.sinks;
        let range = common_refresh_range(
            (0..sinks.len())
                .filter(|i| pipe.sink_mask & (1 << i) != 0)
                .map(|i| sinks[i].refresh_range.as_ref()),
        );
        range
            .and_then(|range| mode.vrr_timing(range))
            .map(Some)
            .ok_or(KmsError::Invalid("sink has no usable refresh range"))
    }

    fn check_sink_conflicts(&self) -> Result<()> {
        for (i, a) in self.pipes.iter().enumerate() {
            for b in &self.pipes[i + 1..] {
                if a.new.sink_mask & b.new.sink_mask != 0 {
                    return Err(KmsError::Invalid("sink claimed by two pipes"));
                }
                if a.new.encoder_mask & b.new.encoder_mask != 0 {
                    return Err(KmsError::Invalid("encoder claimed by two pipes"));
                }
            }
        }
        Ok(())
    }

    fn check_surfaces(&mut self) -> Result<()> {
        for index in 0..self.surfaces.len() {
            let (visible, data_rate) = {
                let surface = &self.surfaces[index].new;
                let pipe = surface.pipe.map(|p| &self.pipes[p.index()].new);
                let fb = surface.fb.and_then(|fb| self.ctl.fbs.get_any(fb));
                match (pipe.and_then(|p| p.mode), fb) {
                    (Some(mode), Some(fb)) => {
                        if surface.changed {
                            check_surface(surface, fb)?;
                        }
                        match clip(surface, &mode) {
                            Some((src, dst)) => {
                                let cpp = fb.pixel_format().map_or(4, |f| f.bytes_per_pixel());
                                let rate = plane_data_rate(
                                    &mode,
                                    cpp,
                                    (src.w >> 16, src.h >> 16),
                                    (dst.w, dst.h),
                                );
                                (Some((src, dst)), rate)
                            }
                            None => (None, 0),
                        }
                    }
                    _ => (None, 0),
                }
            };

            let surface = &mut self.surfaces[index].new;
            let needs_scaler = visible.is_some() && is_scaled(surface);
            surface.visible = visible.is_some();
            let (src, dst) = visible.unwrap_or_default();
            surface.clipped_src = src;
            surface.clipped_dst = dst;
            surface.data_rate = data_rate;
            surface.scaler = needs_scaler.then_some(ScalerMode::Normal);
        }
        Ok(())
    }

    /// Scalers, primary visibility, plane masks and data rates of every pipe.
    fn assign_planes(&mut self) -> Result<()> {
        for index in 0..self.pipes.len() {
            let id = self.pipes[index].new.id;
            let mode = self.pipes[index].new.mode;

            let mut scaler_users = 0u64;
            let mut covering = false;
            for pair in &self.surfaces {
                let s = &pair.new;
                if !s.is_visible_on(id) {
                    continue;
                }
                if s.scaler.is_some() {
                    scaler_users |= 1 << s.id.index();
                }
                if let Some(mode) = mode {
                    let full = DstRect {
                        x: 0,
                        y: 0,
                        w: mode.hdisplay,
                        h: mode.vdisplay,
                    };
                    covering |= s.dst == full;
                }
            }

            let available = self.ctl.hw.num_scalers(id);
            if scaler_users.count_ones() > available {
                return Err(KmsError::Invalid("not enough scalers"));
            }
            let scaler_hq = scaler_users.count_ones() == 1 && available > 1;
            if scaler_hq {
                for pair in &mut self.surfaces {
                    if pair.new.is_visible_on(id) && pair.new.scaler.is_some() {
                        pair.new.scaler = Some(ScalerMode::HighQuality);
                    }
                }
            }

            let primary_rate = match (mode, self.pipes[index].new.fb) {
                (Some(mode), Some(fb)) if !covering => {
                    let cpp = self
                        .ctl
                        .fbs
                        .get_any(fb)
                        .and_then(Framebuffer::pixel_format)
                        .map_or(4, |f| f.bytes_per_pixel());
                    Some(plane_data_rate(
                        &mode,
                        cpp,
                        (mode.hdisplay, mode.vdisplay),
                        (mode.hdisplay, mode.vdisplay),
                    ))
                }
                _ => None,
            };

            let surfaces = &self.surfaces;
            let pipe = &mut self.pipes[index].new;
            pipe.scaler_users = scaler_users;
            pipe.scaler_hq = scaler_hq;
            pipe.plane_data_rate.fill(0);
            pipe.active_planes = 0;
            if let Some(rate) = primary_rate {
                pipe.active_planes |= 1 << PRIMARY_PLANE;
                pipe.plane_data_rate[PRIMARY_PLANE] = rate;
            }
            for pair in surfaces {
                if pair.new.is_visible_on(id) {
                    let plane = overlay_plane(pair.new.id);
                    pipe.active_planes |= 1 << plane;
                    if let Some(slot) = pipe.plane_data_rate.get_mut(plane) {
                        *slot = pair.new.data_rate;
                    }
                }
            }

            if covering != self.pipes[index].old.primary_disabled {
                self.pipes[index].new.dirty |= PipeDirty::FB;
            }
            self.pipes[index].new.primary_disabled = covering;
        }

        for pair in &mut self.surfaces {
            pair.new.dirty = new_dirty(&pair.old, &pair.new);
        }
        Ok(())
    }
}

/// A surface is reprogrammed when its configuration or its derived scanout parameters changed.
fn new_dirty(old: &SurfaceState, new: &SurfaceState) -> bool {
    !old.same_configuration(new)
        || old.visible != new.visible
        || old.clipped_src != new.clipped_src
        || old.clipped_dst != new.clipped_dst
        || old.scaler != new.scaler
}

fn check_scanout_fits(fb: &Framebuffer, mode: &ModeTiming, x: u32, y: u32) -> Result<()> {
    if fb.pixel_format().is_none() {
        return Err(KmsError::Invalid("unsupported pixel format"));
    }
    let right = u64::from(x) + u64::from(mode.hdisplay);
    let bottom = u64::from(y) + u64::from(mode.vdisplay);
    if right > u64::from(fb.width) || bottom > u64::from(fb.height) {
        return Err(KmsError::NoSpace("framebuffer too small for mode and pan offset"));
    }
    Ok(())
}

fn check_surface(surface: &SurfaceState, fb: &Framebuffer) -> Result<()> {
    if fb.pixel_format().is_none() {
        return Err(KmsError::Invalid("unsupported pixel format"));
    }
    let src = surface.src;
    if u64::from(src.x) + u64::from(src.w) > u64::from(fb.width) << 16
        || u64::from(src.y) + u64::from(src.h) > u64::from(fb.height) << 16
    {
        return Err(KmsError::NoSpace("source rectangle exceeds the framebuffer"));
    }
    let (src_w, src_h) = if surface.rotation.swaps_axes() {
        (src.h, src.w)
    } else {
        (src.w, src.h)
    };
    check_scale(src_w, surface.dst.w)?;
    check_scale(src_h, surface.dst.h)?;
    Ok(())
}
