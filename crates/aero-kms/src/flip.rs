//! Flip descriptors and the vblank synchronizer.
//!
//! A non-blocking commit turns every dirty pipe and surface into a [`FlipDescriptor`] holding the
//! register writes to arm. All descriptors of one commit share a flip sequence number and are
//! queued together on a FIFO. The head group is armed only once every member's buffer fence has
//! passed, inside a vblank evasion window, so a single vblank latches the whole frame. Armed flips
//! complete when the frame counter reaches the frame after the one they were armed in.
//!
//! Only [`FlipQueues`] is shared with the interrupt consumer, and its lock is never held across a
//! hardware wait. Arming is serialized by a separate lock that is held through evasion, so one
//! group at a time travels from the queue to the hardware, and teardown waits for it to land.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::DisplayConfig;
use crate::dsb::{self, Dsb, DsbCompletion, DsbTiming};
use crate::event::PendingEvent;
use crate::hw::{BufferManager, Fence, HardwareOps, RegWrite};
use crate::object::{BoHandle, FbId, ObjectId, PipeId, RingId, SurfaceId};
use crate::regs::dsb::ENGINES;
use crate::stats::KmsStats;
use crate::vblank::{evade, read_frame_count, ScanoutTiming, VblankWaiter};

/// Command buffer engine used to arm flips.
const FLIP_ENGINE: u8 = 0;

/// Double-buffered register block a flip arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlipTarget {
    /// Primary plane and cursor of a pipe.
    Pipe(PipeId),
    Surface(SurfaceId),
}

impl FlipTarget {
    pub fn object(self) -> ObjectId {
        match self {
            FlipTarget::Pipe(pipe) => ObjectId::Pipe(pipe),
            FlipTarget::Surface(surface) => ObjectId::Surface(surface),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipState {
    Created,
    /// Register values staged, nothing written yet.
    Armed,
    WaitingForFence,
    Queued,
    /// Written to the double-buffered registers.
    Flipped,
    Completed,
    Finalized,
}

/// One pending arm-and-complete cycle of a pipe or surface.
#[derive(Debug)]
pub struct FlipDescriptor {
    pub pipe: PipeId,
    pub target: FlipTarget,
    /// Flip sequence shared by every descriptor of one commit.
    pub seq: u32,
    pub writes: Vec<RegWrite>,
    /// Scanout address the writes program, checked against the latched address on completion.
    pub surface_addr: Option<u32>,
    pub fence: Option<Fence>,
    pub event: Option<PendingEvent>,
    pub old_fb: Option<FbId>,
    /// Scanout buffer to unpin once the flip has latched.
    pub old_bo: Option<BoHandle>,
    pub old_cursor_bo: Option<BoHandle>,
    /// Command buffer timing, when the flip may be armed through one.
    pub dsb_timing: Option<DsbTiming>,
    /// Frame count at which the flip is visible.
    pub vbl_count: u32,
    state: FlipState,
}

impl FlipDescriptor {
    pub fn new(pipe: PipeId, target: FlipTarget, seq: u32) -> Self {
        Self {
            pipe,
            target,
            seq,
            writes: Vec::new(),
            surface_addr: None,
            fence: None,
            event: None,
            old_fb: None,
            old_bo: None,
            old_cursor_bo: None,
            dsb_timing: None,
            vbl_count: 0,
            state: FlipState::Created,
        }
    }

    /// Stage the register values to arm.
    pub fn stage(&mut self, writes: Vec<RegWrite>, surface_addr: Option<u32>) {
        self.writes = writes;
        self.surface_addr = surface_addr;
        self.state = FlipState::Armed;
    }

    pub fn state(&self) -> FlipState {
        self.state
    }

    fn is_ready(&self) -> bool {
        self.fence.is_none()
    }
}

#[derive(Debug, Default)]
struct FlipQueues {
    /// Flips waiting to be written, in commit order.
    pending: VecDeque<FlipDescriptor>,
    /// Flips written to hardware and waiting for their vblank, at most one per target.
    scheduled: BTreeMap<FlipTarget, FlipDescriptor>,
    /// Pipe and sequence of the group taken off `pending` and not yet in `scheduled`.
    in_flight: Option<(PipeId, u32)>,
}

impl FlipQueues {
    fn head_ready(&self) -> bool {
        let Some(head) = self.pending.front() else {
            return false;
        };
        self.pending
            .iter()
            .take_while(|flip| flip.seq == head.seq)
            .all(FlipDescriptor::is_ready)
    }

    fn take_ready_group(&mut self) -> Option<Vec<FlipDescriptor>> {
        if !self.head_ready() {
            return None;
        }
        let head = self.pending.front()?;
        let (pipe, seq) = (head.pipe, head.seq);
        let len = self.pending.iter().take_while(|flip| flip.seq == seq).count();
        self.in_flight = Some((pipe, seq));
        Some(self.pending.drain(..len).collect())
    }
}

/// Per-controller flip queue, arming and completion logic.
pub struct FlipSynchronizer {
    hw: Arc<dyn HardwareOps>,
    buffers: Arc<dyn BufferManager>,
    stats: Arc<KmsStats>,
    config: DisplayConfig,
    waiter: VblankWaiter,
    queues: Mutex<FlipQueues>,
    /// Held from taking a group off the queue until it is scheduled.
    arming: Mutex<()>,
    timings: Mutex<Vec<Option<ScanoutTiming>>>,
    completions: Vec<Vec<DsbCompletion>>,
    next_seq: AtomicU32,
}

impl std::fmt::Debug for FlipSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlipSynchronizer")
            .field("config", &self.config)
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FlipSynchronizer {
    pub fn new(
        hw: Arc<dyn HardwareOps>,
        buffers: Arc<dyn BufferManager>,
        stats: Arc<KmsStats>,
        config: DisplayConfig,
        pipes: usize,
    ) -> Self {
        Self {
            hw,
            buffers,
            stats,
            config,
            waiter: VblankWaiter::new(),
            queues: Mutex::new(FlipQueues::default()),
            arming: Mutex::new(()),
            timings: Mutex::new(vec![None; pipes]),
            completions: (0..pipes)
                .map(|_| (0..ENGINES).map(|_| DsbCompletion::new()).collect())
                .collect(),
            next_seq: AtomicU32::new(1),
        }
    }

    pub fn waiter(&self) -> &VblankWaiter {
        &self.waiter
    }

    /// Allocate the flip sequence of a new commit.
    pub fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Scanout timing of `pipe`, `None` while it is disabled.
    pub fn timing(&self, pipe: PipeId) -> Option<ScanoutTiming> {
        lock(&self.timings).get(pipe.index()).copied().flatten()
    }

    pub fn set_timing(&self, pipe: PipeId, timing: Option<ScanoutTiming>) {
        if let Some(slot) = lock(&self.timings).get_mut(pipe.index()) {
            *slot = timing;
        }
    }

    /// Completion object signalled by the interrupt handler of one command buffer engine.
    pub fn completion(&self, pipe: PipeId, engine: u8) -> Option<&DsbCompletion> {
        self.completions
            .get(pipe.index())?
            .get(usize::from(engine))
    }

    /// Frame count of `pipe` as seen by completion events.
    pub fn frame_count(&self, pipe: PipeId) -> u32 {
        match self.timing(pipe) {
            Some(timing) => read_frame_count(
                &*self.hw,
                pipe,
                &timing.mode,
                self.config.frame_counter_retries,
            ),
            None => self.waiter.last_seq(pipe),
        }
    }

    fn has_flipped(&self, flip: &FlipDescriptor, vbl: u32) -> bool {
        if !self.hw.frame_counter_style().passed(vbl, flip.vbl_count) {
            return false;
        }
        match (flip.surface_addr, self.hw.latched_surface(flip.target)) {
            (Some(want), Some(live)) if want != live => {
                debug!(
                    pipe = %flip.pipe,
                    seq = flip.seq,
                    want,
                    live,
                    "frame counter passed but surface not latched yet"
                );
                false
            }
            _ => true,
        }
    }

    /// Queue the descriptors of one commit. Returns true if the head of the queue is ready to
    /// be armed.
    pub fn queue(&self, flips: Vec<FlipDescriptor>) -> bool {
        let count = flips.len() as u64;
        let mut queues = lock(&self.queues);
        for mut flip in flips {
            flip.state = if flip.is_ready() {
                FlipState::Queued
            } else {
                FlipState::WaitingForFence
            };
            debug!(pipe = %flip.pipe, seq = flip.seq, target = ?flip.target, "flip queued");
            queues.pending.push_back(flip);
        }
        self.stats.add_flips_queued(count);
        queues.head_ready()
    }

    /// Whether `pipe` has a queued flip, one being armed, or an armed one that has not latched
    /// yet.
    pub fn has_pending(&self, pipe: PipeId) -> bool {
        let vbl = self.frame_count(pipe);
        let queues = lock(&self.queues);
        queues.in_flight.is_some_and(|(p, _)| p == pipe)
            || queues.pending.iter().any(|flip| flip.pipe == pipe)
            || queues
                .scheduled
                .values()
                .any(|flip| flip.pipe == pipe && !self.has_flipped(flip, vbl))
    }

    /// Vblank interrupt consumer: wake waiters and complete flips that have latched.
    pub fn handle_vblank(&self, pipe: PipeId, seq: u32) {
        self.waiter.notify(pipe, seq);

        let vbl = self.frame_count(pipe);
        let done: Vec<FlipDescriptor> = {
            let mut queues = lock(&self.queues);
            let targets: Vec<FlipTarget> = queues
                .scheduled
                .values()
                .filter(|flip| flip.pipe == pipe && self.has_flipped(flip, vbl))
                .map(|flip| flip.target)
                .collect();
            targets
                .iter()
                .filter_map(|target| queues.scheduled.remove(target))
                .collect()
        };

        for mut flip in done {
            self.complete(&mut flip);
            self.finish(flip);
        }
    }

    /// Clear every fence on `ring` that `seqno` has passed. Returns true if the head group became
    /// ready.
    pub fn notify_ring(&self, ring: RingId, seqno: u32) -> bool {
        let mut queues = lock(&self.queues);
        for flip in queues.pending.iter_mut() {
            if flip.fence.is_some_and(|f| f.ring == ring && f.passed(seqno)) {
                flip.fence = None;
                flip.state = FlipState::Queued;
            }
        }
        queues.head_ready()
    }

    /// Acknowledge a command buffer engine interrupt.
    pub fn handle_command_buffer_irq(&self, pipe: PipeId, engine: u8) {
        let Some(completion) = self.completion(pipe, engine) else {
            warn!(pipe = %pipe, engine, "interrupt from unknown command buffer engine");
            return;
        };
        if dsb::irq_handler(&*self.hw, pipe, engine, completion) != 0 {
            self.stats.inc_command_buffer_errors();
        }
    }

    /// Abandon every fence wait and complete all queued flips in queue order. Flips already in
    /// the hardware latch normally. Returns the number of flips completed.
    pub fn device_reset(&self) -> usize {
        let _arming = lock(&self.arming);
        let flips: Vec<FlipDescriptor> = lock(&self.queues).pending.drain(..).collect();
        let count = flips.len();
        if count > 0 {
            warn!(flips = count, "device reset, completing queued flips");
        }
        for flip in flips {
            self.abandon(flip);
        }
        count
    }

    /// Tear down every flip of `pipe`: armed flips first, then queued flips in queue order. A
    /// group being armed is waited for and torn down with the armed flips.
    pub fn clear_flips(&self, pipe: PipeId) -> usize {
        let _arming = lock(&self.arming);
        let (scheduled, pending) = {
            let mut queues = lock(&self.queues);
            let targets: Vec<FlipTarget> = queues
                .scheduled
                .values()
                .filter(|flip| flip.pipe == pipe)
                .map(|flip| flip.target)
                .collect();
            let scheduled: Vec<FlipDescriptor> = targets
                .iter()
                .filter_map(|target| queues.scheduled.remove(target))
                .collect();

            let (pending, keep): (VecDeque<_>, VecDeque<_>) = mem::take(&mut queues.pending)
                .into_iter()
                .partition(|flip| flip.pipe == pipe);
            queues.pending = keep;
            (scheduled, pending)
        };

        let count = scheduled.len() + pending.len();
        for mut flip in scheduled {
            self.complete(&mut flip);
            self.finish(flip);
        }
        for flip in pending {
            self.abandon(flip);
        }
        count
    }

    /// Arm every ready group at the head of the queue.
    pub fn process_work(&self) {
        let _arming = lock(&self.arming);
        loop {
            let group = {
                let mut queues = lock(&self.queues);
                self.refresh_fences(&mut queues);
                match queues.take_ready_group() {
                    Some(group) => group,
                    None => return,
                }
            };
            self.schedule(group);
        }
    }

    /// Fences whose ring passed without a seqno interrupt reaching us.
    fn refresh_fences(&self, queues: &mut FlipQueues) {
        let Some(seq) = queues.pending.front().map(|flip| flip.seq) else {
            return;
        };
        for flip in queues.pending.iter_mut().take_while(|flip| flip.seq == seq) {
            if let Some(fence) = flip.fence {
                if fence.passed(self.buffers.ring_seqno(fence.ring)) {
                    flip.fence = None;
                    flip.state = FlipState::Queued;
                }
            }
        }
    }

    fn schedule(&self, group: Vec<FlipDescriptor>) {
        let Some(pipe) = group.first().map(|flip| flip.pipe) else {
            return;
        };
        let Some(timing) = self.timing(pipe) else {
            // Nothing scans out: the flips are trivially complete.
            lock(&self.queues).in_flight = None;
            for mut flip in group {
                self.complete(&mut flip);
                self.finish(flip);
            }
            return;
        };

        let evasion = evade(
            &*self.hw,
            &self.waiter,
            pipe,
            &timing,
            self.config.vblank_evasion_usecs,
            self.config.vblank_evasion_timeout,
        );
        if evasion.missed {
            self.stats.inc_vblank_evasion_misses();
        }

        let style = self.hw.frame_counter_style();
        let vbl = read_frame_count(&*self.hw, pipe, &timing.mode, self.config.frame_counter_retries);
        self.write_group(pipe, &group);
        let vbl_count = style.next(vbl);
        debug!(pipe = %pipe, seq = group[0].seq, scanline = evasion.scanline, vbl_count, "flips armed");

        let mut replaced = Vec::new();
        {
            let mut queues = lock(&self.queues);
            queues.in_flight = None;
            for mut flip in group {
                flip.vbl_count = vbl_count;
                flip.state = FlipState::Flipped;
                if let Some(mut previous) = queues.scheduled.remove(&flip.target) {
                    if !style.passed(vbl, previous.vbl_count) {
                        // The previous buffer is still on screen; release it after this flip.
                        mem::swap(&mut flip.old_fb, &mut previous.old_fb);
                        mem::swap(&mut flip.old_bo, &mut previous.old_bo);
                        mem::swap(&mut flip.old_cursor_bo, &mut previous.old_cursor_bo);
                    }
                    replaced.push(previous);
                }
                queues.scheduled.insert(flip.target, flip);
            }
        }

        for mut previous in replaced {
            self.complete(&mut previous);
            self.finish(previous);
        }
    }

    fn write_group(&self, pipe: PipeId, group: &[FlipDescriptor]) {
        let writes = || group.iter().flat_map(|flip| flip.writes.iter().copied());
        if self.config.use_command_buffer && self.hw.has_command_buffer() {
            if let Some(timing) = group.iter().find_map(|flip| flip.dsb_timing) {
                match self.write_batched(pipe, timing, writes()) {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(pipe = %pipe, %err, "command buffer unavailable, writing directly");
                    }
                }
            }
        }
        for write in writes() {
            self.hw.write(write.reg, write.value);
        }
    }

    fn write_batched(
        &self,
        pipe: PipeId,
        timing: DsbTiming,
        writes: impl Iterator<Item = RegWrite> + Clone,
    ) -> crate::Result<()> {
        let mut dsb = Dsb::prepare(pipe, FLIP_ENGINE, writes.clone().count() + 8, timing);
        for write in writes {
            dsb.reg_write(write.reg, write.value);
        }
        dsb.finish(&*self.hw)?;
        // Evasion already placed us before the latch point.
        dsb.commit(&*self.hw, false)?;
        self.stats.inc_command_buffers_committed();
        if !dsb.wait(&*self.hw, self.config.command_buffer_timeout) {
            self.stats.inc_command_buffer_timeouts();
        }
        Ok(())
    }

    fn complete(&self, flip: &mut FlipDescriptor) {
        if let Some(event) = flip.event.take() {
            let sequence = self.frame_count(flip.pipe);
            event.deliver(sequence, self.hw.vblank_timestamp(flip.pipe), flip.old_fb);
        }
        flip.state = FlipState::Completed;
    }

    fn finish(&self, mut flip: FlipDescriptor) {
        if let Some(bo) = flip.old_bo.take() {
            self.buffers.unpin(bo);
        }
        if let Some(bo) = flip.old_cursor_bo.take() {
            self.buffers.unpin_cursor(bo);
        }
        flip.state = FlipState::Finalized;
        self.stats.inc_flips_completed();
        debug!(pipe = %flip.pipe, seq = flip.seq, target = ?flip.target, "flip finished");
    }

    /// Complete a flip that never reached the hardware.
    fn abandon(&self, mut flip: FlipDescriptor) {
        if flip.fence.take().is_some() {
            self.stats.inc_flips_abandoned();
        }
        self.complete(&mut flip);
        self.finish(flip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_group_waits_for_every_member_fence() {
        let mut queues = FlipQueues::default();
        let mut a = FlipDescriptor::new(PipeId(0), FlipTarget::Pipe(PipeId(0)), 1);
        let mut b = FlipDescriptor::new(PipeId(0), FlipTarget::Surface(SurfaceId(0)), 1);
        let c = FlipDescriptor::new(PipeId(1), FlipTarget::Pipe(PipeId(1)), 2);
        b.fence = Some(Fence {
            ring: RingId(0),
            seqno: 10,
        });
        a.stage(Vec::new(), None);
        queues.pending.extend([a, b, c]);

        assert!(!queues.head_ready());
        assert!(queues.take_ready_group().is_none());

        queues.pending[1].fence = None;
        let group = queues.take_ready_group().unwrap();
        assert_eq!(group.len(), 2);
        assert!(group.iter().all(|flip| flip.seq == 1));
        assert_eq!(queues.pending.len(), 1);
        assert_eq!(queues.in_flight, Some((PipeId(0), 1)));
    }

    #[test]
    fn staging_marks_the_descriptor_armed() {
        let mut flip = FlipDescriptor::new(PipeId(0), FlipTarget::Pipe(PipeId(0)), 3);
        assert_eq!(flip.state(), FlipState::Created);
        flip.stage(vec![RegWrite::new(0x7019c, 0x1000)], Some(0x1000));
        assert_eq!(flip.state(), FlipState::Armed);
        assert_eq!(flip.target.object(), ObjectId::Pipe(PipeId(0)));
    }
}
