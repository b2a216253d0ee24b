//! Per-controller context.
//!
//! Everything that used to be driver-wide (the pending flip list, counters, the event space) is a
//! field of [`DisplayController`] and lives exactly as long as it does.

use std::fmt;
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::bandwidth::BandwidthState;
use crate::config::DisplayConfig;
use crate::event::EventQueue;
use crate::flip::FlipSynchronizer;
use crate::framebuffer::{FbTable, Framebuffer};
use crate::hw::{BufferManager, HardwareOps};
use crate::irq::{self, IrqEvent, IrqSender};
use crate::object::{DisplayLayout, FbId, ObjectId, PipeId, SinkId, SurfaceId};
use crate::state::{PipeState, SinkState, SurfaceState};
use crate::stats::{KmsStats, KmsStatsSnapshot};
use crate::transaction::Transaction;
use crate::{KmsError, Result};

/// One display controller: live object state, framebuffers, the flip synchronizer and the
/// interrupt channel feeding it.
///
/// Transactions borrow the controller mutably, so at most one is open at a time. The flip
/// synchronizer, the event queue and the interrupt sender are shared with the interrupt consumer
/// and may be used from other threads.
pub struct DisplayController {
    pub(crate) layout: DisplayLayout,
    pub(crate) config: DisplayConfig,
    pub(crate) hw: Arc<dyn HardwareOps>,
    pub(crate) buffers: Arc<dyn BufferManager>,
    pub(crate) fbs: FbTable,
    pub(crate) pipes: Vec<PipeState>,
    pub(crate) surfaces: Vec<SurfaceState>,
    pub(crate) sinks: Vec<SinkState>,
    pub(crate) bandwidth: BandwidthState,
    pub(crate) flips: Arc<FlipSynchronizer>,
    pub(crate) events: Arc<EventQueue>,
    pub(crate) stats: Arc<KmsStats>,
    pub(crate) irq_tx: IrqSender,
    /// Consumer half, taken by [`DisplayController::spawn_flip_worker`].
    irq_rx: Mutex<Option<Receiver<IrqEvent>>>,
}

impl fmt::Debug for DisplayController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayController")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("pipes", &self.pipes)
            .field("surfaces", &self.surfaces)
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DisplayController {
    pub fn new(
        layout: DisplayLayout,
        config: DisplayConfig,
        hw: Arc<dyn HardwareOps>,
        buffers: Arc<dyn BufferManager>,
    ) -> Result<Self> {
        layout.validate()?;
        config.validate()?;

        let pipe_count = usize::from(layout.pipes);
        let surface_count = layout.surfaces.len();
        let stats = Arc::new(KmsStats::new());
        let (tx, rx) = sync_channel(config.irq_queue_depth);
        let flips = Arc::new(FlipSynchronizer::new(
            Arc::clone(&hw),
            Arc::clone(&buffers),
            Arc::clone(&stats),
            config.clone(),
            pipe_count,
        ));

        info!(
            pipes = pipe_count,
            surfaces = surface_count,
            sinks = layout.sinks.len(),
            command_buffer = hw.has_command_buffer(),
            "display controller attached"
        );

        Ok(Self {
            pipes: layout
                .pipe_ids()
                .map(|id| PipeState::new(id, surface_count))
                .collect(),
            surfaces: layout.surface_ids().map(SurfaceState::new).collect(),
            sinks: layout.sink_ids().map(SinkState::new).collect(),
            bandwidth: BandwidthState::new(pipe_count),
            fbs: FbTable::new(),
            events: Arc::new(EventQueue::new(config.event_space)),
            irq_tx: IrqSender::new(tx, Arc::clone(&stats)),
            irq_rx: Mutex::new(Some(rx)),
            flips,
            stats,
            layout,
            config,
            hw,
            buffers,
        })
    }

    /// Open a transaction on a snapshot of the live state.
    pub fn begin(&mut self, user_data: u64) -> Transaction<'_> {
        Transaction::begin(self, user_data)
    }

    pub fn layout(&self) -> &DisplayLayout {
        &self.layout
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    /// Register a framebuffer. The caller holds one reference until
    /// [`DisplayController::remove_framebuffer`].
    pub fn add_framebuffer(&mut self, fb: Framebuffer) -> Result<FbId> {
        if fb.width == 0 || fb.height == 0 {
            return Err(KmsError::Invalid("framebuffer has zero size"));
        }
        let id = self.fbs.add(fb);
        debug!(fb = id.0, width = fb.width, height = fb.height, "framebuffer added");
        Ok(id)
    }

    /// Drop the caller's reference. States still scanning the framebuffer out keep it alive.
    pub fn remove_framebuffer(&mut self, id: FbId) -> Result<()> {
        if !self.fbs.remove(id) {
            return Err(KmsError::UnknownFramebuffer(id.0));
        }
        debug!(fb = id.0, refs = self.fbs.refcount(id), "framebuffer removed");
        Ok(())
    }

    pub fn framebuffer(&self, id: FbId) -> Option<&Framebuffer> {
        self.fbs.lookup(id)
    }

    /// References held on `id` by the creator and by every state object, live or proposed.
    pub fn framebuffer_refcount(&self, id: FbId) -> u32 {
        self.fbs.refcount(id)
    }

    pub fn pipe_state(&self, pipe: PipeId) -> Result<&PipeState> {
        self.pipes
            .get(pipe.index())
            .ok_or(KmsError::NotFound(ObjectId::Pipe(pipe)))
    }

    pub fn surface_state(&self, surface: SurfaceId) -> Result<&SurfaceState> {
        self.surfaces
            .get(surface.index())
            .ok_or(KmsError::NotFound(ObjectId::Surface(surface)))
    }

    pub fn sink_state(&self, sink: SinkId) -> Result<&SinkState> {
        self.sinks
            .get(sink.index())
            .ok_or(KmsError::NotFound(ObjectId::Sink(sink)))
    }

    /// Completion events of committed transactions.
    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub fn stats(&self) -> KmsStatsSnapshot {
        self.stats.snapshot()
    }

    /// Handle for interrupt handlers. Never blocks; events are dropped when the channel is full.
    pub fn irq_sender(&self) -> IrqSender {
        self.irq_tx.clone()
    }

    pub fn flips(&self) -> &Arc<FlipSynchronizer> {
        &self.flips
    }

    /// Drain the interrupt channel on the calling thread. Returns the number of events handled,
    /// zero once the flip worker owns the channel.
    pub fn process_interrupts(&self) -> usize {
        let guard = lock(&self.irq_rx);
        let Some(rx) = guard.as_ref() else {
            return 0;
        };
        let mut handled = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    irq::dispatch(&self.flips, event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    /// Move interrupt consumption onto a dedicated thread. The thread exits once every
    /// [`IrqSender`], including the controller's own, is dropped.
    pub fn spawn_flip_worker(&self) -> Result<JoinHandle<()>> {
        let rx = lock(&self.irq_rx)
            .take()
            .ok_or(KmsError::Busy("flip worker already running"))?;
        irq::spawn_worker(rx, Arc::clone(&self.flips))
            .map_err(|err| KmsError::Resource(format!("failed to spawn flip worker: {err}")))
    }

    /// Force-complete every queued flip after a GPU reset. Returns the number of flips completed.
    pub fn device_reset(&self) -> usize {
        self.flips.device_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::PixelFormat;
    use crate::object::BoHandle;
    use crate::sim::{SimBuffers, SimHardware};

    fn controller(layout: DisplayLayout, config: DisplayConfig) -> Result<DisplayController> {
        DisplayController::new(
            layout,
            config,
            Arc::new(SimHardware::default()),
            Arc::new(SimBuffers::new()),
        )
    }

    #[test]
    fn rejects_layouts_without_pipes() {
        let err = controller(DisplayLayout::simple(0, 0), DisplayConfig::default()).unwrap_err();
        assert!(matches!(err, KmsError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_sinks_whose_encoder_overflows_the_mask() {
        let mut layout = DisplayLayout::simple(1, 0);
        layout.sinks[0].encoder = 40;
        let err = controller(layout, DisplayConfig::default()).unwrap_err();
        assert!(matches!(err, KmsError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_irq_queue_depth() {
        let config = DisplayConfig {
            irq_queue_depth: 0,
            ..DisplayConfig::default()
        };
        let err = controller(DisplayLayout::simple(1, 0), config).unwrap_err();
        assert!(matches!(err, KmsError::InvalidConfig(_)));
    }

    #[test]
    fn objects_outside_the_layout_are_not_found() {
        let ctl = controller(DisplayLayout::simple(2, 1), DisplayConfig::default()).unwrap();
        assert!(ctl.pipe_state(PipeId(1)).is_ok());
        assert_eq!(
            ctl.pipe_state(PipeId(2)).unwrap_err(),
            KmsError::NotFound(ObjectId::Pipe(PipeId(2)))
        );
        assert!(ctl.surface_state(SurfaceId(2)).is_err());
        assert!(ctl.sink_state(SinkId(1)).is_ok());
    }

    #[test]
    fn framebuffer_removal_drops_the_creator_reference() {
        let mut ctl = controller(DisplayLayout::simple(1, 0), DisplayConfig::default()).unwrap();
        let fb = ctl
            .add_framebuffer(Framebuffer::new(64, 64, PixelFormat::Xrgb8888, BoHandle(1)))
            .unwrap();
        assert_eq!(ctl.framebuffer_refcount(fb), 1);
        ctl.remove_framebuffer(fb).unwrap();
        assert!(ctl.framebuffer(fb).is_none());
        assert_eq!(
            ctl.remove_framebuffer(fb).unwrap_err(),
            KmsError::UnknownFramebuffer(fb.0)
        );
    }

    #[test]
    fn zero_sized_framebuffers_are_rejected() {
        let mut ctl = controller(DisplayLayout::simple(1, 0), DisplayConfig::default()).unwrap();
        let err = ctl
            .add_framebuffer(Framebuffer::new(0, 64, PixelFormat::Xrgb8888, BoHandle(1)))
            .unwrap_err();
        assert!(matches!(err, KmsError::Invalid(_)));
    }

    #[test]
    fn second_flip_worker_is_refused() {
        let ctl = controller(DisplayLayout::simple(1, 0), DisplayConfig::default()).unwrap();
        let worker = ctl.spawn_flip_worker().unwrap();
        assert!(matches!(ctl.spawn_flip_worker(), Err(KmsError::Busy(_))));
        assert_eq!(ctl.process_interrupts(), 0);
        drop(ctl);
        worker.join().unwrap();
    }

    #[test]
    fn interrupts_are_drained_on_the_calling_thread() {
        let ctl = controller(DisplayLayout::simple(1, 0), DisplayConfig::default()).unwrap();
        let tx = ctl.irq_sender();
        assert!(tx.send(IrqEvent::FlipWork));
        assert!(tx.send(IrqEvent::Vblank {
            pipe: PipeId(0),
            seq: 1
        }));
        assert_eq!(ctl.process_interrupts(), 2);
        assert_eq!(ctl.flips().waiter().last_seq(PipeId(0)), 1);
    }
}
