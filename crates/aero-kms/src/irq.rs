//! Interrupt-context handoff.
//!
//! Interrupt handlers only push a small [`IrqEvent`] onto a bounded channel. All locking, list
//! draining and hardware programming happens in the consumer: either
//! [`crate::DisplayController::process_interrupts`] on the caller's thread or the worker started
//! by [`crate::DisplayController::spawn_flip_worker`].

use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::flip::FlipSynchronizer;
use crate::object::{PipeId, RingId};
use crate::stats::KmsStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    /// Vertical blank started on `pipe`; `seq` is the frame counter after the increment.
    Vblank { pipe: PipeId, seq: u32 },
    /// A GPU ring completed up to `seqno`.
    RingSeqno { ring: RingId, seqno: u32 },
    /// A command-buffer engine raised its interrupt.
    CommandBuffer { pipe: PipeId, engine: u8 },
    /// Queued flips may have become ready.
    FlipWork,
    /// The GPU was reset; abandon every fence wait.
    DeviceReset,
}

/// Cloneable sending half used from interrupt context.
#[derive(Debug, Clone)]
pub struct IrqSender {
    tx: SyncSender<IrqEvent>,
    stats: Arc<KmsStats>,
}

impl IrqSender {
    pub(crate) fn new(tx: SyncSender<IrqEvent>, stats: Arc<KmsStats>) -> Self {
        Self { tx, stats }
    }

    /// Never blocks. Returns false if the event was dropped.
    pub fn send(&self, event: IrqEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.stats.inc_irq_events_dropped();
                warn!(?event, "interrupt queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Apply one interrupt event. Queued flips are re-examined after every event, so a dropped
/// `FlipWork` kick is recovered by the next interrupt.
pub(crate) fn dispatch(flips: &FlipSynchronizer, event: IrqEvent) {
    match event {
        IrqEvent::Vblank { pipe, seq } => flips.handle_vblank(pipe, seq),
        IrqEvent::RingSeqno { ring, seqno } => {
            flips.notify_ring(ring, seqno);
        }
        IrqEvent::CommandBuffer { pipe, engine } => flips.handle_command_buffer_irq(pipe, engine),
        IrqEvent::FlipWork => {}
        IrqEvent::DeviceReset => {
            flips.device_reset();
        }
    }
    flips.process_work();
}

pub(crate) fn spawn_worker(
    rx: Receiver<IrqEvent>,
    flips: Arc<FlipSynchronizer>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("aero-kms-flip".into())
        .spawn(move || {
            while let Ok(event) = rx.recv() {
                dispatch(&flips, event);
            }
            debug!("interrupt channel closed, flip worker exiting");
        })
}
