//! Atomic mode-setting and commit engine for a display controller.
//!
//! Clients describe a complete output configuration (pipes, overlay surfaces, sinks) as a
//! [`Transaction`], have it validated as a whole, then commit it. Commits are either blocking (a
//! full mode set, programmed directly) or non-blocking page flips that are queued behind their
//! buffer fences and armed inside the vblank evasion window so they latch on one precise frame.
//!
//! - [`DisplayController`]: per-controller context owning the live state and flip queue
//! - [`Transaction`]: `begin` / `set_property` / `check` / `commit` / `end`
//! - [`flip::FlipSynchronizer`]: flip FIFO, fence readiness, arming and completion
//! - [`dsb::Dsb`]: command buffer batcher for register writes executed by the display engine
//! - [`hw::HardwareOps`] / [`hw::BufferManager`]: the per-generation and memory-manager seams
//! - [`sim`]: a deterministic simulated display engine for tests and headless hosts

#![forbid(unsafe_code)]

pub mod bandwidth;
mod check;
mod commit;
mod config;
mod controller;
pub mod dsb;
mod error;
pub mod event;
pub mod flip;
mod framebuffer;
pub mod hw;
pub mod irq;
pub mod mode;
mod object;
pub mod regs;
pub mod sim;
pub mod state;
mod stats;
mod transaction;
pub mod vblank;

pub use check::CheckSummary;
pub use config::DisplayConfig;
pub use controller::DisplayController;
pub use error::{KmsError, Result};
pub use event::{CompletionEvent, EventQueue};
pub use framebuffer::{FbTable, Framebuffer, PixelFormat};
pub use irq::{IrqEvent, IrqSender};
pub use mode::{ModeTiming, VrrTiming, MODE_BLOB_LEN};
pub use object::{
    BoHandle, DisplayLayout, FbId, ObjectId, PipeId, Property, RefreshRange, RingId, SinkDesc,
    SinkId, SurfaceDesc, SurfaceId, MAX_PIPES,
};
pub use stats::{KmsStats, KmsStatsSnapshot};
pub use transaction::{CommitFlags, ObjectState, Transaction, CURSOR_SIZE};

#[cfg(test)]
mod proptests;
