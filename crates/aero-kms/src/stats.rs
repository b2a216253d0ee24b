use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters for the commit engine and the flip path.
///
/// Updated from the committing thread, the flip worker and interrupt context alike.
#[derive(Debug, Default)]
pub struct KmsStats {
    commits_blocking: AtomicU64,
    commits_nonblocking: AtomicU64,
    check_failures: AtomicU64,
    try_again: AtomicU64,

    flips_queued: AtomicU64,
    flips_completed: AtomicU64,
    /// Flips whose fence wait was dropped by a device reset or a pipe teardown.
    flips_abandoned: AtomicU64,
    vblank_evasion_misses: AtomicU64,

    command_buffers_committed: AtomicU64,
    command_buffer_timeouts: AtomicU64,
    command_buffer_errors: AtomicU64,

    irq_events_dropped: AtomicU64,
}

impl KmsStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_commits_blocking(&self) {
        self.commits_blocking.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits_nonblocking(&self) {
        self.commits_nonblocking.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_check_failures(&self) {
        self.check_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_try_again(&self) {
        self.try_again.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_flips_queued(&self, n: u64) {
        self.flips_queued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_flips_completed(&self) {
        self.flips_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flips_abandoned(&self) {
        self.flips_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vblank_evasion_misses(&self) {
        self.vblank_evasion_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffers_committed(&self) {
        self.command_buffers_committed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffer_timeouts(&self) {
        self.command_buffer_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_command_buffer_errors(&self) {
        self.command_buffer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_irq_events_dropped(&self) {
        self.irq_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KmsStatsSnapshot {
        KmsStatsSnapshot {
            commits_blocking: self.commits_blocking.load(Ordering::Relaxed),
            commits_nonblocking: self.commits_nonblocking.load(Ordering::Relaxed),
            check_failures: self.check_failures.load(Ordering::Relaxed),
            try_again: self.try_again.load(Ordering::Relaxed),
            flips_queued: self.flips_queued.load(Ordering::Relaxed),
            flips_completed: self.flips_completed.load(Ordering::Relaxed),
            flips_abandoned: self.flips_abandoned.load(Ordering::Relaxed),
            vblank_evasion_misses: self.vblank_evasion_misses.load(Ordering::Relaxed),
            command_buffers_committed: self.command_buffers_committed.load(Ordering::Relaxed),
            command_buffer_timeouts: self.command_buffer_timeouts.load(Ordering::Relaxed),
            command_buffer_errors: self.command_buffer_errors.load(Ordering::Relaxed),
            irq_events_dropped: self.irq_events_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KmsStatsSnapshot {
    pub commits_blocking: u64,
    pub commits_nonblocking: u64,
    pub check_failures: u64,
    pub try_again: u64,
    pub flips_queued: u64,
    pub flips_completed: u64,
    pub flips_abandoned: u64,
    pub vblank_evasion_misses: u64,
    pub command_buffers_committed: u64,
    pub command_buffer_timeouts: u64,
    pub command_buffer_errors: u64,
    pub irq_events_dropped: u64,
}
