//! Command buffer batcher for the display state buffer engines.
//!
//! A [`Dsb`] accumulates a linear stream of 2-dword instructions (register writes, waits, polls,
//! interrupts) that a per-pipe sequencer executes without CPU involvement. Every instruction
//! starts on an 8-byte boundary; the low dword carries data and the high dword carries the
//! opcode in bits 31:24 and, for register instructions, the register offset in bits 19:0.
//!
//! Consecutive full writes to the same register are folded into one indexed write:
//!
//! ```text
//! +----------+-----------------+--------+--------+--------+------+
//! | count=3  | INDEXED | reg   | value1 | value2 | value3 | zero |
//! +----------+-----------------+--------+--------+--------+------+
//! ```

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::hw::{HardwareOps, RegWrite};
use crate::object::PipeId;
use crate::regs::{counter, dsb as regs, Reg};
use crate::state::PipeState;
use crate::vblank::scanline_to_hw;
use crate::{KmsError, Result};

pub mod opcode {
    pub const NOOP: u32 = 0x0;
    pub const MMIO_WRITE: u32 = 0x1;
    pub const WAIT_USEC: u32 = 0x2;
    pub const WAIT_SCANLINE: u32 = 0x3;
    pub const WAIT_VBLANKS: u32 = 0x4;
    pub const WAIT_DSL_IN: u32 = 0x5;
    pub const WAIT_DSL_OUT: u32 = 0x6;
    pub const INTERRUPT: u32 = 0x7;
    pub const INDEXED_WRITE: u32 = 0x9;
    pub const POLL: u32 = 0xa;
}

const OPCODE_SHIFT: u32 = 24;
const OPCODE_MASK: u32 = 0xff << OPCODE_SHIFT;
const BYTE_EN: u32 = 0xf;
const BYTE_EN_SHIFT: u32 = 20;
const BYTE_EN_MASK: u32 = 0xf << BYTE_EN_SHIFT;
const REG_MASK: u32 = 0xfffff;
const SCANLINE_UPPER_SHIFT: u32 = 20;
const SCANLINE_MASK: u64 = 0xfffff;

const CACHELINE_BYTES: usize = 64;
const CACHELINE_DWORDS: usize = CACHELINE_BYTES / 4;

/// Scanline timing a command buffer is built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsbTiming {
    /// Lines per frame before the commit lands (the VRR maximum when VRR is running).
    pub vtotal: u32,
    pub vblank_start: u32,
    pub scanline_offset: u32,
    /// Variable refresh is active while the buffer executes.
    pub vrr_active: bool,
    /// Logical scanline at which the engine wakes memory ahead of vblank.
    pub dewake_scanline: Option<u32>,
}

impl DsbTiming {
    /// Timing for a commit taking `pipe` from `old` to `new`. Returns `None` if the pipe has no
    /// mode before the commit lands.
    pub fn for_commit(hw: &dyn HardwareOps, old: &PipeState, new: &PipeState) -> Option<Self> {
        let modeset = new.needs_modeset();
        // A modeset programs the new timing before the buffer runs, and switches VRR on only
        // afterwards. Without one, VRR stays active unless this commit turns it off.
        let pre = if modeset { new } else { old };
        let mode = pre.mode?;
        let vrr_active = !modeset && old.vrr_enabled && new.vrr_enabled;

        let (vtotal, vblank_start) = match (vrr_active, old.vrr) {
            (true, Some(vrr)) => (vrr.vmax, vrr.vmin_vblank_start(&mode)),
            _ => (mode.vtotal, mode.vblank_start()),
        };

        let latency = hw.wake_latency_us();
        let dewake_scanline = (latency > 0)
            .then(|| vblank_start.saturating_sub(mode.usecs_to_scanlines(latency)));

        Some(Self {
            vtotal,
            vblank_start,
            scanline_offset: hw.scanline_offset(pre.id),
            vrr_active,
            dewake_scanline,
        })
    }

    pub fn to_hw(&self, scanline: i32) -> u32 {
        scanline_to_hw(scanline, self.vtotal, self.scanline_offset)
    }

    fn chicken(&self) -> u32 {
        if self.vrr_active {
            regs::SKIP_WAITS_EN
                | regs::CTRL_WAIT_SAFE_WINDOW
                | regs::CTRL_NO_WAIT_VBLANK
                | regs::INST_WAIT_SAFE_WINDOW
                | regs::INST_NO_WAIT_VBLANK
        } else {
            regs::SKIP_WAITS_EN
        }
    }
}

/// Completion flag of one engine, set from the interrupt handler.
#[derive(Debug, Default)]
pub struct DsbCompletion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DsbCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.done.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn signal(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    /// Wait for (and consume) the completion. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = match self.cond.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *done = false;
        true
    }
}

/// Instruction stream builder for one engine of one pipe.
#[derive(Debug, Clone)]
pub struct Dsb {
    pipe: PipeId,
    id: u8,
    buf: Vec<u32>,
    free_pos: usize,
    ins_start: usize,
    /// Last emitted instruction, used for write merging.
    ins: [u32; 2],
    overflow: bool,
    timing: DsbTiming,
    chicken: u32,
    hw_dewake_scanline: Option<u32>,
    /// Device address of the uploaded buffer, set by [`Dsb::finish`].
    head: Option<u32>,
}

impl Dsb {
    /// Buffer with room for `max_cmds` instructions, rounded up to whole cachelines.
    pub fn prepare(pipe: PipeId, id: u8, max_cmds: usize, timing: DsbTiming) -> Self {
        let bytes = (max_cmds.max(1) * 8).next_multiple_of(CACHELINE_BYTES);
        Self {
            pipe,
            id,
            buf: vec![0; bytes / 4],
            free_pos: 0,
            ins_start: 0,
            ins: [0; 2],
            overflow: false,
            chicken: timing.chicken(),
            hw_dewake_scanline: timing.dewake_scanline.map(|s| timing.to_hw(s as i32)),
            timing,
            head: None,
        }
    }

    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Buffer capacity in dwords.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn free_pos(&self) -> usize {
        self.free_pos
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow
    }

    pub fn words(&self) -> &[u32] {
        &self.buf[..self.free_pos]
    }

    fn has_room(&mut self) -> bool {
        if self.free_pos > self.buf.len() - 2 {
            if !self.overflow {
                error!(pipe = %self.pipe, engine = self.id, "command buffer overflow");
            }
            self.overflow = true;
            return false;
        }
        true
    }

    fn emit(&mut self, ldw: u32, udw: u32) {
        if !self.has_room() {
            return;
        }
        self.free_pos = self.free_pos.next_multiple_of(2);
        self.ins_start = self.free_pos;
        self.ins = [ldw, udw];
        self.buf[self.free_pos] = ldw;
        self.buf[self.free_pos + 1] = udw;
        self.free_pos += 2;
    }

    fn prev_ins_is(&self, opcode: u32, mask: u32, reg: Reg) -> bool {
        if self.free_pos == 0 {
            return false;
        }
        self.ins[1] & mask == opcode && self.ins[1] & REG_MASK == reg
    }

    fn prev_ins_is_mmio_write(&self, reg: Reg) -> bool {
        self.prev_ins_is(
            (opcode::MMIO_WRITE << OPCODE_SHIFT) | (BYTE_EN << BYTE_EN_SHIFT),
            OPCODE_MASK | BYTE_EN_MASK,
            reg,
        )
    }

    fn prev_ins_is_indexed_write(&self, reg: Reg) -> bool {
        self.prev_ins_is(opcode::INDEXED_WRITE << OPCODE_SHIFT, OPCODE_MASK, reg)
    }

    /// Full 32-bit register write. A run of writes to the same register becomes one indexed
    /// write.
    pub fn reg_write(&mut self, reg: Reg, value: u32) {
        let reg = reg & REG_MASK;
        let mmio = self.prev_ins_is_mmio_write(reg);
        if !mmio && !self.prev_ins_is_indexed_write(reg) {
            self.emit(
                value,
                (opcode::MMIO_WRITE << OPCODE_SHIFT) | (BYTE_EN << BYTE_EN_SHIFT) | reg,
            );
            return;
        }

        if !self.has_room() {
            return;
        }

        if mmio {
            let prev_value = self.ins[0];
            self.ins = [1, (opcode::INDEXED_WRITE << OPCODE_SHIFT) | reg];
            self.buf[self.ins_start] = self.ins[0];
            self.buf[self.ins_start + 1] = self.ins[1];
            self.buf[self.ins_start + 2] = prev_value;
            self.free_pos += 1;
        }

        self.buf[self.free_pos] = value;
        self.free_pos += 1;
        self.ins[0] += 1;
        self.buf[self.ins_start] = self.ins[0];

        // An odd number of data dwords is padded with a zero dword.
        if self.free_pos & 1 == 1 {
            self.buf[self.free_pos] = 0;
        }
    }

    /// Write only the bytes selected by `mask`.
    pub fn reg_write_masked(&mut self, reg: Reg, mask: u32, value: u32) {
        let byte_enables = (0..4)
            .filter(|byte| mask & (0xff << (byte * 8)) != 0)
            .fold(0, |acc, byte| acc | (1 << byte));
        self.emit(
            value & mask,
            (opcode::MMIO_WRITE << OPCODE_SHIFT) | (byte_enables << BYTE_EN_SHIFT) | (reg & REG_MASK),
        );
    }

    pub fn noop(&mut self, count: usize) {
        for _ in 0..count {
            self.emit(0, opcode::NOOP << OPCODE_SHIFT);
        }
    }

    /// Make the following writes non-posted, so each completes before the next instruction.
    pub fn nonpost_start(&mut self) {
        let ctrl = regs::ctrl(self.pipe, self.id);
        self.reg_write_masked(ctrl, regs::CTRL_NON_POSTED, regs::CTRL_NON_POSTED);
        self.noop(4);
    }

    pub fn nonpost_end(&mut self) {
        let ctrl = regs::ctrl(self.pipe, self.id);
        self.reg_write_masked(ctrl, regs::CTRL_NON_POSTED, 0);
        self.noop(4);
    }

    pub fn interrupt(&mut self) {
        self.emit(0, opcode::INTERRUPT << OPCODE_SHIFT);
    }

    pub fn wait_usec(&mut self, usecs: u32) {
        self.emit(usecs, opcode::WAIT_USEC << OPCODE_SHIFT);
    }

    pub fn wait_vblanks(&mut self, count: u32) {
        self.emit(count, opcode::WAIT_VBLANKS << OPCODE_SHIFT);
    }

    fn emit_wait_dsl(&mut self, op: u32, lower: u32, upper: u32) {
        let window = ((u64::from(upper) & SCANLINE_MASK) << SCANLINE_UPPER_SHIFT)
            | (u64::from(lower) & SCANLINE_MASK);
        self.emit(window as u32, (op << OPCODE_SHIFT) | (window >> 32) as u32);
    }

    fn assert_dsl_ok(&self, start: i32, end: i32) {
        let vtotal = i64::from(self.timing.vtotal);
        if vtotal == 0 {
            return;
        }
        // Waiting for every line but one could miss the window entirely.
        if (i64::from(end) - i64::from(start) + vtotal).rem_euclid(vtotal) == vtotal - 1 {
            warn!(
                pipe = %self.pipe,
                engine = self.id,
                start,
                end,
                vtotal,
                "scanline wait window covers the whole frame"
            );
        }
    }

    fn wait_dsl(&mut self, lower_in: i32, upper_in: i32, lower_out: i32, upper_out: i32) {
        let lower_in = self.timing.to_hw(lower_in);
        let upper_in = self.timing.to_hw(upper_in);
        let lower_out = self.timing.to_hw(lower_out);
        let upper_out = self.timing.to_hw(upper_out);

        if upper_in >= lower_in {
            self.emit_wait_dsl(opcode::WAIT_DSL_IN, lower_in, upper_in);
        } else if upper_out >= lower_out {
            self.emit_wait_dsl(opcode::WAIT_DSL_OUT, lower_out, upper_out);
        } else {
            warn!(pipe = %self.pipe, engine = self.id, "unrepresentable scanline window");
        }
    }

    /// Wait until the scanline is inside `[start, end]` (logical scanlines).
    pub fn wait_scanline_in(&mut self, start: i32, end: i32) {
        self.assert_dsl_ok(start, end);
        self.wait_dsl(start, end, end + 1, start - 1);
    }

    /// Wait until the scanline is outside `[start, end]` (logical scanlines).
    pub fn wait_scanline_out(&mut self, start: i32, end: i32) {
        self.assert_dsl_ok(start, end);
        self.wait_dsl(end + 1, start - 1, start, end);
    }

    /// Stall until `reg & mask == value`, re-reading every `wait_us` up to `count` times.
    pub fn poll(&mut self, reg: Reg, mask: u32, value: u32, wait_us: u32, count: u32) {
        self.reg_write(regs::pollmask(self.pipe, self.id), mask);
        self.reg_write(
            regs::pollfunc(self.pipe, self.id),
            regs::POLL_ENABLE | regs::poll_wait(wait_us) | regs::poll_count(count),
        );
        self.noop(5);
        self.emit(value, (opcode::POLL << OPCODE_SHIFT) | (reg & REG_MASK));
    }

    fn align_tail(&mut self) {
        let aligned = self.free_pos.next_multiple_of(CACHELINE_DWORDS).min(self.buf.len());
        self.buf[self.free_pos..aligned].fill(0);
        self.free_pos = aligned;
    }

    /// Terminate the stream, pad it to a cacheline and upload it.
    pub fn finish(&mut self, hw: &dyn HardwareOps) -> Result<()> {
        // Dewake forcing outlives the engine; clear it on the way out.
        self.reg_write(regs::pmctrl(self.pipe, self.id), 0);
        self.reg_write_masked(regs::pmctrl_2(self.pipe, self.id), regs::FORCE_DEWAKE, 0);
        self.align_tail();
        self.head = Some(hw.upload_command_buffer(self.pipe, self.id, self.words())?);
        Ok(())
    }

    fn interrupt_setup() -> u32 {
        regs::ERROR_INT_STATUS | regs::PROG_INT_STATUS | regs::ERROR_INT_EN | regs::PROG_INT_EN
    }

    /// Append instructions that start `chained` once this buffer reaches them.
    pub fn chain(&mut self, chained: &Dsb, wait_for_vblank: bool) -> Result<()> {
        if chained.id == self.id || chained.pipe != self.pipe {
            return Err(KmsError::Invalid("command buffer cannot chain to itself"));
        }
        let tail = chained.free_pos * 4;
        if tail % CACHELINE_BYTES != 0 {
            return Err(KmsError::Invalid("chained command buffer is not finished"));
        }
        let Some(head) = chained.head else {
            return Err(KmsError::Invalid("chained command buffer is not uploaded"));
        };

        let pipe = self.pipe;
        let target = chained.id;
        let ctrl = if wait_for_vblank {
            regs::CTRL_WAIT_FOR_VBLANK
        } else {
            0
        };
        self.reg_write(regs::ctrl(pipe, target), ctrl | regs::CTRL_ENABLE);
        self.reg_write(regs::chicken(pipe, target), chained.chicken);
        self.reg_write(regs::bufrpt_cnt(pipe, target), 0);
        self.reg_write(regs::head(pipe, target), head);
        self.reg_write(regs::interrupt(pipe, target), Self::interrupt_setup());
        // Dewake only matters when the chained engine sits out a vblank.
        let gated = |scanline: Option<u32>| scanline.filter(|_| wait_for_vblank);
        if let Some(dewake) = gated(chained.hw_dewake_scanline) {
            self.reg_write(
                regs::pmctrl(pipe, target),
                regs::ENABLE_DEWAKE | (dewake & regs::SCANLINE_FOR_DEWAKE_MASK),
            );
        }
        self.reg_write(regs::tail(pipe, target), head + tail as u32);

        if let Some(dewake) = gated(chained.timing.dewake_scanline) {
            // Keep memory awake from this engine in case the chained one starts past its own
            // dewake scanline.
            let pmctrl_2 = regs::pmctrl_2(pipe, self.id);
            self.reg_write_masked(pmctrl_2, regs::FORCE_DEWAKE, regs::FORCE_DEWAKE);
            self.wait_scanline_out(dewake as i32, chained.timing.vblank_start as i32);
        }
        Ok(())
    }

    pub fn is_busy(&self, hw: &dyn HardwareOps) -> bool {
        hw.read(regs::ctrl(self.pipe, self.id)) & regs::CTRL_STATUS_BUSY != 0
    }

    /// Start execution. The engine must be idle and the buffer finished.
    pub fn commit(&self, hw: &dyn HardwareOps, wait_for_vblank: bool) -> Result<()> {
        if self.overflow {
            return Err(KmsError::NoSpace("command buffer overflow"));
        }
        let tail = self.free_pos * 4;
        let Some(head) = self.head.filter(|_| tail % CACHELINE_BYTES == 0) else {
            return Err(KmsError::Invalid("command buffer is not finished"));
        };
        if self.is_busy(hw) {
            error!(pipe = %self.pipe, engine = self.id, "command buffer engine is busy");
            return Err(KmsError::Busy("command buffer engine is busy"));
        }

        let (pipe, id) = (self.pipe, self.id);
        let ctrl = if wait_for_vblank {
            regs::CTRL_WAIT_FOR_VBLANK
        } else {
            0
        };
        hw.write(regs::ctrl(pipe, id), ctrl | regs::CTRL_ENABLE);
        hw.write(regs::chicken(pipe, id), self.chicken);
        hw.write(regs::interrupt(pipe, id), Self::interrupt_setup());
        hw.write(regs::bufrpt_cnt(pipe, id), 0);
        hw.write(regs::head(pipe, id), head);

        if let Some(dewake) = self.hw_dewake_scanline {
            hw.write(
                regs::pmctrl(pipe, id),
                regs::ENABLE_DEWAKE | (dewake & regs::SCANLINE_FOR_DEWAKE_MASK),
            );
            // Force dewake right away when the target scanline is about to pass.
            let position = hw.read(counter::pipedsl(pipe)) & counter::PIPEDSL_LINE_MASK;
            let diff = i64::from(dewake) - i64::from(position);
            let force = if (0..5).contains(&diff) {
                regs::FORCE_DEWAKE
            } else {
                0
            };
            hw.write(regs::pmctrl_2(pipe, id), force | regs::BLOCK_DEWAKE_EXTENSION);
        }

        hw.write(regs::tail(pipe, id), head + tail as u32);
        debug!(pipe = %pipe, engine = id, dwords = self.free_pos, "command buffer committed");
        Ok(())
    }

    /// Poll until the engine is idle, then reset it for reuse. Returns false if the engine had
    /// to be halted.
    pub fn wait(&mut self, hw: &dyn HardwareOps, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut idle = !self.is_busy(hw);
        while !idle && Instant::now() < deadline {
            thread::yield_now();
            idle = !self.is_busy(hw);
        }
        if !idle {
            self.halt(hw);
        }
        self.reset(hw);
        idle
    }

    /// Wait for the completion interrupt, then reset the engine. Returns false on timeout.
    pub fn wait_interrupt(
        &mut self,
        hw: &dyn HardwareOps,
        completion: &DsbCompletion,
        timeout: Duration,
    ) -> bool {
        let done = completion.wait(timeout);
        if !done {
            self.halt(hw);
        }
        self.reset(hw);
        done
    }

    fn halt(&self, hw: &dyn HardwareOps) {
        let (pipe, id) = (self.pipe, self.id);
        hw.write(regs::ctrl(pipe, id), regs::CTRL_ENABLE | regs::CTRL_HALT);
        let head = self.head.unwrap_or(0);
        let current_head = hw.read(regs::current_head(pipe, id)).wrapping_sub(head);
        let ctrl = hw.read(regs::ctrl(pipe, id));
        let status = hw.read(regs::status(pipe, id));
        error!(
            pipe = %pipe,
            engine = id,
            "command buffer timed out waiting for idle \
             (current head={current_head:#x}, head={head:#x}, tail={:#x}, ctrl={ctrl:#x}, status={status:#x})",
            self.free_pos * 4
        );
        self.dump();
    }

    fn reset(&mut self, hw: &dyn HardwareOps) {
        self.free_pos = 0;
        self.ins_start = 0;
        self.ins = [0; 2];
        self.overflow = false;
        self.head = None;
        hw.write(regs::ctrl(self.pipe, self.id), 0);
        hw.write(
            regs::interrupt(self.pipe, self.id),
            regs::ERROR_INT_STATUS | regs::PROG_INT_STATUS,
        );
    }

    fn dump(&self) {
        for (row, chunk) in self.words().chunks(4).enumerate() {
            debug!(
                pipe = %self.pipe,
                engine = self.id,
                "{:#06x}: {:08x?}",
                row * CACHELINE_DWORDS,
                chunk
            );
        }
    }
}

/// Acknowledge an engine interrupt. Wakes `completion` when the buffer signalled completion and
/// returns the error status bits.
pub fn irq_handler(
    hw: &dyn HardwareOps,
    pipe: PipeId,
    id: u8,
    completion: &DsbCompletion,
) -> u32 {
    let status = hw.read(regs::interrupt(pipe, id));
    hw.write(regs::interrupt(pipe, id), status);

    if status & regs::PROG_INT_STATUS != 0 {
        completion.signal();
    }

    let errors = status & regs::ERROR_INT_STATUS;
    for (bit, what) in [
        (regs::ATS_FAULT_INT_STATUS, "ATS fault"),
        (regs::GTT_FAULT_INT_STATUS, "GTT fault"),
        (regs::RSPTIMEOUT_INT_STATUS, "response timeout"),
        (regs::POLL_ERR_INT_STATUS, "poll error"),
    ] {
        if errors & bit != 0 {
            error!(pipe = %pipe, engine = id, "command buffer {what}");
        }
    }
    errors
}

/// Decoded command buffer instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Noop,
    Write { reg: Reg, byte_enables: u8, value: u32 },
    IndexedWrite { reg: Reg, values: Vec<u32> },
    WaitUsec(u32),
    WaitScanline(u32),
    WaitVblanks(u32),
    WaitDslIn { lower: u32, upper: u32 },
    WaitDslOut { lower: u32, upper: u32 },
    Interrupt,
    Poll { reg: Reg, value: u32 },
}

/// Parse an instruction stream. Cacheline padding decodes as `Noop`.
pub fn decode(words: &[u32]) -> Result<Vec<Instruction>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < words.len() {
        let (Some(&ldw), Some(&udw)) = (words.get(pos), words.get(pos + 1)) else {
            return Err(KmsError::Invalid("truncated command buffer instruction"));
        };
        let reg = udw & REG_MASK;
        let ins = match udw >> OPCODE_SHIFT {
            opcode::NOOP => Instruction::Noop,
            opcode::MMIO_WRITE => Instruction::Write {
                reg,
                byte_enables: ((udw & BYTE_EN_MASK) >> BYTE_EN_SHIFT) as u8,
                value: ldw,
            },
            opcode::INDEXED_WRITE => {
                let count = ldw as usize;
                let values = words
                    .get(pos + 2..pos + 2 + count)
                    .ok_or(KmsError::Invalid("indexed write runs past the buffer"))?
                    .to_vec();
                pos = (pos + 2 + count).next_multiple_of(2);
                out.push(Instruction::IndexedWrite { reg, values });
                continue;
            }
            opcode::WAIT_USEC => Instruction::WaitUsec(ldw),
            opcode::WAIT_SCANLINE => Instruction::WaitScanline(ldw),
            opcode::WAIT_VBLANKS => Instruction::WaitVblanks(ldw),
            op @ (opcode::WAIT_DSL_IN | opcode::WAIT_DSL_OUT) => {
                let window = (u64::from(udw & !OPCODE_MASK) << 32) | u64::from(ldw);
                let lower = (window & SCANLINE_MASK) as u32;
                let upper = ((window >> SCANLINE_UPPER_SHIFT) & SCANLINE_MASK) as u32;
                if op == opcode::WAIT_DSL_IN {
                    Instruction::WaitDslIn { lower, upper }
                } else {
                    Instruction::WaitDslOut { lower, upper }
                }
            }
            opcode::INTERRUPT => Instruction::Interrupt,
            opcode::POLL => Instruction::Poll { reg, value: ldw },
            _ => return Err(KmsError::Invalid("unknown command buffer opcode")),
        };
        out.push(ins);
        pos += 2;
    }
    Ok(out)
}

/// Flatten decoded instructions into the register writes they perform, in program order.
pub fn register_writes(instructions: &[Instruction]) -> Vec<RegWrite> {
    let mut out = Vec::new();
    for ins in instructions {
        match ins {
            Instruction::Write { reg, value, .. } => out.push(RegWrite::new(*reg, *value)),
            Instruction::IndexedWrite { reg, values } => {
                out.extend(values.iter().map(|v| RegWrite::new(*reg, *v)));
            }
            _ => {}
        }
    }
    out
}
