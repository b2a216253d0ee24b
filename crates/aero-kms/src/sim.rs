//! Simulated display engine and buffer manager.
//!
//! [`SimHardware`] keeps a register file plus a timing generator per pipe. Scanlines only move when
//! something waits on them: [`SimHardware::advance`], a vblank wait, a wait instruction inside a
//! command buffer, or a scanline read when [`SimConfig::lines_per_read`] is set. Crossing vblank
//! start bumps the frame counter, latches every plane's `SURF` into `SURFLIVE` and raises a vblank
//! interrupt on the connected [`IrqSender`]. Command buffers run to completion as soon as their
//! `TAIL` register is written.
//!
//! [`SimBuffers`] tracks pin counts and per-buffer fences on simulated rings.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::dsb::{self, Instruction};
use crate::flip::FlipTarget;
use crate::framebuffer::PixelFormat;
use crate::hw::{
    BufferManager, CursorRegs, Fence, HardwareOps, PlaneRegs, RegWrite, ScalerMode, SinkRoute,
};
use crate::irq::{IrqEvent, IrqSender};
use crate::mode::{ModeTiming, VrrTiming};
use crate::object::{BoHandle, PipeId, RingId, SurfaceId, MAX_PIPES};
use crate::regs::{counter, cursor, dsb as engine, overlay, pipe as timing, plane_ctl, primary, route, Reg};
use crate::vblank::{scanline_to_hw, FrameCounterStyle};
use crate::{KmsError, Result};

/// Device address of the first uploaded command buffer.
const COMMAND_BUFFER_BASE: u32 = 0x10_0000;
const COMMAND_BUFFER_STRIDE: u32 = 0x1_0000;

const INT_STATUS_BITS: u32 = engine::ERROR_INT_STATUS | engine::PROG_INT_STATUS;
const INT_ENABLE_BITS: u32 = engine::ERROR_INT_EN | engine::PROG_INT_EN;
/// Each status bit has its enable bit 16 positions higher.
const INT_ENABLE_SHIFT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub frame_counter_style: FrameCounterStyle,
    pub scanline_offset: u32,
    /// Scanlines that pass on every read of the scanline counter.
    pub lines_per_read: u32,
    /// The engine has command buffer sequencers.
    pub command_buffer: bool,
    pub wake_latency_us: u32,
    /// Aggregate data-rate limit in MB/s, whatever the plane count.
    pub max_data_rate: u32,
    pub num_scalers: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frame_counter_style: FrameCounterStyle::Wide32,
            scanline_offset: 1,
            lines_per_read: 0,
            command_buffer: true,
            wake_latency_us: 0,
            max_data_rate: 10_000,
            num_scalers: 2,
        }
    }
}

/// Programming hook that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFailure {
    PipeDisable,
    ModeSet,
    PipeEnable,
    PipeOff,
    RouteOutputs,
    PlaneWrites,
    Upload,
}

/// Operation log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    PipeDisable(PipeId),
    ModeSet {
        pipe: PipeId,
        mode: ModeTiming,
        vrr: Option<VrrTiming>,
    },
    PipeEnable(PipeId),
    PipeOff(PipeId),
    Route(Vec<SinkRoute>),
    /// Register write issued by the CPU.
    Write(RegWrite),
    /// Register write performed by a command buffer engine.
    BatchedWrite(RegWrite),
    Upload {
        pipe: PipeId,
        engine: u8,
        dwords: usize,
    },
}

#[derive(Debug, Clone, Default)]
struct SimPipe {
    mode: Option<ModeTiming>,
    vrr: Option<VrrTiming>,
    enabled: bool,
    frame: u32,
    /// Logical scanline.
    line: u32,
    now_ns: u64,
    vblank_ns: u64,
}

impl SimPipe {
    /// Mode and lines per frame while the pipe scans out.
    fn timing(&self) -> Option<(ModeTiming, u32)> {
        let mode = self.mode.filter(|_| self.enabled)?;
        let vtotal = self.vrr.map_or(mode.vtotal, |vrr| vrr.vmax);
        Some((mode, vtotal.max(1)))
    }
}

fn line_ns(mode: &ModeTiming) -> u64 {
    if mode.clock_khz == 0 {
        return 0;
    }
    u64::from(mode.htotal) * 1_000_000 / u64::from(mode.clock_khz)
}

fn pipe_of(reg: Reg, addr: fn(PipeId) -> Reg) -> Option<PipeId> {
    (0..MAX_PIPES as u8).map(PipeId).find(|&pipe| addr(pipe) == reg)
}

#[derive(Debug)]
struct SimInner {
    config: SimConfig,
    regs: HashMap<Reg, u32>,
    pipes: Vec<SimPipe>,
    /// Overlays that were ever programmed, latched at every vblank.
    overlays: BTreeSet<SurfaceId>,
    /// Uploaded command buffers by device address.
    memory: HashMap<u32, Vec<u32>>,
    busy: HashSet<(PipeId, u8)>,
    stall_command_buffer: bool,
    failures: Vec<SimFailure>,
    ops: Vec<SimOp>,
}

impl SimInner {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            regs: HashMap::new(),
            pipes: vec![SimPipe::default(); MAX_PIPES],
            overlays: BTreeSet::new(),
            memory: HashMap::new(),
            busy: HashSet::new(),
            stall_command_buffer: false,
            failures: Vec::new(),
            ops: Vec::new(),
        }
    }

    fn reg(&self, reg: Reg) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn take_failure(&mut self, failure: SimFailure) -> Result<()> {
        match self.failures.iter().position(|&f| f == failure) {
            Some(index) => {
                self.failures.remove(index);
                Err(KmsError::Hardware(format!("injected {failure:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn pipe(&self, pipe: PipeId) -> Option<&SimPipe> {
        self.pipes.get(pipe.index())
    }

    fn hw_scanline(&self, pipe: PipeId) -> u32 {
        match self.pipe(pipe).and_then(SimPipe::timing) {
            Some((_, vtotal)) => {
                let line = self.pipes[pipe.index()].line;
                scanline_to_hw(line as i32, vtotal, self.config.scanline_offset)
            }
            None => 0,
        }
    }

    /// Raw legacy counter: it ticks one line before the end of the frame, so it trails the cooked
    /// count during most of vblank.
    fn legacy_count(&self, pipe: PipeId) -> u32 {
        let Some(state) = self.pipe(pipe) else {
            return 0;
        };
        let behind = match state.mode {
            Some(mode) => {
                let dsl = self.hw_scanline(pipe);
                u32::from(dsl >= mode.vdisplay && dsl < mode.vtotal.saturating_sub(1))
            }
            None => 0,
        };
        state.frame.wrapping_sub(behind) & 0x00ff_ffff
    }

    fn advance(&mut self, pipe: PipeId, lines: u64, irqs: &mut Vec<IrqEvent>) {
        let mask = self.config.frame_counter_style.mask();
        let Some(state) = self.pipes.get_mut(pipe.index()) else {
            return;
        };
        let Some((mode, vtotal)) = state.timing() else {
            return;
        };
        let vblank_start = mode.vblank_start();
        let per_line = line_ns(&mode);

        let mut remaining = lines;
        let mut crossed = false;
        while remaining > 0 {
            let distance = match (vblank_start + vtotal - state.line) % vtotal {
                0 => vtotal,
                d => d,
            };
            let distance = u64::from(distance);
            if remaining < distance {
                state.line = ((u64::from(state.line) + remaining) % u64::from(vtotal)) as u32;
                state.now_ns += per_line * remaining;
                break;
            }
            remaining -= distance;
            state.line = vblank_start;
            state.now_ns += per_line * distance;
            state.vblank_ns = state.now_ns;
            state.frame = state.frame.wrapping_add(1);
            irqs.push(IrqEvent::Vblank {
                pipe,
                seq: state.frame & mask,
            });
            crossed = true;
        }

        if crossed {
            self.latch(pipe);
        }
    }

    fn advance_to_vblank(&mut self, pipe: PipeId, irqs: &mut Vec<IrqEvent>) {
        let Some((mode, vtotal)) = self.pipe(pipe).and_then(SimPipe::timing) else {
            return;
        };
        let line = self.pipes[pipe.index()].line;
        let distance = match (mode.vblank_start() + vtotal - line) % vtotal {
            0 => vtotal,
            d => d,
        };
        self.advance(pipe, u64::from(distance), irqs);
    }

    /// Step line by line until `done` holds for the hardware scanline, at most one frame.
    fn advance_until(
        &mut self,
        pipe: PipeId,
        irqs: &mut Vec<IrqEvent>,
        done: impl Fn(u32) -> bool,
    ) {
        let Some((_, vtotal)) = self.pipe(pipe).and_then(SimPipe::timing) else {
            return;
        };
        for _ in 0..=vtotal {
            if done(self.hw_scanline(pipe)) {
                return;
            }
            self.advance(pipe, 1, irqs);
        }
        warn!(pipe = %pipe, "scanline wait never satisfied");
    }

    fn latch(&mut self, pipe: PipeId) {
        let surf = self.reg(primary::surf(pipe));
        self.regs.insert(primary::surflive(pipe), surf);
        for &surface in &self.overlays {
            let surf = self.regs.get(&overlay::surf(surface)).copied().unwrap_or(0);
            self.regs.insert(overlay::surflive(surface), surf);
        }
    }

    fn read(&mut self, reg: Reg, irqs: &mut Vec<IrqEvent>) -> u32 {
        if let Some(pipe) = pipe_of(reg, counter::pipedsl) {
            let dsl = self.hw_scanline(pipe);
            let lines = u64::from(self.config.lines_per_read);
            self.advance(pipe, lines, irqs);
            return dsl;
        }
        if let Some(pipe) = pipe_of(reg, counter::pipe_frmcount) {
            return self.pipe(pipe).map_or(0, |p| p.frame);
        }
        if let Some(pipe) = pipe_of(reg, counter::pipeframe) {
            return (self.legacy_count(pipe) >> 8) & counter::PIPEFRAME_HIGH_MASK;
        }
        if let Some(pipe) = pipe_of(reg, counter::pipeframepixel) {
            return (self.legacy_count(pipe) & 0xff) << counter::PIPEFRAMEPIXEL_LOW_SHIFT;
        }
        if let Some((pipe, id, engine::CTRL)) = engine::decode(reg) {
            let busy = if self.busy.contains(&(pipe, id)) {
                engine::CTRL_STATUS_BUSY
            } else {
                0
            };
            return self.reg(reg) | busy;
        }
        self.reg(reg)
    }

    fn store(&mut self, reg: Reg, value: u32, irqs: &mut Vec<IrqEvent>) {
        match engine::decode(reg) {
            Some((_, _, engine::INTERRUPT)) => {
                // Status bits are write-one-to-clear.
                let status = self.reg(reg) & INT_STATUS_BITS & !(value & INT_STATUS_BITS);
                self.regs.insert(reg, (value & INT_ENABLE_BITS) | status);
            }
            Some((pipe, id, engine::CTRL)) => {
                if value & engine::CTRL_HALT != 0 || value & engine::CTRL_ENABLE == 0 {
                    self.busy.remove(&(pipe, id));
                }
                self.regs.insert(reg, value & !engine::CTRL_STATUS_BUSY);
            }
            Some((pipe, id, engine::TAIL)) => {
                self.regs.insert(reg, value);
                self.run_command_buffer(pipe, id, value, irqs);
            }
            _ => {
                self.regs.insert(reg, value);
            }
        }
    }

    fn set_int_status(&mut self, pipe: PipeId, id: u8, bits: u32) {
        let reg = engine::interrupt(pipe, id);
        let value = self.reg(reg) | bits;
        self.regs.insert(reg, value);
    }

    fn raise_if_pending(&self, pipe: PipeId, id: u8, irqs: &mut Vec<IrqEvent>) {
        let int = self.reg(engine::interrupt(pipe, id));
        if int & INT_STATUS_BITS & (int >> INT_ENABLE_SHIFT) != 0 {
            irqs.push(IrqEvent::CommandBuffer { pipe, engine: id });
        }
    }

    fn run_command_buffer(&mut self, pipe: PipeId, id: u8, tail: u32, irqs: &mut Vec<IrqEvent>) {
        let ctrl = self.reg(engine::ctrl(pipe, id));
        if ctrl & engine::CTRL_ENABLE == 0 {
            debug!(pipe = %pipe, engine = id, "tail written to a disabled engine");
            return;
        }
        if self.stall_command_buffer {
            self.busy.insert((pipe, id));
            return;
        }

        let head = self.reg(engine::head(pipe, id));
        let Some(buffer) = self.memory.get(&head) else {
            error!(pipe = %pipe, engine = id, head, "command buffer head points at unmapped memory");
            self.set_int_status(pipe, id, engine::GTT_FAULT_INT_STATUS);
            self.raise_if_pending(pipe, id, irqs);
            return;
        };
        let len = (tail.saturating_sub(head) / 4) as usize;
        let words = buffer[..len.min(buffer.len())].to_vec();

        if ctrl & engine::CTRL_WAIT_FOR_VBLANK != 0 {
            self.advance_to_vblank(pipe, irqs);
        }

        match dsb::decode(&words) {
            Ok(instructions) => {
                for ins in instructions {
                    self.execute(pipe, id, ins, irqs);
                }
            }
            Err(err) => {
                error!(pipe = %pipe, engine = id, %err, "malformed command buffer");
                self.set_int_status(pipe, id, engine::GTT_FAULT_INT_STATUS);
            }
        }

        self.regs.insert(engine::current_head(pipe, id), tail);
        self.raise_if_pending(pipe, id, irqs);
    }

    fn batched_write(&mut self, reg: Reg, value: u32, irqs: &mut Vec<IrqEvent>) {
        self.ops.push(SimOp::BatchedWrite(RegWrite::new(reg, value)));
        self.store(reg, value, irqs);
    }

    fn execute(&mut self, pipe: PipeId, id: u8, ins: Instruction, irqs: &mut Vec<IrqEvent>) {
        match ins {
            Instruction::Noop => {}
            Instruction::Write {
                reg,
                byte_enables,
                value,
            } => {
                let mask = (0..4)
                    .filter(|byte| byte_enables & (1 << byte) != 0)
                    .fold(0u32, |acc, byte| acc | (0xff << (byte * 8)));
                let merged = (self.reg(reg) & !mask) | (value & mask);
                self.batched_write(reg, merged, irqs);
            }
            Instruction::IndexedWrite { reg, values } => {
                for value in values {
                    self.batched_write(reg, value, irqs);
                }
            }
            Instruction::WaitUsec(usecs) => {
                if let Some((mode, _)) = self.pipe(pipe).and_then(SimPipe::timing) {
                    let lines = mode.usecs_to_scanlines(usecs);
                    self.advance(pipe, u64::from(lines), irqs);
                }
            }
            Instruction::WaitVblanks(count) => {
                for _ in 0..count {
                    self.advance_to_vblank(pipe, irqs);
                }
            }
            Instruction::WaitScanline(line) => self.advance_until(pipe, irqs, |dsl| dsl == line),
            Instruction::WaitDslIn { lower, upper } => {
                self.advance_until(pipe, irqs, |dsl| dsl >= lower && dsl <= upper)
            }
            Instruction::WaitDslOut { lower, upper } => {
                self.advance_until(pipe, irqs, |dsl| dsl < lower || dsl > upper)
            }
            Instruction::Interrupt => self.set_int_status(pipe, id, engine::PROG_INT_STATUS),
            Instruction::Poll { reg, value } => {
                let mask = self.reg(engine::pollmask(pipe, id));
                let current = self.read(reg, irqs);
                if current & mask != value {
                    debug!(pipe = %pipe, engine = id, reg, current, value, "poll failed");
                    self.set_int_status(pipe, id, engine::POLL_ERR_INT_STATUS);
                }
            }
        }
    }
}

/// Deterministic display engine for tests and headless hosts.
#[derive(Debug)]
pub struct SimHardware {
    inner: Mutex<SimInner>,
    irq: Mutex<Option<IrqSender>>,
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SimHardware {
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Mutex::new(SimInner::new(config)),
            irq: Mutex::new(None),
        }
    }

    /// Deliver vblank and command buffer interrupts to `tx`.
    pub fn connect_irq(&self, tx: IrqSender) {
        *lock(&self.irq) = Some(tx);
    }

    /// Stop delivering interrupts. A flip worker exits once the controller is dropped too.
    pub fn disconnect_irq(&self) {
        lock(&self.irq).take();
    }

    /// Run `f` under the register lock, then raise the interrupts it produced.
    fn with_irqs<R>(&self, f: impl FnOnce(&mut SimInner, &mut Vec<IrqEvent>) -> R) -> R {
        let mut irqs = Vec::new();
        let out = {
            let mut inner = lock(&self.inner);
            f(&mut inner, &mut irqs)
        };
        if irqs.is_empty() {
            return out;
        }
        let tx = lock(&self.irq).clone();
        if let Some(tx) = tx {
            for event in irqs {
                tx.send(event);
            }
        }
        out
    }

    /// Let `lines` scanlines pass on `pipe`.
    pub fn advance(&self, pipe: PipeId, lines: u32) {
        self.with_irqs(|inner, irqs| inner.advance(pipe, u64::from(lines), irqs));
    }

    /// Run `pipe` up to the start of its next vblank.
    pub fn advance_to_vblank(&self, pipe: PipeId) {
        self.with_irqs(|inner, irqs| inner.advance_to_vblank(pipe, irqs));
    }

    /// Run `pipe` forward to logical scanline `line`.
    pub fn advance_to_line(&self, pipe: PipeId, line: u32) {
        self.with_irqs(|inner, irqs| {
            let Some((_, vtotal)) = inner.pipe(pipe).and_then(SimPipe::timing) else {
                return;
            };
            let current = inner.pipes[pipe.index()].line;
            let lines = (line % vtotal + vtotal - current) % vtotal;
            inner.advance(pipe, u64::from(lines), irqs);
        });
    }

    /// Frames started on `pipe` so far.
    pub fn frame(&self, pipe: PipeId) -> u32 {
        lock(&self.inner).pipe(pipe).map_or(0, |p| p.frame)
    }

    /// Current logical scanline of `pipe`.
    pub fn scanline(&self, pipe: PipeId) -> u32 {
        lock(&self.inner).pipe(pipe).map_or(0, |p| p.line)
    }

    /// Register value without read side effects.
    pub fn reg(&self, reg: Reg) -> u32 {
        lock(&self.inner).reg(reg)
    }

    /// Make the next call of `failure` fail.
    pub fn fail_next(&self, failure: SimFailure) {
        lock(&self.inner).failures.push(failure);
    }

    /// Leave command buffer engines busy instead of executing.
    pub fn set_stall_command_buffer(&self, stall: bool) {
        lock(&self.inner).stall_command_buffer = stall;
    }

    pub fn ops(&self) -> Vec<SimOp> {
        lock(&self.inner).ops.clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.inner).ops.clear();
    }

    /// Number of CPU register writes since the last [`SimHardware::clear_ops`].
    pub fn write_count(&self) -> usize {
        lock(&self.inner)
            .ops
            .iter()
            .filter(|op| matches!(op, SimOp::Write(_)))
            .count()
    }

    /// Register writes (CPU and batched) to `reg`, oldest first.
    pub fn writes_to(&self, reg: Reg) -> Vec<u32> {
        lock(&self.inner)
            .ops
            .iter()
            .filter_map(|op| match op {
                SimOp::Write(w) | SimOp::BatchedWrite(w) if w.reg == reg => Some(w.value),
                _ => None,
            })
            .collect()
    }
}

fn format_index(fourcc: u32) -> Result<u32> {
    PixelFormat::ALL
        .iter()
        .position(|f| f.fourcc() == fourcc)
        .map(|i| i as u32)
        .ok_or(KmsError::Invalid("unsupported pixel format"))
}

fn plane_ctl_value(regs: &PlaneRegs) -> Result<u32> {
    let format = format_index(regs.format)?;
    Ok(plane_ctl::ENABLE
        | ((format << plane_ctl::FORMAT_SHIFT) & plane_ctl::FORMAT_MASK)
        | ((regs.rotation.bits() << plane_ctl::ROTATION_SHIFT) & plane_ctl::ROTATION_MASK))
}

fn pack(hi: u32, lo: u32) -> u32 {
    ((hi & 0xffff) << 16) | (lo & 0xffff)
}

/// Sign-magnitude cursor coordinate.
fn cursor_coord(v: i32) -> u32 {
    let magnitude = v.unsigned_abs() & 0x7fff;
    if v < 0 {
        0x8000 | magnitude
    } else {
        magnitude
    }
}

impl HardwareOps for SimHardware {
    fn read(&self, reg: Reg) -> u32 {
        self.with_irqs(|inner, irqs| inner.read(reg, irqs))
    }

    fn write(&self, reg: Reg, value: u32) {
        self.with_irqs(|inner, irqs| {
            inner.ops.push(SimOp::Write(RegWrite::new(reg, value)));
            inner.store(reg, value, irqs);
        });
    }

    fn frame_counter_style(&self) -> FrameCounterStyle {
        lock(&self.inner).config.frame_counter_style
    }

    fn vblank_timestamp(&self, pipe: PipeId) -> Duration {
        let ns = lock(&self.inner).pipe(pipe).map_or(0, |p| p.vblank_ns);
        Duration::from_nanos(ns)
    }

    fn wait_for_vblank(&self, pipe: PipeId) {
        self.advance_to_vblank(pipe);
    }

    fn max_data_rate(&self, _active_planes: u32) -> u32 {
        lock(&self.inner).config.max_data_rate
    }

    fn num_scalers(&self, _pipe: PipeId) -> u32 {
        lock(&self.inner).config.num_scalers
    }

    fn scanline_offset(&self, _pipe: PipeId) -> u32 {
        lock(&self.inner).config.scanline_offset
    }

    fn has_command_buffer(&self) -> bool {
        lock(&self.inner).config.command_buffer
    }

    fn wake_latency_us(&self) -> u32 {
        lock(&self.inner).config.wake_latency_us
    }

    fn latched_surface(&self, target: FlipTarget) -> Option<u32> {
        let reg = match target {
            FlipTarget::Pipe(pipe) => primary::surflive(pipe),
            FlipTarget::Surface(surface) => overlay::surflive(surface),
        };
        Some(lock(&self.inner).reg(reg))
    }

    fn pipe_disable(&self, pipe: PipeId) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::PipeDisable)?;
        inner.ops.push(SimOp::PipeDisable(pipe));
        if let Some(state) = inner.pipes.get_mut(pipe.index()) {
            state.enabled = false;
        }
        let conf = inner.reg(timing::conf(pipe)) & !timing::CONF_ENABLE;
        inner.regs.insert(timing::conf(pipe), conf);
        Ok(())
    }

    fn pipe_mode_set(
        &self,
        pipe: PipeId,
        mode: &ModeTiming,
        vrr: Option<VrrTiming>,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::ModeSet)?;
        inner.ops.push(SimOp::ModeSet {
            pipe,
            mode: *mode,
            vrr,
        });
        let Some(state) = inner.pipes.get_mut(pipe.index()) else {
            return Err(KmsError::Hardware(format!("pipe {pipe} does not exist")));
        };
        state.mode = Some(*mode);
        state.vrr = vrr;
        state.line = 0;

        let regs = &mut inner.regs;
        let htotal = pack(mode.htotal.saturating_sub(1), mode.hdisplay.saturating_sub(1));
        let vtotal = pack(mode.vtotal.saturating_sub(1), mode.vdisplay.saturating_sub(1));
        regs.insert(timing::htotal(pipe), htotal);
        regs.insert(timing::vtotal(pipe), vtotal);
        let conf = regs.get(&timing::conf(pipe)).copied().unwrap_or(0);
        match vrr {
            Some(vrr) => {
                regs.insert(timing::vrr_vmin(pipe), vrr.vmin.saturating_sub(1));
                regs.insert(timing::vrr_vmax(pipe), vrr.vmax.saturating_sub(1));
                regs.insert(timing::conf(pipe), conf | timing::CONF_VRR_ENABLE);
            }
            None => {
                regs.insert(timing::conf(pipe), conf & !timing::CONF_VRR_ENABLE);
            }
        }
        Ok(())
    }

    fn pipe_enable(&self, pipe: PipeId) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::PipeEnable)?;
        inner.ops.push(SimOp::PipeEnable(pipe));
        if let Some(state) = inner.pipes.get_mut(pipe.index()) {
            state.enabled = true;
        }
        let conf = inner.reg(timing::conf(pipe)) | timing::CONF_ENABLE;
        inner.regs.insert(timing::conf(pipe), conf);
        Ok(())
    }

    fn pipe_off(&self, pipe: PipeId) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::PipeOff)?;
        inner.ops.push(SimOp::PipeOff(pipe));
        if let Some(state) = inner.pipes.get_mut(pipe.index()) {
            state.mode = None;
            state.vrr = None;
            state.enabled = false;
        }
        inner.regs.insert(timing::conf(pipe), 0);
        Ok(())
    }

    fn route_outputs(&self, routes: &[SinkRoute]) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::RouteOutputs)?;
        for r in routes {
            let value = match r.pipe {
                Some(pipe) => {
                    let dpms = if r.dpms_on { route::DPMS_ON } else { 0 };
                    route::ENABLE | ((u32::from(pipe.0) << route::PIPE_SHIFT) & route::PIPE_MASK) | dpms
                }
                None => 0,
            };
            inner.regs.insert(route::sink(r.sink), value);
        }
        inner.ops.push(SimOp::Route(routes.to_vec()));
        Ok(())
    }

    fn plane_writes(&self, target: FlipTarget, regs: &PlaneRegs) -> Result<Vec<RegWrite>> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::PlaneWrites)?;

        let writes = match target {
            FlipTarget::Pipe(pipe) => {
                if !regs.enabled {
                    vec![
                        RegWrite::new(primary::ctl(pipe), 0),
                        RegWrite::new(primary::surf(pipe), 0),
                    ]
                } else {
                    vec![
                        RegWrite::new(primary::ctl(pipe), plane_ctl_value(regs)?),
                        RegWrite::new(primary::stride(pipe), regs.stride),
                        RegWrite::new(
                            primary::size(pipe),
                            pack(regs.dst_h.saturating_sub(1), regs.dst_w.saturating_sub(1)),
                        ),
                        RegWrite::new(primary::offset(pipe), pack(regs.src_y, regs.src_x)),
                        RegWrite::new(primary::surf(pipe), regs.surface_addr),
                    ]
                }
            }
            FlipTarget::Surface(surface) => {
                inner.overlays.insert(surface);
                if !regs.enabled {
                    vec![
                        RegWrite::new(overlay::ctl(surface), 0),
                        RegWrite::new(overlay::scaler_ctl(surface), 0),
                        RegWrite::new(overlay::surf(surface), 0),
                    ]
                } else {
                    let scaler = match regs.scaler {
                        None => 0,
                        Some(ScalerMode::Normal) => overlay::SCALER_ENABLE,
                        Some(ScalerMode::HighQuality) => {
                            overlay::SCALER_ENABLE | overlay::SCALER_HQ
                        }
                    };
                    vec![
                        RegWrite::new(overlay::ctl(surface), plane_ctl_value(regs)?),
                        RegWrite::new(overlay::stride(surface), regs.stride),
                        RegWrite::new(overlay::pos(surface), pack(regs.dst_y, regs.dst_x)),
                        RegWrite::new(
                            overlay::size(surface),
                            pack(regs.dst_h.saturating_sub(1), regs.dst_w.saturating_sub(1)),
                        ),
                        RegWrite::new(overlay::offset(surface), pack(regs.src_y, regs.src_x)),
                        RegWrite::new(
                            overlay::scale(surface),
                            pack(regs.src_h.saturating_sub(1), regs.src_w.saturating_sub(1)),
                        ),
                        RegWrite::new(overlay::scaler_ctl(surface), scaler),
                        RegWrite::new(overlay::surf(surface), regs.surface_addr),
                    ]
                }
            }
        };
        Ok(writes)
    }

    fn cursor_writes(&self, pipe: PipeId, regs: &CursorRegs) -> Vec<RegWrite> {
        if !regs.enabled {
            return vec![
                RegWrite::new(cursor::ctl(pipe), 0),
                RegWrite::new(cursor::base(pipe), 0),
            ];
        }
        vec![
            RegWrite::new(cursor::ctl(pipe), cursor::CTL_MODE_64),
            RegWrite::new(
                cursor::pos(pipe),
                (cursor_coord(regs.y) << 16) | cursor_coord(regs.x),
            ),
            RegWrite::new(cursor::base(pipe), regs.addr),
        ]
    }

    fn upload_command_buffer(&self, pipe: PipeId, engine_id: u8, words: &[u32]) -> Result<u32> {
        let mut inner = lock(&self.inner);
        inner.take_failure(SimFailure::Upload)?;
        if !inner.config.command_buffer {
            return Err(KmsError::Hardware("no command buffer engine".into()));
        }
        let slot = u32::from(pipe.0) * u32::from(engine::ENGINES) + u32::from(engine_id);
        let addr = COMMAND_BUFFER_BASE + slot * COMMAND_BUFFER_STRIDE;
        inner.memory.insert(addr, words.to_vec());
        inner.ops.push(SimOp::Upload {
            pipe,
            engine: engine_id,
            dwords: words.len(),
        });
        Ok(addr)
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    pins: HashMap<BoHandle, u32>,
    cursor_pins: HashMap<BoHandle, u32>,
    fences: HashMap<BoHandle, Fence>,
    rings: HashMap<RingId, u32>,
    fail_pin: HashSet<BoHandle>,
    finished: Vec<BoHandle>,
    wedged: bool,
}

/// Buffer manager with pin counting and fences on simulated rings.
#[derive(Debug, Default)]
pub struct SimBuffers {
    inner: Mutex<BufferInner>,
}

impl SimBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device address a pinned buffer is mapped at.
    pub fn address(bo: BoHandle) -> u32 {
        0x1000_0000u32.wrapping_add(bo.0.wrapping_mul(0x10_0000))
    }

    pub fn pin_count(&self, bo: BoHandle) -> u32 {
        lock(&self.inner).pins.get(&bo).copied().unwrap_or(0)
    }

    pub fn cursor_pin_count(&self, bo: BoHandle) -> u32 {
        lock(&self.inner).cursor_pins.get(&bo).copied().unwrap_or(0)
    }

    /// Rendering to `bo` completes once `fence.ring` reaches `fence.seqno`.
    pub fn set_fence(&self, bo: BoHandle, fence: Fence) {
        lock(&self.inner).fences.insert(bo, fence);
    }

    /// Advance `ring` to `seqno`.
    pub fn signal(&self, ring: RingId, seqno: u32) {
        lock(&self.inner).rings.insert(ring, seqno);
    }

    pub fn set_fail_pin(&self, bo: BoHandle, fail: bool) {
        let mut inner = lock(&self.inner);
        if fail {
            inner.fail_pin.insert(bo);
        } else {
            inner.fail_pin.remove(&bo);
        }
    }

    /// Buffers waited on through [`BufferManager::finish`], oldest first.
    pub fn finished(&self) -> Vec<BoHandle> {
        lock(&self.inner).finished.clone()
    }

    pub fn set_wedged(&self, wedged: bool) {
        lock(&self.inner).wedged = wedged;
    }
}

fn unpin_from(pins: &mut HashMap<BoHandle, u32>, bo: BoHandle, what: &str) {
    match pins.get_mut(&bo) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            pins.remove(&bo);
        }
        None => error!(bo = bo.0, "unbalanced {what} unpin"),
    }
}

impl BufferManager for SimBuffers {
    fn pin(&self, bo: BoHandle) -> Result<u32> {
        let mut inner = lock(&self.inner);
        if inner.fail_pin.contains(&bo) {
            return Err(KmsError::Resource(format!("cannot pin buffer {}", bo.0)));
        }
        *inner.pins.entry(bo).or_insert(0) += 1;
        Ok(Self::address(bo))
    }

    fn unpin(&self, bo: BoHandle) {
        unpin_from(&mut lock(&self.inner).pins, bo, "buffer");
    }

    fn pin_cursor(&self, bo: BoHandle) -> Result<u32> {
        let mut inner = lock(&self.inner);
        if inner.fail_pin.contains(&bo) {
            return Err(KmsError::Resource(format!("cannot pin cursor {}", bo.0)));
        }
        *inner.cursor_pins.entry(bo).or_insert(0) += 1;
        Ok(Self::address(bo))
    }

    fn unpin_cursor(&self, bo: BoHandle) {
        unpin_from(&mut lock(&self.inner).cursor_pins, bo, "cursor");
    }

    fn last_fence(&self, bo: BoHandle) -> Option<Fence> {
        lock(&self.inner).fences.get(&bo).copied()
    }

    fn ring_seqno(&self, ring: RingId) -> u32 {
        lock(&self.inner).rings.get(&ring).copied().unwrap_or(0)
    }

    fn finish(&self, bo: BoHandle) {
        let mut inner = lock(&self.inner);
        if let Some(fence) = inner.fences.remove(&bo) {
            let current = inner.rings.get(&fence.ring).copied().unwrap_or(0);
            if !fence.passed(current) {
                inner.rings.insert(fence.ring, fence.seqno);
            }
        }
        inner.finished.push(bo);
    }

    fn is_wedged(&self) -> bool {
        lock(&self.inner).wedged
    }
}
