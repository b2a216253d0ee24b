//! Register offsets and bit definitions shared by the generic commit code and the simulated
//! display engine.
//!
//! Only the registers the generic paths touch are described here: scanline and frame counters,
//! the command-buffer engines, and the scanout blocks programmed by [`crate::sim::SimHardware`].
//! Real generations map their own plane layouts behind [`crate::hw::HardwareOps`].

use crate::object::{PipeId, SinkId, SurfaceId};

/// MMIO register offset.
pub type Reg = u32;

const PIPE_STRIDE: u32 = 0x1000;

const fn pipe_reg(base: Reg, pipe: PipeId) -> Reg {
    base + pipe.0 as u32 * PIPE_STRIDE
}

/// Scanline and frame counters.
pub mod counter {
    use super::*;

    /// Current hardware scanline (display scan line) of a pipe.
    pub const fn pipedsl(pipe: PipeId) -> Reg {
        pipe_reg(0x70000, pipe)
    }
    pub const PIPEDSL_LINE_MASK: u32 = 0x1fff;

    /// Legacy frame counter, high 16 bits.
    pub const fn pipeframe(pipe: PipeId) -> Reg {
        pipe_reg(0x70040, pipe)
    }
    pub const PIPEFRAME_HIGH_MASK: u32 = 0xffff;

    /// Legacy frame counter low 8 bits (31:24) plus pixel count (23:0).
    pub const fn pipeframepixel(pipe: PipeId) -> Reg {
        pipe_reg(0x70044, pipe)
    }
    pub const PIPEFRAMEPIXEL_LOW_SHIFT: u32 = 24;
    pub const PIPEFRAMEPIXEL_PIXEL_MASK: u32 = 0x00ff_ffff;

    /// Wide 32-bit frame counter.
    pub const fn pipe_frmcount(pipe: PipeId) -> Reg {
        pipe_reg(0x70048, pipe)
    }
}

/// Pipe timing generator.
pub mod pipe {
    use super::*;

    pub const fn conf(pipe: PipeId) -> Reg {
        pipe_reg(0x70008, pipe)
    }
    pub const CONF_ENABLE: u32 = 1 << 31;
    pub const CONF_VRR_ENABLE: u32 = 1 << 21;

    /// `(htotal - 1) << 16 | (hdisplay - 1)`.
    pub const fn htotal(pipe: PipeId) -> Reg {
        pipe_reg(0x60000, pipe)
    }
    /// `(vtotal - 1) << 16 | (vdisplay - 1)`.
    pub const fn vtotal(pipe: PipeId) -> Reg {
        pipe_reg(0x6000c, pipe)
    }
    pub const fn vrr_vmax(pipe: PipeId) -> Reg {
        pipe_reg(0x60420, pipe)
    }
    pub const fn vrr_vmin(pipe: PipeId) -> Reg {
        pipe_reg(0x60424, pipe)
    }
}

/// Primary plane of a pipe.
pub mod primary {
    use super::*;

    pub const fn ctl(pipe: PipeId) -> Reg {
        pipe_reg(0x70180, pipe)
    }
    pub const fn stride(pipe: PipeId) -> Reg {
        pipe_reg(0x70188, pipe)
    }
    pub const fn size(pipe: PipeId) -> Reg {
        pipe_reg(0x70190, pipe)
    }
    pub const fn surf(pipe: PipeId) -> Reg {
        pipe_reg(0x7019c, pipe)
    }
    /// `y << 16 | x` pan offset inside the framebuffer.
    pub const fn offset(pipe: PipeId) -> Reg {
        pipe_reg(0x701a4, pipe)
    }
    /// Read-only copy of `surf` as latched at the last vblank.
    pub const fn surflive(pipe: PipeId) -> Reg {
        pipe_reg(0x701ac, pipe)
    }
}

/// Cursor plane of a pipe.
pub mod cursor {
    use super::*;

    pub const fn ctl(pipe: PipeId) -> Reg {
        pipe_reg(0x70080, pipe)
    }
    pub const fn base(pipe: PipeId) -> Reg {
        pipe_reg(0x70084, pipe)
    }
    /// Sign-magnitude position: `y` in 31:16 (sign bit 31), `x` in 15:0 (sign bit 15).
    pub const fn pos(pipe: PipeId) -> Reg {
        pipe_reg(0x70088, pipe)
    }
    pub const CTL_MODE_64: u32 = 0x27;
}

/// Overlay surfaces, addressed by surface id.
pub mod overlay {
    use super::*;

    const BASE: Reg = 0x78000;
    const STRIDE: Reg = 0x100;

    const fn reg(surface: SurfaceId, offset: Reg) -> Reg {
        BASE + surface.0 as u32 * STRIDE + offset
    }

    pub const fn ctl(surface: SurfaceId) -> Reg {
        reg(surface, 0x00)
    }
    pub const fn stride(surface: SurfaceId) -> Reg {
        reg(surface, 0x08)
    }
    /// `y << 16 | x` destination position (clipped, non-negative).
    pub const fn pos(surface: SurfaceId) -> Reg {
        reg(surface, 0x0c)
    }
    /// `(h - 1) << 16 | (w - 1)` destination size.
    pub const fn size(surface: SurfaceId) -> Reg {
        reg(surface, 0x10)
    }
    pub const fn surf(surface: SurfaceId) -> Reg {
        reg(surface, 0x1c)
    }
    /// `y << 16 | x` source offset in whole pixels.
    pub const fn offset(surface: SurfaceId) -> Reg {
        reg(surface, 0x24)
    }
    pub const fn surflive(surface: SurfaceId) -> Reg {
        reg(surface, 0x2c)
    }
    /// `(h - 1) << 16 | (w - 1)` source size in whole pixels.
    pub const fn scale(surface: SurfaceId) -> Reg {
        reg(surface, 0x30)
    }
    pub const fn scaler_ctl(surface: SurfaceId) -> Reg {
        reg(surface, 0x34)
    }
    pub const SCALER_ENABLE: u32 = 1 << 31;
    pub const SCALER_HQ: u32 = 1 << 30;
}

/// Bits shared by plane control registers.
pub mod plane_ctl {
    pub const ENABLE: u32 = 1 << 31;
    pub const FORMAT_SHIFT: u32 = 24;
    pub const FORMAT_MASK: u32 = 0xf << FORMAT_SHIFT;
    pub const ROTATION_SHIFT: u32 = 0;
    pub const ROTATION_MASK: u32 = 0x3f;
}

/// Sink routing.
pub mod route {
    use super::*;

    pub const fn sink(sink: SinkId) -> Reg {
        0x61000 + sink.0 as u32 * 0x100
    }
    pub const ENABLE: u32 = 1 << 31;
    pub const PIPE_SHIFT: u32 = 29;
    pub const PIPE_MASK: u32 = 0x3 << PIPE_SHIFT;
    pub const DPMS_ON: u32 = 1 << 0;
}

/// Command buffer (display state buffer) engines. Each pipe owns [`dsb::ENGINES`] of them.
pub mod dsb {
    use super::*;

    pub const ENGINES: u8 = 3;
    const BASE: Reg = 0x70b00;
    const ENGINE_STRIDE: Reg = 0x100;

    const fn reg(pipe: PipeId, id: u8, offset: Reg) -> Reg {
        BASE + pipe.0 as u32 * PIPE_STRIDE + id as u32 * ENGINE_STRIDE + offset
    }

    pub const HEAD: Reg = 0x0;
    pub const TAIL: Reg = 0x4;
    pub const CTRL: Reg = 0x8;
    pub const POLLFUNC: Reg = 0x10;
    pub const POLLMASK: Reg = 0x1c;
    pub const STATUS: Reg = 0x24;
    pub const INTERRUPT: Reg = 0x28;
    pub const CURRENT_HEAD: Reg = 0x2c;
    pub const PMCTRL: Reg = 0x38;
    pub const PMCTRL_2: Reg = 0x3c;
    pub const BUFRPT_CNT: Reg = 0x44;
    pub const CHICKEN: Reg = 0xf0;

    pub const fn head(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, HEAD)
    }
    pub const fn tail(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, TAIL)
    }
    pub const fn ctrl(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, CTRL)
    }
    pub const fn pollfunc(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, POLLFUNC)
    }
    pub const fn pollmask(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, POLLMASK)
    }
    pub const fn status(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, STATUS)
    }
    pub const fn interrupt(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, INTERRUPT)
    }
    pub const fn current_head(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, CURRENT_HEAD)
    }
    pub const fn pmctrl(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, PMCTRL)
    }
    pub const fn pmctrl_2(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, PMCTRL_2)
    }
    pub const fn bufrpt_cnt(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, BUFRPT_CNT)
    }
    pub const fn chicken(pipe: PipeId, id: u8) -> Reg {
        reg(pipe, id, CHICKEN)
    }

    /// Split an engine register into `(pipe, engine, offset)`.
    pub fn decode(reg: Reg) -> Option<(PipeId, u8, Reg)> {
        let rel = reg.checked_sub(BASE)?;
        let pipe = rel / PIPE_STRIDE;
        let within = rel % PIPE_STRIDE;
        let id = within / ENGINE_STRIDE;
        if pipe as usize >= crate::object::MAX_PIPES || id >= u32::from(ENGINES) {
            return None;
        }
        Some((PipeId(pipe as u8), id as u8, within % ENGINE_STRIDE))
    }

    // CTRL
    pub const CTRL_ENABLE: u32 = 1 << 31;
    pub const CTRL_BUF_REITERATE: u32 = 1 << 29;
    pub const CTRL_WAIT_FOR_VBLANK: u32 = 1 << 28;
    pub const CTRL_HALT: u32 = 1 << 16;
    pub const CTRL_NON_POSTED: u32 = 1 << 8;
    pub const CTRL_STATUS_BUSY: u32 = 1 << 0;

    // POLLFUNC
    pub const POLL_ENABLE: u32 = 1 << 31;
    pub const fn poll_wait(usecs: u32) -> u32 {
        (usecs & 0xff) << 23
    }
    pub const fn poll_count(count: u32) -> u32 {
        (count & 0x3f_ffff) << 1
    }

    // INTERRUPT
    pub const ATS_FAULT_INT_EN: u32 = 1 << 20;
    pub const GTT_FAULT_INT_EN: u32 = 1 << 19;
    pub const RSPTIMEOUT_INT_EN: u32 = 1 << 18;
    pub const POLL_ERR_INT_EN: u32 = 1 << 17;
    pub const PROG_INT_EN: u32 = 1 << 16;
    pub const ATS_FAULT_INT_STATUS: u32 = 1 << 4;
    pub const GTT_FAULT_INT_STATUS: u32 = 1 << 3;
    pub const RSPTIMEOUT_INT_STATUS: u32 = 1 << 2;
    pub const POLL_ERR_INT_STATUS: u32 = 1 << 1;
    pub const PROG_INT_STATUS: u32 = 1 << 0;

    pub const ERROR_INT_STATUS: u32 =
        ATS_FAULT_INT_STATUS | GTT_FAULT_INT_STATUS | RSPTIMEOUT_INT_STATUS | POLL_ERR_INT_STATUS;
    pub const ERROR_INT_EN: u32 =
        ATS_FAULT_INT_EN | GTT_FAULT_INT_EN | RSPTIMEOUT_INT_EN | POLL_ERR_INT_EN;

    // PMCTRL / PMCTRL_2
    pub const ENABLE_DEWAKE: u32 = 1 << 31;
    pub const SCANLINE_FOR_DEWAKE_MASK: u32 = 0x7fff_ffff;
    pub const FORCE_DEWAKE: u32 = 1 << 23;
    pub const BLOCK_DEWAKE_EXTENSION: u32 = 1 << 15;

    // CHICKEN
    pub const SKIP_WAITS_EN: u32 = 1 << 23;
    pub const CTRL_WAIT_SAFE_WINDOW: u32 = 1 << 17;
    pub const CTRL_NO_WAIT_VBLANK: u32 = 1 << 16;
    pub const INST_WAIT_SAFE_WINDOW: u32 = 1 << 7;
    pub const INST_NO_WAIT_VBLANK: u32 = 1 << 6;
}
