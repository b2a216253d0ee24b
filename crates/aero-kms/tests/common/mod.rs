#![allow(dead_code)]

use std::sync::Arc;

use aero_kms::sim::{SimBuffers, SimConfig, SimHardware};
use aero_kms::{
    BoHandle, CommitFlags, DisplayConfig, DisplayController, DisplayLayout, FbId, Framebuffer,
    ModeTiming, ObjectId, PipeId, PixelFormat, Property, SurfaceId,
};

pub struct Rig {
    pub hw: Arc<SimHardware>,
    pub buffers: Arc<SimBuffers>,
    pub ctl: DisplayController,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn rig(layout: DisplayLayout) -> Rig {
    rig_with(layout, SimConfig::default(), DisplayConfig::default())
}

pub fn rig_with(layout: DisplayLayout, sim: SimConfig, config: DisplayConfig) -> Rig {
    init_tracing();
    let hw = Arc::new(SimHardware::new(sim));
    let buffers = Arc::new(SimBuffers::new());
    let ctl = DisplayController::new(layout, config, hw.clone(), buffers.clone())
        .expect("controller must accept the test layout");
    hw.connect_irq(ctl.irq_sender());
    Rig { hw, buffers, ctl }
}

pub fn mode_blob(mode: &ModeTiming) -> Vec<u8> {
    mode.to_blob().to_vec()
}

pub fn sink_blob(ids: &[u32]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_le_bytes()).collect()
}

pub fn add_fb(rig: &mut Rig, width: u32, height: u32, bo: u32) -> FbId {
    rig.ctl
        .add_framebuffer(Framebuffer::new(width, height, PixelFormat::Xrgb8888, BoHandle(bo)))
        .expect("framebuffer must be accepted")
}

/// 1080p framebuffer backed by buffer object `bo`.
pub fn fhd_fb(rig: &mut Rig, bo: u32) -> FbId {
    add_fb(rig, 1920, 1080, bo)
}

/// Blocking modeset of `pipe` onto sink `pipe` at 1080p60, scanning out `fb`.
pub fn enable_pipe(rig: &mut Rig, pipe: u8, fb: FbId) {
    let mut txn = rig.ctl.begin(0);
    let object = ObjectId::Pipe(PipeId(pipe));
    txn.set_property(object, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    txn.set_property(object, Property::ConnectorIds, 0, Some(&sink_blob(&[u32::from(pipe)])))
        .unwrap();
    txn.set_property(object, Property::FbId, u64::from(fb.0), None)
        .unwrap();
    txn.commit(CommitFlags::ALLOW_MODESET)
        .expect("blocking modeset must succeed");
    txn.end();
}

/// Non-blocking page flip of `pipe` to `fb`.
pub fn flip(rig: &mut Rig, pipe: u8, fb: FbId, user_data: u64) -> aero_kms::Result<()> {
    let mut txn = rig.ctl.begin(user_data);
    txn.set_property(ObjectId::Pipe(PipeId(pipe)), Property::FbId, u64::from(fb.0), None)?;
    let result = txn.commit(CommitFlags::NONBLOCK | CommitFlags::EVENT);
    txn.end();
    result
}

/// Attach `surface` to `pipe` showing `fb` unscaled at `(x, y)`.
pub fn place_surface(
    txn: &mut aero_kms::Transaction<'_>,
    surface: u8,
    pipe: u8,
    fb: FbId,
    x: i32,
    y: i32,
    size: u32,
) {
    let object = ObjectId::Surface(SurfaceId(surface));
    let set = |txn: &mut aero_kms::Transaction<'_>, property, value: u64| {
        txn.set_property(object, property, value, None).unwrap();
    };
    set(txn, Property::PipeId, u64::from(pipe) + 1);
    set(txn, Property::FbId, u64::from(fb.0));
    set(txn, Property::SrcX, 0);
    set(txn, Property::SrcY, 0);
    set(txn, Property::SrcW, u64::from(size) << 16);
    set(txn, Property::SrcH, u64::from(size) << 16);
    set(txn, Property::DstX, i64::from(x) as u64);
    set(txn, Property::DstY, i64::from(y) as u64);
    set(txn, Property::DstW, u64::from(size));
    set(txn, Property::DstH, u64::from(size));
}

/// Run `pipe` to its next vblank and let the controller consume the interrupts.
pub fn next_vblank(rig: &Rig, pipe: u8) {
    rig.hw.advance_to_vblank(PipeId(pipe));
    rig.ctl.process_interrupts();
}
