mod common;

use aero_kms::regs::primary;
use aero_kms::sim::{SimBuffers, SimConfig, SimFailure, SimOp};
use aero_kms::{
    BoHandle, CommitFlags, DisplayConfig, DisplayLayout, KmsError, ModeTiming, ObjectId, PipeId,
    Property,
};
use common::*;
use pretty_assertions::assert_eq;

#[test]
fn failed_plane_programming_restores_the_old_buffer() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.hw.fail_next(SimFailure::PlaneWrites);

    let mut txn = rig.ctl.begin(0);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(b.0), None)
        .unwrap();
    let err = txn.commit(CommitFlags::empty()).unwrap_err();
    assert_eq!(err, KmsError::Hardware("injected PlaneWrites failure".into()));
    assert!(!err.is_validation());
    txn.end();

    let addr = SimBuffers::address(BoHandle(1));
    assert_eq!(rig.hw.reg(primary::surf(PipeId(0))), addr);
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 0);
    assert_eq!(rig.ctl.pipe_state(PipeId(0)).unwrap().fb, Some(a));
    assert_eq!(rig.ctl.framebuffer_refcount(b), 1);
}

#[test]
fn failed_mode_set_replays_the_previous_mode() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    enable_pipe(&mut rig, 0, a);
    rig.hw.clear_ops();
    rig.hw.fail_next(SimFailure::ModeSet);

    let mut txn = rig.ctl.begin(0);
    txn.set_property(
        ObjectId::Pipe(PipeId(0)),
        Property::Mode,
        0,
        Some(&mode_blob(&ModeTiming::hd_60())),
    )
    .unwrap();
    assert!(matches!(
        txn.commit(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Hardware(_))
    ));
    txn.end();

    let ops = rig.hw.ops();
    let mode_sets: Vec<ModeTiming> = ops
        .iter()
        .filter_map(|op| match op {
            SimOp::ModeSet { mode, .. } => Some(*mode),
            _ => None,
        })
        .collect();
    assert_eq!(mode_sets, vec![ModeTiming::fhd_60()]);
    assert_eq!(ops.first(), Some(&SimOp::PipeDisable(PipeId(0))));
    assert_eq!(ops.last(), Some(&SimOp::PipeEnable(PipeId(0))));

    assert_eq!(
        rig.ctl.pipe_state(PipeId(0)).unwrap().mode,
        Some(ModeTiming::fhd_60())
    );
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
}

#[test]
fn pin_failure_leaves_hardware_untouched() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.ctl.process_interrupts();
    rig.hw.clear_ops();
    rig.buffers.set_fail_pin(BoHandle(2), true);

    let err = flip(&mut rig, 0, b, 1).unwrap_err();
    assert_eq!(err, KmsError::Resource("cannot pin buffer 2".into()));
    assert!(!err.is_retryable());

    assert_eq!(rig.hw.ops(), Vec::new());
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 0);
    assert_eq!(rig.ctl.pipe_state(PipeId(0)).unwrap().fb, Some(a));
    assert!(!rig.ctl.flips().has_pending(PipeId(0)));
    let events = rig.ctl.events();
    assert_eq!(events.available_space(), events.capacity());
}

#[test]
fn exhausted_event_space_fails_before_any_side_effect() {
    let mut rig = rig_with(
        DisplayLayout::simple(1, 1),
        SimConfig::default(),
        DisplayConfig {
            event_space: 32,
            ..DisplayConfig::default()
        },
    );
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    let small = add_fb(&mut rig, 64, 64, 3);
    enable_pipe(&mut rig, 0, a);
    rig.hw.clear_ops();

    let mut txn = rig.ctl.begin(9);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(b.0), None)
        .unwrap();
    place_surface(&mut txn, 0, 0, small, 10, 10, 64);
    assert_eq!(
        txn.commit(CommitFlags::EVENT),
        Err(KmsError::NoSpace("event space exhausted"))
    );
    txn.end();

    assert_eq!(rig.ctl.events().available_space(), 32);
    assert!(rig.ctl.events().is_empty());
    assert_eq!(rig.hw.ops(), Vec::new());
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 0);
    assert_eq!(rig.buffers.pin_count(BoHandle(3)), 0);

    // The same change without an event goes through.
    let mut txn = rig.ctl.begin(9);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(b.0), None)
        .unwrap();
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 1);
}
