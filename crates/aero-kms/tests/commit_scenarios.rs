mod common;

use aero_kms::hw::Fence;
use aero_kms::regs::{overlay, primary};
use aero_kms::sim::{SimBuffers, SimOp};
use aero_kms::state::Dpms;
use aero_kms::{
    BoHandle, CommitFlags, DisplayLayout, IrqEvent, KmsError, ModeTiming, ObjectId, ObjectState,
    PipeId, Property, RingId, SinkId, SurfaceId,
};
use common::*;
use pretty_assertions::assert_eq;

#[test]
fn blocking_modeset_programs_routing_timing_planes_then_enables() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let fb = fhd_fb(&mut rig, 1);
    enable_pipe(&mut rig, 0, fb);

    let ops = rig.hw.ops();
    assert!(matches!(ops.first(), Some(SimOp::Route(_))));
    assert!(matches!(
        ops.get(1),
        Some(SimOp::ModeSet { pipe: PipeId(0), vrr: None, .. })
    ));
    assert_eq!(ops.last(), Some(&SimOp::PipeEnable(PipeId(0))));
    assert!(!ops.contains(&SimOp::PipeDisable(PipeId(0))));

    let addr = SimBuffers::address(BoHandle(1));
    assert_eq!(rig.hw.writes_to(primary::surf(PipeId(0))), vec![addr]);
    // The commit waited for the vblank that latched the new surface.
    assert_eq!(rig.hw.reg(primary::surflive(PipeId(0))), addr);
    assert_eq!(rig.hw.frame(PipeId(0)), 1);

    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
    assert_eq!(rig.ctl.sink_state(SinkId(0)).unwrap().dpms, Dpms::On);
    let pipe = rig.ctl.pipe_state(PipeId(0)).unwrap();
    assert_eq!(pipe.mode, Some(ModeTiming::fhd_60()));
    assert_eq!(pipe.fb, Some(fb));
    assert_eq!(rig.ctl.stats().commits_blocking, 1);
}

#[test]
fn commit_without_changes_touches_no_hardware() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let fb = fhd_fb(&mut rig, 1);
    enable_pipe(&mut rig, 0, fb);
    rig.hw.clear_ops();
    let before = rig.ctl.stats();

    let mut txn = rig.ctl.begin(0);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(fb.0), None)
        .unwrap();
    let summary = txn.check(CommitFlags::empty()).unwrap();
    assert!(summary.is_empty());
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();

    assert_eq!(rig.hw.ops(), Vec::new());
    assert_eq!(rig.ctl.stats().commits_blocking, before.commits_blocking);
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
}

#[test]
fn disabling_a_pipe_turns_it_off_and_releases_its_buffer() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let fb = fhd_fb(&mut rig, 1);
    enable_pipe(&mut rig, 0, fb);
    rig.hw.clear_ops();

    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::Mode, 0, Some(&[])).unwrap();
    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&[]))
        .unwrap();
    txn.set_property(pipe, Property::FbId, 0, None).unwrap();
    txn.commit(CommitFlags::ALLOW_MODESET).unwrap();
    txn.end();

    let ops = rig.hw.ops();
    assert_eq!(ops.first(), Some(&SimOp::PipeDisable(PipeId(0))));
    assert!(ops.contains(&SimOp::PipeOff(PipeId(0))));
    assert!(!ops.contains(&SimOp::PipeEnable(PipeId(0))));

    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 0);
    assert_eq!(rig.buffers.finished(), vec![BoHandle(1)]);
    assert_eq!(rig.ctl.sink_state(SinkId(0)).unwrap().dpms, Dpms::Off);
    assert_eq!(rig.ctl.sink_state(SinkId(0)).unwrap().pipe, None);
    assert_eq!(rig.ctl.framebuffer_refcount(fb), 1);
}

#[test]
fn abandoned_transaction_releases_every_reference() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    // Creator plus the live pipe state.
    assert_eq!(rig.ctl.framebuffer_refcount(a), 2);
    assert_eq!(rig.ctl.framebuffer_refcount(b), 1);

    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::FbId, u64::from(b.0), None)
        .unwrap();
    let ObjectState::Pipe(pair) = txn.get_object_state(pipe).unwrap() else {
        panic!("expected pipe state");
    };
    assert_eq!(pair.old.fb, Some(a));
    assert_eq!(pair.new.fb, Some(b));
    txn.end();

    assert_eq!(rig.ctl.framebuffer_refcount(a), 2);
    assert_eq!(rig.ctl.framebuffer_refcount(b), 1);
    assert_eq!(rig.ctl.pipe_state(PipeId(0)).unwrap().fb, Some(a));
}

#[test]
fn removed_framebuffer_stays_alive_while_scanned_out() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);

    rig.ctl.remove_framebuffer(a).unwrap();
    assert_eq!(rig.ctl.framebuffer_refcount(a), 1);
    assert!(rig.ctl.framebuffer(a).is_none());

    // New references to a removed framebuffer are refused.
    let mut txn = rig.ctl.begin(0);
    assert_eq!(
        txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(a.0), None),
        Err(KmsError::UnknownFramebuffer(a.0))
    );
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(b.0), None)
        .unwrap();
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();

    assert_eq!(rig.ctl.framebuffer_refcount(a), 0);
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 0);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 1);
}

#[test]
fn nonblocking_flip_latches_one_frame_after_arming() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.ctl.process_interrupts();
    rig.hw.clear_ops();

    let frame = rig.hw.frame(PipeId(0));
    flip(&mut rig, 0, b, 7).unwrap();
    assert!(rig.ctl.events().is_empty());

    // Arm: evasion passes immediately (the pipe sits at vblank start), the writes go through
    // a command buffer.
    rig.ctl.process_interrupts();
    let ops = rig.hw.ops();
    assert!(ops.iter().any(|op| matches!(op, SimOp::Upload { pipe: PipeId(0), .. })));
    assert!(rig.hw.write_count() > 0);
    let addr = SimBuffers::address(BoHandle(2));
    assert_eq!(rig.hw.reg(primary::surf(PipeId(0))), addr);
    assert_ne!(rig.hw.reg(primary::surflive(PipeId(0))), addr);
    assert!(rig.ctl.events().is_empty());

    next_vblank(&rig, 0);

    let event = rig.ctl.events().pop().expect("flip completion event");
    assert_eq!(event.object, ObjectId::Pipe(PipeId(0)));
    assert_eq!(event.user_data, 7);
    assert_eq!(event.old_fb, Some(a));
    assert_eq!(event.sequence.wrapping_sub(frame), 1);
    assert_eq!(rig.hw.reg(primary::surflive(PipeId(0))), addr);

    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 0);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 1);
    let stats = rig.ctl.stats();
    assert_eq!(stats.commits_nonblocking, 1);
    assert_eq!(stats.flips_queued, 1);
    assert_eq!(stats.flips_completed, 1);
    assert_eq!(stats.command_buffers_committed, 1);
    assert_eq!(stats.vblank_evasion_misses, 0);
}

#[test]
fn nonblocking_modeset_is_refused_without_side_effects() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    flip(&mut rig, 0, b, 1).unwrap();
    rig.hw.clear_ops();
    let refs = (rig.ctl.framebuffer_refcount(a), rig.ctl.framebuffer_refcount(b));
    let space = rig.ctl.events().available_space();

    let mut txn = rig.ctl.begin(2);
    txn.set_property(
        ObjectId::Pipe(PipeId(0)),
        Property::Mode,
        0,
        Some(&mode_blob(&ModeTiming::hd_60())),
    )
    .unwrap();
    let err = txn
        .commit(CommitFlags::NONBLOCK | CommitFlags::ALLOW_MODESET | CommitFlags::EVENT)
        .unwrap_err();
    txn.end();

    assert_eq!(err, KmsError::TryAgain);
    assert!(err.is_retryable());
    assert!(!err.is_validation());
    assert_eq!(rig.hw.ops(), Vec::new());
    assert_eq!(
        rig.ctl.pipe_state(PipeId(0)).unwrap().mode,
        Some(ModeTiming::fhd_60())
    );
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 1);
    assert_eq!(
        (rig.ctl.framebuffer_refcount(a), rig.ctl.framebuffer_refcount(b)),
        refs
    );
    assert_eq!(rig.ctl.events().available_space(), space);
    assert_eq!(rig.ctl.stats().try_again, 1);
}

#[test]
fn second_flip_while_one_is_pending_is_busy() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.ctl.process_interrupts();

    flip(&mut rig, 0, b, 1).unwrap();
    assert!(matches!(flip(&mut rig, 0, a, 2), Err(KmsError::Busy(_))));

    // Armed but not latched is still pending.
    rig.ctl.process_interrupts();
    assert!(rig.ctl.flips().has_pending(PipeId(0)));
    assert!(matches!(flip(&mut rig, 0, a, 3), Err(KmsError::Busy(_))));

    next_vblank(&rig, 0);
    assert!(!rig.ctl.flips().has_pending(PipeId(0)));
    flip(&mut rig, 0, a, 4).unwrap();
}

#[test]
fn flip_committed_after_latch_but_before_the_interrupt_is_accepted() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.ctl.process_interrupts();

    flip(&mut rig, 0, b, 1).unwrap();
    rig.ctl.process_interrupts();
    // The surface latched; its vblank interrupt is still in the channel.
    rig.hw.advance_to_vblank(PipeId(0));
    flip(&mut rig, 0, a, 2).unwrap();

    rig.ctl.process_interrupts();
    next_vblank(&rig, 0);

    let events = rig.ctl.events().drain();
    let user_data: Vec<u64> = events.iter().map(|e| e.user_data).collect();
    assert_eq!(user_data, vec![1, 2]);
    assert_eq!(events[1].sequence.wrapping_sub(events[0].sequence), 1);
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 1);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 0);
}

#[test]
fn surfaces_of_one_commit_latch_on_the_same_vblank() {
    let mut rig = rig(DisplayLayout::simple(1, 2));
    let a = fhd_fb(&mut rig, 1);
    let shown = add_fb(&mut rig, 64, 64, 10);
    let hidden = add_fb(&mut rig, 64, 64, 11);
    enable_pipe(&mut rig, 0, a);
    rig.ctl.process_interrupts();
    rig.hw.clear_ops();

    let mut txn = rig.ctl.begin(5);
    place_surface(&mut txn, 0, 0, shown, 100, 100, 64);
    // Entirely right of the active area.
    place_surface(&mut txn, 1, 0, hidden, 1920, 0, 64);
    let summary = txn.check(CommitFlags::NONBLOCK | CommitFlags::EVENT).unwrap();
    assert_eq!(summary.dirty_surfaces, vec![SurfaceId(0), SurfaceId(1)]);
    assert!(summary.dirty_pipes.is_empty());
    txn.commit(CommitFlags::NONBLOCK | CommitFlags::EVENT).unwrap();
    txn.end();

    assert!(rig.ctl.surface_state(SurfaceId(0)).unwrap().visible);
    assert!(!rig.ctl.surface_state(SurfaceId(1)).unwrap().visible);
    assert_eq!(rig.buffers.pin_count(BoHandle(10)), 1);
    assert_eq!(rig.buffers.pin_count(BoHandle(11)), 0);

    rig.ctl.process_interrupts();
    let uploads = rig
        .hw
        .ops()
        .into_iter()
        .filter(|op| matches!(op, SimOp::Upload { .. }))
        .count();
    assert_eq!(uploads, 1);

    next_vblank(&rig, 0);
    assert_eq!(
        rig.hw.reg(overlay::surflive(SurfaceId(0))),
        SimBuffers::address(BoHandle(10))
    );

    let events = rig.ctl.events().drain();
    assert_eq!(events.len(), 2);
    let objects: Vec<ObjectId> = events.iter().map(|e| e.object).collect();
    assert!(objects.contains(&ObjectId::Surface(SurfaceId(0))));
    assert!(objects.contains(&ObjectId::Surface(SurfaceId(1))));
    assert_eq!(events[0].sequence, events[1].sequence);
    assert!(events.iter().all(|e| e.user_data == 5));
}

#[test]
fn fenced_flip_waits_for_its_ring() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.ctl.process_interrupts();

    let fence = Fence {
        ring: RingId(0),
        seqno: 5,
    };
    rig.buffers.set_fence(BoHandle(2), fence);
    flip(&mut rig, 0, b, 1).unwrap();

    // Nothing is armed across vblanks while the fence is outstanding.
    rig.ctl.process_interrupts();
    next_vblank(&rig, 0);
    assert!(rig.ctl.events().is_empty());
    assert_eq!(rig.hw.writes_to(primary::surf(PipeId(0))).len(), 1);

    rig.buffers.signal(RingId(0), 5);
    assert!(rig.ctl.irq_sender().send(IrqEvent::RingSeqno {
        ring: RingId(0),
        seqno: 5
    }));
    rig.ctl.process_interrupts();
    assert_eq!(
        rig.hw.reg(primary::surf(PipeId(0))),
        SimBuffers::address(BoHandle(2))
    );

    next_vblank(&rig, 0);
    assert_eq!(rig.ctl.events().pop().map(|e| e.user_data), Some(1));
    assert_eq!(rig.ctl.stats().flips_abandoned, 0);
}

#[test]
fn device_reset_completes_queued_flips_in_order() {
    let mut rig = rig(DisplayLayout::simple(3, 0));
    let mut next = Vec::new();
    for pipe in 0..3u8 {
        let old = fhd_fb(&mut rig, u32::from(pipe) + 1);
        enable_pipe(&mut rig, pipe, old);
        next.push(fhd_fb(&mut rig, u32::from(pipe) + 10));
    }
    rig.ctl.process_interrupts();

    for pipe in 0..3u8 {
        let bo = BoHandle(u32::from(pipe) + 10);
        rig.buffers.set_fence(
            bo,
            Fence {
                ring: RingId(1),
                seqno: 100,
            },
        );
        flip(&mut rig, pipe, next[usize::from(pipe)], u64::from(pipe) + 1).unwrap();
    }
    assert!(rig.ctl.events().is_empty());

    assert_eq!(rig.ctl.device_reset(), 3);

    let events = rig.ctl.events().drain();
    let order: Vec<(ObjectId, u64)> = events.iter().map(|e| (e.object, e.user_data)).collect();
    assert_eq!(
        order,
        vec![
            (ObjectId::Pipe(PipeId(0)), 1),
            (ObjectId::Pipe(PipeId(1)), 2),
            (ObjectId::Pipe(PipeId(2)), 3),
        ]
    );
    let stats = rig.ctl.stats();
    assert_eq!(stats.flips_abandoned, 3);
    assert_eq!(stats.flips_completed, 3);
    for pipe in 0..3u32 {
        assert_eq!(rig.buffers.pin_count(BoHandle(pipe + 1)), 0);
        assert_eq!(rig.buffers.pin_count(BoHandle(pipe + 10)), 1);
        assert!(!rig.ctl.flips().has_pending(PipeId(pipe as u8)));
    }
}

#[test]
fn blocking_commit_flushes_pending_flips() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    let c = fhd_fb(&mut rig, 3);
    enable_pipe(&mut rig, 0, a);
    flip(&mut rig, 0, b, 1).unwrap();

    let mut txn = rig.ctl.begin(2);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::FbId, u64::from(c.0), None)
        .unwrap();
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();

    assert_eq!(rig.ctl.events().pop().map(|e| e.user_data), Some(1));
    assert!(!rig.ctl.flips().has_pending(PipeId(0)));
    assert_eq!(rig.buffers.pin_count(BoHandle(1)), 0);
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 0);
    assert_eq!(rig.buffers.pin_count(BoHandle(3)), 1);
    assert_eq!(
        rig.hw.reg(primary::surflive(PipeId(0))),
        SimBuffers::address(BoHandle(3))
    );
}
