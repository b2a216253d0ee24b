mod common;

use aero_kms::hw::ScalerMode;
use aero_kms::regs::cursor;
use aero_kms::sim::{SimBuffers, SimConfig, SimOp};
use aero_kms::{
    BoHandle, CommitFlags, DisplayConfig, DisplayLayout, Framebuffer, KmsError, ModeTiming,
    ObjectId, PipeId, PixelFormat, Property, RefreshRange, SinkDesc, SurfaceId, VrrTiming,
};
use common::*;
use pretty_assertions::assert_eq;

fn single_sink_layout(refresh_range: Option<RefreshRange>) -> DisplayLayout {
    DisplayLayout {
        pipes: 1,
        surfaces: Vec::new(),
        sinks: vec![SinkDesc {
            encoder: 0,
            possible_pipes: 0b1,
            refresh_range,
        }],
    }
}

#[test]
fn aggregate_bandwidth_is_checked_across_pipes() {
    let mut rig = rig_with(
        DisplayLayout::simple(2, 0),
        SimConfig {
            max_data_rate: 1000,
            ..SimConfig::default()
        },
        DisplayConfig::default(),
    );
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);
    rig.hw.clear_ops();

    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(1));
    txn.set_property(pipe, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&sink_blob(&[1])))
        .unwrap();
    txn.set_property(pipe, Property::FbId, u64::from(b.0), None)
        .unwrap();
    let err = txn.commit(CommitFlags::ALLOW_MODESET).unwrap_err();
    txn.end();

    // Two unscaled 1080p60 XRGB8888 primaries at 594 MB/s each.
    assert_eq!(
        err,
        KmsError::Bandwidth {
            required: 1188,
            available: 1000,
            active_planes: 2,
        }
    );
    assert!(err.is_validation());
    assert_eq!(rig.hw.ops(), Vec::new());
    assert_eq!(rig.buffers.pin_count(BoHandle(2)), 0);
    assert_eq!(rig.ctl.pipe_state(PipeId(1)).unwrap().mode, None);
    assert_eq!(rig.ctl.stats().check_failures, 1);
}

#[test]
fn single_scaled_surface_gets_the_high_quality_scaler() {
    let mut rig = rig(DisplayLayout::simple(1, 2));
    let a = fhd_fb(&mut rig, 1);
    let small = add_fb(&mut rig, 64, 64, 10);
    enable_pipe(&mut rig, 0, a);

    let mut txn = rig.ctl.begin(0);
    place_surface(&mut txn, 0, 0, small, 0, 0, 64);
    txn.set_property(ObjectId::Surface(SurfaceId(0)), Property::DstW, 128, None)
        .unwrap();
    txn.set_property(ObjectId::Surface(SurfaceId(0)), Property::DstH, 128, None)
        .unwrap();
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();

    let surface = rig.ctl.surface_state(SurfaceId(0)).unwrap();
    assert_eq!(surface.scaler, Some(ScalerMode::HighQuality));
    assert!(rig.ctl.pipe_state(PipeId(0)).unwrap().scaler_hq);
    assert_eq!(rig.buffers.pin_count(BoHandle(10)), 1);
}

#[test]
fn scaler_shortage_is_rejected() {
    let mut rig = rig_with(
        DisplayLayout::simple(1, 2),
        SimConfig {
            num_scalers: 1,
            ..SimConfig::default()
        },
        DisplayConfig::default(),
    );
    let a = fhd_fb(&mut rig, 1);
    let small = add_fb(&mut rig, 64, 64, 10);
    enable_pipe(&mut rig, 0, a);

    let mut txn = rig.ctl.begin(0);
    for (surface, x) in [(0u8, 0), (1u8, 500)] {
        place_surface(&mut txn, surface, 0, small, x, 0, 64);
        let object = ObjectId::Surface(SurfaceId(surface));
        txn.set_property(object, Property::DstW, 96, None).unwrap();
        txn.set_property(object, Property::DstH, 96, None).unwrap();
    }
    assert_eq!(
        txn.check(CommitFlags::empty()),
        Err(KmsError::Invalid("not enough scalers"))
    );
}

#[test]
fn scale_factors_are_bounded() {
    let mut rig = rig(DisplayLayout::simple(1, 1));
    let a = fhd_fb(&mut rig, 1);
    let small = add_fb(&mut rig, 64, 64, 10);
    enable_pipe(&mut rig, 0, a);

    let mut txn = rig.ctl.begin(0);
    place_surface(&mut txn, 0, 0, small, 0, 0, 64);
    txn.set_property(ObjectId::Surface(SurfaceId(0)), Property::DstW, 16, None)
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::empty()),
        Err(KmsError::Range("downscale factor"))
    );
}

#[test]
fn source_rectangle_must_fit_the_framebuffer() {
    let mut rig = rig(DisplayLayout::simple(1, 1));
    let a = fhd_fb(&mut rig, 1);
    let small = add_fb(&mut rig, 64, 64, 10);
    enable_pipe(&mut rig, 0, a);

    let mut txn = rig.ctl.begin(0);
    place_surface(&mut txn, 0, 0, small, 0, 0, 64);
    txn.set_property(ObjectId::Surface(SurfaceId(0)), Property::SrcX, 1 << 16, None)
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::empty()),
        Err(KmsError::NoSpace("source rectangle exceeds the framebuffer"))
    );
}

#[test]
fn fullscreen_overlay_hides_the_primary_plane() {
    let mut rig = rig(DisplayLayout::simple(1, 1));
    let a = fhd_fb(&mut rig, 1);
    let b = fhd_fb(&mut rig, 2);
    enable_pipe(&mut rig, 0, a);

    let mut txn = rig.ctl.begin(0);
    let surface = ObjectId::Surface(SurfaceId(0));
    place_surface(&mut txn, 0, 0, b, 0, 0, 0);
    for (property, value) in [
        (Property::SrcW, 1920u64 << 16),
        (Property::SrcH, 1080 << 16),
        (Property::DstW, 1920),
        (Property::DstH, 1080),
    ] {
        txn.set_property(surface, property, value, None).unwrap();
    }
    let summary = txn.check(CommitFlags::empty()).unwrap();
    assert_eq!(summary.dirty_pipes, vec![PipeId(0)]);
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();

    let pipe = rig.ctl.pipe_state(PipeId(0)).unwrap();
    assert!(pipe.primary_disabled);
    // Overlay only; the hidden primary no longer counts.
    assert_eq!(pipe.active_planes, 0b10);
    assert_eq!(rig.hw.reg(aero_kms::regs::primary::ctl(PipeId(0))), 0);
}

#[test]
fn sink_claimed_by_two_pipes_is_rejected() {
    let layout = DisplayLayout {
        pipes: 2,
        surfaces: Vec::new(),
        sinks: vec![
            SinkDesc {
                encoder: 0,
                possible_pipes: 0b11,
                refresh_range: None,
            },
            SinkDesc {
                encoder: 1,
                possible_pipes: 0b11,
                refresh_range: None,
            },
        ],
    };
    let mut rig = rig(layout);
    let mut txn = rig.ctl.begin(0);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    txn.set_property(ObjectId::Pipe(PipeId(1)), Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Invalid("sink claimed by two pipes"))
    );
}

#[test]
fn shared_encoder_cannot_drive_two_pipes() {
    let layout = DisplayLayout {
        pipes: 2,
        surfaces: Vec::new(),
        sinks: vec![
            SinkDesc {
                encoder: 0,
                possible_pipes: 0b11,
                refresh_range: None,
            },
            SinkDesc {
                encoder: 0,
                possible_pipes: 0b11,
                refresh_range: None,
            },
        ],
    };
    let mut rig = rig(layout);
    let mut txn = rig.ctl.begin(0);
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    txn.set_property(ObjectId::Pipe(PipeId(1)), Property::ConnectorIds, 0, Some(&sink_blob(&[1])))
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Invalid("encoder claimed by two pipes"))
    );

    // Both sinks on one pipe share the encoder legitimately.
    txn.set_property(ObjectId::Pipe(PipeId(1)), Property::ConnectorIds, 0, Some(&[][..]))
        .unwrap();
    txn.set_property(ObjectId::Pipe(PipeId(0)), Property::ConnectorIds, 0, Some(&sink_blob(&[0, 1])))
        .unwrap();
    assert!(txn.check(CommitFlags::ALLOW_MODESET).is_ok());
}

#[test]
fn modeset_needs_the_allow_flag() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let fb = fhd_fb(&mut rig, 1);
    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    txn.set_property(pipe, Property::FbId, u64::from(fb.0), None)
        .unwrap();

    assert_eq!(
        txn.check(CommitFlags::empty()),
        Err(KmsError::Invalid("modeset not allowed"))
    );
    assert_eq!(txn.check(CommitFlags::NONBLOCK), Err(KmsError::TryAgain));
    let summary = txn.check(CommitFlags::ALLOW_MODESET).unwrap();
    assert!(summary.modeset);
    assert_eq!(summary.dirty_pipes, vec![PipeId(0)]);
}

#[test]
fn enabled_pipe_needs_a_large_enough_framebuffer_and_a_sink() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let small = add_fb(&mut rig, 1280, 720, 1);
    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Invalid("enabled pipe needs a framebuffer"))
    );

    txn.set_property(pipe, Property::FbId, u64::from(small.0), None)
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Invalid("enabled pipe needs a sink"))
    );

    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    assert_eq!(
        txn.check(CommitFlags::ALLOW_MODESET),
        Err(KmsError::NoSpace("framebuffer too small for mode and pan offset"))
    );
}

#[test]
fn unsupported_pixel_format_is_rejected_at_check_time() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let nv12 = Framebuffer {
        format: u32::from_le_bytes(*b"NV12"),
        ..Framebuffer::new(1920, 1080, PixelFormat::Xrgb8888, BoHandle(1))
    };
    let fb = rig.ctl.add_framebuffer(nv12).unwrap();

    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    txn.set_property(pipe, Property::FbId, u64::from(fb.0), None)
        .unwrap();
    assert_eq!(
        txn.commit(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Invalid("unsupported pixel format"))
    );
}

#[test]
fn cursor_is_pinned_and_positioned_in_sign_magnitude() {
    let mut rig = rig(DisplayLayout::simple(1, 0));
    let fb = fhd_fb(&mut rig, 1);
    enable_pipe(&mut rig, 0, fb);

    let pipe = ObjectId::Pipe(PipeId(0));
    let mut txn = rig.ctl.begin(0);
    txn.set_property(pipe, Property::CursorHandle, 5, None).unwrap();
    assert_eq!(
        txn.check(CommitFlags::empty()),
        Err(KmsError::Invalid("cursor must be 64x64"))
    );
    txn.set_property(pipe, Property::CursorW, 64, None).unwrap();
    txn.set_property(pipe, Property::CursorH, 64, None).unwrap();
    txn.set_property(pipe, Property::CursorX, (-10i64) as u64, None)
        .unwrap();
    txn.set_property(pipe, Property::CursorY, 20, None).unwrap();
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();

    assert_eq!(rig.buffers.cursor_pin_count(BoHandle(5)), 1);
    assert_eq!(rig.hw.reg(cursor::ctl(PipeId(0))), cursor::CTL_MODE_64);
    assert_eq!(rig.hw.reg(cursor::pos(PipeId(0))), (20 << 16) | 0x8000 | 10);
    assert_eq!(
        rig.hw.reg(cursor::base(PipeId(0))),
        SimBuffers::address(BoHandle(5))
    );

    // Hiding the cursor releases its pin.
    let mut txn = rig.ctl.begin(0);
    txn.set_property(pipe, Property::CursorHandle, 0, None).unwrap();
    txn.commit(CommitFlags::empty()).unwrap();
    txn.end();
    assert_eq!(rig.buffers.cursor_pin_count(BoHandle(5)), 0);
    assert_eq!(rig.hw.reg(cursor::ctl(PipeId(0))), 0);
}

#[test]
fn variable_refresh_uses_the_sink_refresh_range() {
    let mut rig = rig(single_sink_layout(Some(RefreshRange {
        min_hz: 48,
        max_hz: 144,
    })));
    let fb = fhd_fb(&mut rig, 1);

    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    txn.set_property(pipe, Property::FbId, u64::from(fb.0), None)
        .unwrap();
    txn.set_property(pipe, Property::VrrEnabled, 1, None).unwrap();
    txn.commit(CommitFlags::ALLOW_MODESET).unwrap();
    txn.end();

    // 148.5 MHz over 2200 pixels per line: 48 Hz needs 1407 lines, 144 Hz is below the mode.
    let vrr = VrrTiming {
        vmin: 1125,
        vmax: 1407,
    };
    assert_eq!(rig.ctl.pipe_state(PipeId(0)).unwrap().vrr, Some(vrr));
    assert!(rig.hw.ops().iter().any(|op| matches!(
        op,
        SimOp::ModeSet { vrr: Some(v), .. } if *v == vrr
    )));
}

#[test]
fn variable_refresh_without_a_range_is_rejected() {
    let mut rig = rig(single_sink_layout(None));
    let fb = fhd_fb(&mut rig, 1);

    let mut txn = rig.ctl.begin(0);
    let pipe = ObjectId::Pipe(PipeId(0));
    txn.set_property(pipe, Property::Mode, 0, Some(&mode_blob(&ModeTiming::fhd_60())))
        .unwrap();
    txn.set_property(pipe, Property::ConnectorIds, 0, Some(&sink_blob(&[0])))
        .unwrap();
    txn.set_property(pipe, Property::FbId, u64::from(fb.0), None)
        .unwrap();
    txn.set_property(pipe, Property::VrrEnabled, 1, None).unwrap();
    assert_eq!(
        txn.check(CommitFlags::ALLOW_MODESET),
        Err(KmsError::Invalid("sink has no usable refresh range"))
    );
}
