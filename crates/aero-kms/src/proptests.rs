use crate::dsb::{self, Dsb, DsbTiming, Instruction};
use crate::hw::{Fence, RegWrite};
use crate::object::{PipeId, RingId};
use crate::vblank::{hw_to_scanline, scanline_to_hw, FrameCounterStyle};
use proptest::prelude::*;

const MAX_WRITES: usize = 96;

fn timing() -> DsbTiming {
    DsbTiming {
        vtotal: 1125,
        vblank_start: 1080,
        scanline_offset: 1,
        vrr_active: false,
        dewake_scanline: None,
    }
}

fn write_strategy() -> impl Strategy<Value = RegWrite> {
    // A handful of registers so runs of same-register writes are common.
    let reg = prop_oneof![
        Just(0x70180u32),
        Just(0x70184u32),
        Just(0x7019cu32),
        Just(0x78000u32),
    ];
    (reg, any::<u32>()).prop_map(|(reg, value)| RegWrite::new(reg, value))
}

fn style_strategy() -> impl Strategy<Value = FrameCounterStyle> {
    prop_oneof![
        Just(FrameCounterStyle::Legacy24),
        Just(FrameCounterStyle::Wide32),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn command_buffer_writes_decode_in_program_order(
        writes in prop::collection::vec(write_strategy(), 0..MAX_WRITES),
    ) {
        let mut dsb = Dsb::prepare(PipeId(0), 0, writes.len() + 1, timing());
        for w in &writes {
            dsb.reg_write(w.reg, w.value);
        }
        prop_assert!(!dsb.is_overflowed());

        let decoded = dsb::decode(dsb.words()).unwrap();
        prop_assert_eq!(dsb::register_writes(&decoded), writes.clone());

        // Re-encoding the decoded stream reproduces it exactly.
        let mut again = Dsb::prepare(PipeId(0), 0, writes.len() + 1, timing());
        for w in dsb::register_writes(&decoded) {
            again.reg_write(w.reg, w.value);
        }
        prop_assert_eq!(again.words(), dsb.words());
    }

    #[test]
    fn interleaved_waits_split_indexed_runs(
        before in prop::collection::vec(any::<u32>(), 1..8),
        after in prop::collection::vec(any::<u32>(), 1..8),
    ) {
        let reg = 0x70180;
        let mut dsb = Dsb::prepare(PipeId(0), 0, 32, timing());
        for &v in &before {
            dsb.reg_write(reg, v);
        }
        dsb.wait_usec(10);
        for &v in &after {
            dsb.reg_write(reg, v);
        }

        let decoded = dsb::decode(dsb.words()).unwrap();
        let wait = decoded
            .iter()
            .position(|ins| *ins == Instruction::WaitUsec(10))
            .unwrap();
        prop_assert_eq!(dsb::register_writes(&decoded[..wait]).len(), before.len());
        prop_assert_eq!(dsb::register_writes(&decoded[wait..]).len(), after.len());
    }

    #[test]
    fn scanline_translation_round_trips(
        vtotal in 1u32..8192,
        offset in 0u32..4,
        frac in 0.0f64..1.0,
    ) {
        let scanline = ((f64::from(vtotal) * frac) as u32).min(vtotal - 1);
        let hw = scanline_to_hw(scanline as i32, vtotal, offset);
        prop_assert!(hw < vtotal);
        prop_assert_eq!(hw_to_scanline(hw, vtotal, offset), scanline);
    }

    #[test]
    fn frame_counter_comparison_survives_wrap(
        style in style_strategy(),
        target in any::<u32>(),
        ahead in 0u32..0x40_0000,
    ) {
        let target = target & style.mask();
        let current = target.wrapping_add(ahead) & style.mask();
        prop_assert!(style.passed(current, target));
        if ahead > 0 {
            prop_assert!(!style.passed(target, current));
        }
        prop_assert!(style.passed(style.next(target), target));
    }

    #[test]
    fn fence_comparison_survives_wrap(
        seqno in any::<u32>(),
        ahead in 0u32..0x4000_0000,
    ) {
        let fence = Fence { ring: RingId(0), seqno };
        prop_assert!(fence.passed(seqno.wrapping_add(ahead)));
        if ahead > 0 {
            prop_assert!(!fence.passed(seqno.wrapping_sub(ahead)));
        }
    }
}
