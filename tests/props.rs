//! Property tests for the codec layers: masking schedules, incremental
//! UTF-8, header round-trips, and deflate round-trips over arbitrary
//! partitions.

use bytes::BytesMut;
use proptest::prelude::*;

use riptide_ws::frame::{self, FrameHeader, OpCode};
use riptide_ws::mask::{apply_mask, KeySchedule};
use riptide_ws::utf8::{validate, Utf8Validator};
use riptide_ws::Role;

/// Turn sampled indices into a sorted list of segment boundaries over `len`
/// bytes, always starting at 0 and ending at `len`.
fn cut_points(len: usize, cuts: &[prop::sample::Index]) -> Vec<usize> {
    let mut offsets: Vec<usize> = cuts.iter().map(|c| c.index(len + 1)).collect();
    offsets.push(0);
    offsets.push(len);
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

proptest! {
    #[test]
    fn mask_schedule_matches_single_pass(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        key in any::<[u8; 4]>(),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut whole = data.clone();
        apply_mask(&mut whole, key);

        let offsets = cut_points(data.len(), &cuts);
        let mut pieces = data.clone();
        let mut schedule = KeySchedule::new(key);
        for pair in offsets.windows(2) {
            schedule.apply(&mut pieces[pair[0]..pair[1]]);
        }
        prop_assert_eq!(&pieces, &whole);

        // Applying the same partition again restores the original bytes.
        let mut schedule = KeySchedule::new(key);
        for pair in offsets.windows(2) {
            schedule.apply(&mut pieces[pair[0]..pair[1]]);
        }
        prop_assert_eq!(&pieces, &data);
    }

    #[test]
    fn utf8_incremental_agrees_with_whole_buffer(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let whole = validate(&data);

        let offsets = cut_points(data.len(), &cuts);
        let mut validator = Utf8Validator::new();
        let mut ok = true;
        for pair in offsets.windows(2) {
            if !validator.write(&data[pair[0]..pair[1]]) {
                ok = false;
                break;
            }
        }
        let ok = ok && validator.finish();
        prop_assert_eq!(ok, whole);
    }

    #[test]
    fn utf8_valid_strings_pass_any_partition(
        text in ".*",
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let data = text.as_bytes();
        let offsets = cut_points(data.len(), &cuts);
        let mut validator = Utf8Validator::new();
        for pair in offsets.windows(2) {
            prop_assert!(validator.write(&data[pair[0]..pair[1]]));
        }
        prop_assert!(validator.finish());
    }

    #[test]
    fn header_encode_decode_roundtrips(
        payload_len in prop::sample::select(
            vec![0u64, 1, 125, 126, 127, 65_535, 65_536, 1 << 20, 1 << 32]
        ),
        masked in any::<bool>(),
        fin in any::<bool>(),
        key in any::<[u8; 4]>(),
        binary in any::<bool>(),
    ) {
        let header = FrameHeader {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: if binary { OpCode::Binary } else { OpCode::Text },
            masked,
            payload_len,
            mask: masked.then_some(key),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        prop_assert_eq!(buf.len(), header.header_size());

        let role = if masked { Role::Server } else { Role::Client };
        let (decoded, consumed) = frame::decode_header(&buf, role, false, false)
            .unwrap()
            .unwrap();
        prop_assert_eq!(consumed, buf.len());
        prop_assert_eq!(decoded.fin, header.fin);
        prop_assert_eq!(decoded.opcode, header.opcode);
        prop_assert_eq!(decoded.masked, header.masked);
        prop_assert_eq!(decoded.payload_len, header.payload_len);
        prop_assert_eq!(decoded.mask, header.mask);
    }
}

#[cfg(feature = "permessage-deflate")]
mod deflate_props {
    use super::*;
    use riptide_ws::{Deflater, Inflater};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn deflate_roundtrips_over_any_frame_partition(
            messages in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..1024),
                1..4,
            ),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
            reset_per_message in any::<bool>(),
        ) {
            let mut deflater = Deflater::new(15, reset_per_message);
            let mut inflater = Inflater::new(15, reset_per_message);

            for msg in &messages {
                let mut wire = BytesMut::new();
                deflater.write(msg, &mut wire).unwrap();
                deflater.finish_message(&mut wire).unwrap();

                let offsets = cut_points(wire.len(), &cuts);
                let mut plain = BytesMut::new();
                for pair in offsets.windows(2) {
                    inflater.write(&wire[pair[0]..pair[1]], &mut plain, 0).unwrap();
                }
                inflater.finish_message(&mut plain, 0).unwrap();
                prop_assert_eq!(&plain[..], &msg[..]);
            }
        }
    }
}
