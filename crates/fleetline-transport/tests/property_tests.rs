//! Property tests for BLE framing and chunk accounting

use fleetline_transport::ble::fragment;
use fleetline_transport::protocol::chunk_count;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_frames_fit_mtu_and_preserve_payload(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        mtu in 2usize..512,
    ) {
        let frames = fragment(&payload, mtu);
        prop_assert!(frames.iter().all(|f| !f.is_empty() && f.len() <= mtu));

        let finals = frames.iter().filter(|f| f.first().is_some_and(|h| h & 0x80 != 0)).count();
        prop_assert_eq!(finals, 1);

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.iter().skip(1).copied()).collect();
        prop_assert_eq!(joined, payload);
    }

    #[test]
    fn test_chunk_count_covers_payload(total in 0usize..1_000_000, chunk in 1usize..65_536) {
        let count = chunk_count(total, chunk) as usize;
        prop_assert!(count * chunk >= total);
        if count > 0 {
            prop_assert!((count - 1) * chunk < total);
        }
    }
}
