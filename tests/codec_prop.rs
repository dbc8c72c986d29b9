//! Property tests for the binary wire formats.

use cairn::agg::{LandmarkWindow, SummaryWindow};
use cairn::storage::codec;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_summary_window_round_trip(
        time_start in -1_000_000i64..1_000_000,
        span in 0i64..1_000_000,
        count_start in 0i64..1_000_000,
        size in 1i64..1_000_000,
        count in proptest::num::f64::NORMAL,
        sum in proptest::num::f64::NORMAL,
        max in proptest::num::f64::NORMAL,
    ) {
        let mut window = SummaryWindow::new(
            time_start,
            time_start + span,
            count_start,
            count_start + size - 1,
        );
        window.data.count = count;
        window.data.sum = sum;
        window.data.max = max;

        let decoded = codec::decode_summary_window(&codec::encode_summary_window(&window)).unwrap();
        prop_assert_eq!(window, decoded);
    }

    #[test]
    fn prop_landmark_window_round_trip(
        time_start in -1_000i64..1_000,
        points in proptest::collection::vec((any::<i64>(), proptest::num::f64::NORMAL), 0..64),
    ) {
        let mut window = LandmarkWindow::new(time_start);
        for (timestamp, value) in &points {
            window.insert(*timestamp, *value);
        }
        window.close(time_start + 1_000_000);

        let decoded =
            codec::decode_landmark_window(&codec::encode_landmark_window(&window)).unwrap();
        prop_assert_eq!(window, decoded);
    }

    #[test]
    fn prop_catalog_round_trip(
        next_stream_id in 0i64..1_000_000,
        stream_ids in proptest::collection::vec(0i64..1_000_000, 0..32),
    ) {
        let catalog = codec::Catalog { next_stream_id, stream_ids };
        let decoded = codec::decode_catalog(&codec::encode_catalog(&catalog)).unwrap();
        prop_assert_eq!(catalog, decoded);
    }
}
