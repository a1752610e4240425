//! Property-based tests using proptest
//!
//! Invariants of the record codec, the timestamp fields and the scalar
//! surface that must hold for any input.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use mx_dataset::scalar::PendingScalars;
use mx_dataset::timestamp::{decode_timestamp, encode_timestamp, millis_from};
use mx_dataset::{DecodingPlan, OffsetPolicy, PlanItem, Slot, Value, Vector};

/// Strategy for one plan item together with a slot that fits it
fn item_and_slot() -> impl Strategy<Value = (PlanItem, Slot)> {
    prop_oneof![
        (1usize..24).prop_flat_map(|len| {
            proptest::collection::vec(b'A'..=b'Z', len).prop_map(move |bytes| {
                (PlanItem::Chars { len }, Slot::Scalar(Value::Chars(bytes)))
            })
        }),
        any::<i32>().prop_map(|v| (PlanItem::Int, Slot::Scalar(Value::Int(v)))),
        (-1.0e6f32..1.0e6).prop_map(|v| (PlanItem::Real, Slot::Scalar(Value::Real(v)))),
        proptest::collection::vec(-1.0e6f32..1.0e6, 1..16).prop_map(|values| {
            (
                PlanItem::RealVec { count: values.len() },
                Slot::Vector(Vector::Reals(values)),
            )
        }),
        proptest::collection::vec(any::<i32>(), 1..16).prop_map(|values| {
            (
                PlanItem::IntVec { count: values.len() },
                Slot::Vector(Vector::Ints(values)),
            )
        }),
        (1usize..32).prop_map(|len| (PlanItem::Skip { len }, Slot::Skipped)),
    ]
}

/// Strategy for timestamps with microsecond precision around 2018
fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..400 * 86_400, 0i64..1_000_000).prop_map(|(seconds, micros)| {
        Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap()
            + Duration::seconds(seconds)
            + Duration::microseconds(micros)
    })
}

fn policy_strategy() -> impl Strategy<Value = OffsetPolicy> {
    prop_oneof![Just(OffsetPolicy::Naive), Just(OffsetPolicy::PlusOneHour)]
}

proptest! {
    /// Decoding an encoded record gives back every slot
    #[test]
    fn codec_decode_inverts_encode(fields in proptest::collection::vec(item_and_slot(), 1..12)) {
        let packed = fields
            .iter()
            .map(|(item, _)| item.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let plan = DecodingPlan::from_packed(&packed).unwrap();
        let slots: Vec<Slot> = fields.into_iter().map(|(_, slot)| slot).collect();

        let record = plan.encode(&slots).unwrap();
        prop_assert_eq!(record.len(), plan.record_length());
        prop_assert_eq!(plan.decode(&record).unwrap(), slots);
        prop_assert_eq!(DecodingPlan::from_packed(&plan.to_packed()).unwrap(), plan);
    }

    /// A timestamp field reads back as the instant it was written from
    #[test]
    fn timestamp_field_round_trip(ts in timestamp_strategy(), policy in policy_strategy()) {
        let field = encode_timestamp(ts, policy, 40).unwrap();
        prop_assert_eq!(field.len(), 40);
        prop_assert_eq!(decode_timestamp(&field, policy).unwrap(), ts);
    }

    /// Snapshot keys are the whole milliseconds since the anchor
    #[test]
    fn millis_from_counts_whole_milliseconds(anchor in timestamp_strategy(), millis in 0i64..10_000_000_000) {
        let ts = anchor + Duration::milliseconds(millis);
        prop_assert_eq!(millis_from(anchor, ts), millis);
        prop_assert_eq!(millis_from(anchor, ts + Duration::microseconds(999)), millis);
    }

    /// A finished surface has a strictly increasing index with one row per timestamp
    #[test]
    fn finished_surface_index_is_strictly_increasing(seconds in proptest::collection::vec(0i64..50, 0..80)) {
        let base = Utc.with_ymd_and_hms(2018, 3, 3, 0, 0, 0).unwrap();
        let mut pending = PendingScalars::new(vec!["KNOT~~~1~PH".to_string()]);
        for (i, s) in seconds.iter().enumerate() {
            pending.push(base + Duration::seconds(*s), vec![Value::Int(i as i32)]);
        }
        let unique = pending.unique_len();
        let surface = pending.finish();

        prop_assert_eq!(surface.len(), unique);
        prop_assert!(surface.index().windows(2).all(|w| w[0] < w[1]));

        // first occurrence of a repeated timestamp wins
        for (timestamp, row) in surface.iter() {
            let first = seconds
                .iter()
                .position(|s| base + Duration::seconds(*s) == timestamp)
                .unwrap();
            prop_assert_eq!(&row[0], &Value::Int(first as i32));
        }
    }

    /// Appending a surface to itself changes nothing
    #[test]
    fn append_is_idempotent(seconds in proptest::collection::vec(0i64..50, 1..40)) {
        let base = Utc.with_ymd_and_hms(2018, 3, 3, 0, 0, 0).unwrap();
        let mut pending = PendingScalars::new(vec!["A".to_string(), "B".to_string()]);
        for s in &seconds {
            pending.push(base + Duration::seconds(*s), vec![Value::Int(*s as i32), Value::Real(0.5)]);
        }
        let mut surface = pending.finish();
        let before = surface.clone();

        surface.append(before.clone()).unwrap();
        prop_assert_eq!(surface, before);
    }
}
