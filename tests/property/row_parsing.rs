//! Property tests for realtime row decoding and snapshot decoding.
//!
//! Verifies:
//! 1. Arbitrary JSON never panics when decoded as a row or converted to a message.
//! 2. Any row that converts successfully yields a well-formed message.
//! 3. Random bytes never panic when decoded as a snapshot.

use glimpse_proto::codec;
use glimpse_proto::event::RealtimeEvent;
use glimpse_proto::message::Message;
use glimpse_proto::row::MessageRow;
use proptest::prelude::*;
use serde_json::{Map, Value, json};

/// Strategy for arbitrary JSON leaves.
fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        any::<u64>().prop_map(|n| json!(n)),
        ".{0,24}".prop_map(Value::String),
    ]
}

/// Strategy for arbitrary (nested) JSON values.
fn arb_json() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::hash_map(".{0,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Strategy for row-shaped objects: known column names with random values.
fn arb_row_object() -> impl Strategy<Value = Value> {
    let columns = prop::sample::select(vec![
        "id",
        "client_temp_id",
        "sender_id",
        "receiver_id",
        "created_at",
        "media_url",
        "thumbnail_url",
        "media_type",
        "caption",
        "view_once",
        "is_nsfw",
        "is_seen",
        "seen",
    ]);
    prop::collection::vec((columns, arb_leaf()), 0..13).prop_map(|pairs| {
        let mut map = Map::new();
        for (key, value) in pairs {
            map.insert(key.to_string(), value);
        }
        Value::Object(map)
    })
}

proptest! {
    /// Arbitrary JSON never panics the row decoder.
    #[test]
    fn arbitrary_json_decode_no_panic(value in arb_json()) {
        if let Ok(Some(row)) = MessageRow::from_value(&value) {
            let _ = Message::try_from(row);
        }
    }

    /// Successful conversions always produce displayable messages.
    #[test]
    fn converted_rows_are_well_formed(value in arb_row_object()) {
        if let Ok(Some(row)) = MessageRow::from_value(&value)
            && let Ok(msg) = Message::try_from(row)
        {
            prop_assert!(msg.is_well_formed());
        }
    }

    /// Arbitrary payloads in a notification never panic either accessor.
    #[test]
    fn realtime_event_accessors_no_panic(new in arb_json(), old in arb_json()) {
        let event = RealtimeEvent {
            event_type: glimpse_proto::event::ChangeKind::Update,
            new: Some(new),
            old: Some(old),
        };
        let _ = event.new_row();
        let _ = event.old_row();
    }

    /// Random bytes never cause a panic when decoded as a snapshot.
    #[test]
    fn random_bytes_snapshot_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _: Result<Vec<Message>, _> = codec::decode_snapshot(1, &bytes);
    }
}
