//! Property tests for message list merging.
//!
//! Verifies:
//! 1. Merging never yields two records sharing an id or temp id.
//! 2. Merging is idempotent.
//! 3. Merging never invents a server id or grows the list.
//! 4. Confirmed twins sharing a caption inside the fingerprint window all
//!    survive, and each placeholder is absorbed by at most one of them.

use std::collections::HashSet;

use glimpse::merge::{MATCH_WINDOW_MS, merge_messages};
use glimpse_proto::message::{Message, MessageFlags, MessageId, Timestamp, UserId};
use proptest::prelude::*;

/// Strategy for one record drawn from small pools so collisions are common.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        prop::option::of(0u8..6),
        prop::option::of(0u8..4),
        any::<bool>(),
        0u64..6_000,
        prop::sample::select(vec!["hi", "hello", "  hi  ", "ok"]),
        any::<bool>(),
    )
        .prop_map(|(id, temp, outbound, ts, caption, sending)| {
            let (alice, bob) = (UserId::new("alice"), UserId::new("bob"));
            let (sender, receiver) = if outbound { (alice, bob) } else { (bob, alice) };
            Message {
                id: id.map(|n| MessageId::new(format!("srv-{n}"))),
                temp_id: temp.map(|n| MessageId::new(format!("tmp-{n}"))),
                sender_id: sender,
                receiver_id: receiver,
                created_at: Timestamp::from_millis(ts),
                media: None,
                caption: Some(caption.to_string()),
                flags: MessageFlags {
                    sending: sending && id.is_none(),
                    ..MessageFlags::default()
                },
            }
        })
}

/// Confirmed records and placeholders of one caption, all within
/// [`MATCH_WINDOW_MS`] of each other, in random order.
fn arb_twins() -> impl Strategy<Value = (Vec<Message>, usize, usize)> {
    (
        prop::collection::vec(0..MATCH_WINDOW_MS, 1..5),
        prop::collection::vec(0..MATCH_WINDOW_MS, 1..4),
    )
        .prop_flat_map(|(confirmed, pending)| {
            let (alice, bob) = (UserId::new("alice"), UserId::new("bob"));
            let at = |offset: u64| Timestamp::from_millis(10_000 + offset);
            let mut records: Vec<Message> = confirmed
                .iter()
                .enumerate()
                .map(|(n, &t)| {
                    Message::authoritative(format!("srv-{n}"), &alice, &bob, at(t))
                        .with_caption("ok")
                })
                .collect();
            records.extend(pending.iter().enumerate().map(|(n, &t)| {
                Message::optimistic(MessageId::new(format!("tmp-{n}")), &alice, &bob, at(t))
                    .with_caption(" ok ")
            }));
            let counts = (confirmed.len(), pending.len());
            Just(records)
                .prop_shuffle()
                .prop_map(move |records| (records, counts.0, counts.1))
        })
}

fn identities(list: &[Message]) -> Vec<&MessageId> {
    list.iter()
        .flat_map(|m| [&m.id, &m.temp_id])
        .flatten()
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// No identity appears on two merged records.
    #[test]
    fn no_duplicate_identities(input in prop::collection::vec(arb_message(), 0..24)) {
        let merged = merge_messages(&input);
        let ids = identities(&merged);
        let unique: HashSet<&MessageId> = ids.iter().copied().collect();
        prop_assert_eq!(ids.len(), unique.len());
    }

    /// A merged list is a fixed point.
    #[test]
    fn merge_is_idempotent(input in prop::collection::vec(arb_message(), 0..24)) {
        let once = merge_messages(&input);
        let twice = merge_messages(&once);
        prop_assert_eq!(once, twice);
    }

    /// Twins within the window never swallow each other.
    #[test]
    fn every_confirmed_twin_survives((input, confirmed, pending) in arb_twins()) {
        let merged = merge_messages(&input);
        let before: HashSet<&MessageId> = input.iter().filter_map(|m| m.id.as_ref()).collect();
        let after: HashSet<&MessageId> = merged.iter().filter_map(|m| m.id.as_ref()).collect();
        prop_assert_eq!(before, after);

        let still_pending = merged.iter().filter(|m| m.is_optimistic()).count();
        prop_assert_eq!(still_pending, pending.saturating_sub(confirmed));
        prop_assert_eq!(merged.len(), confirmed.max(pending));
        prop_assert_eq!(merge_messages(&merged), merged);
    }

    /// Server ids come from the input and groups only shrink the list.
    #[test]
    fn server_ids_are_never_invented(input in prop::collection::vec(arb_message(), 0..24)) {
        let merged = merge_messages(&input);
        let before: HashSet<&MessageId> = input.iter().filter_map(|m| m.id.as_ref()).collect();
        let after: HashSet<&MessageId> = merged.iter().filter_map(|m| m.id.as_ref()).collect();
        prop_assert!(after.is_subset(&before));
        prop_assert!(merged.len() <= input.len());
    }
}
