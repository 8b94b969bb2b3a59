//! Pure deduplication and ordering of message lists.
//!
//! The same logical message can reach a conversation several times: as an
//! optimistic placeholder, as the authoritative row returned by
//! `create_message`, as a realtime insert, and as part of a page fetch.
//! [`merge_messages`] collapses every such group into one canonical record
//! and orders the result.
//!
//! Matching rules (any one suffices):
//! 1. Same server id.
//! 2. One record's id or temp id equals the other's id or temp id.
//! 3. Fingerprint match: exactly one side is optimistic, the authoritative
//!    side carries no conflicting temp id, sender and receiver coincide,
//!    `created_at` is within [`MATCH_WINDOW_MS`], and the content
//!    fingerprints are equal.
//!
//! Identity matches are transitive: groups are the connected components of
//! rules 1 and 2. A fingerprint match then pairs an optimistic group with at
//! most one authoritative group, the nearest in `created_at` that no other
//! placeholder claimed, and never joins two different server ids.
//!
//! The function is total: malformed records are dropped, nothing panics,
//! and `merge_messages(&merge_messages(x)) == merge_messages(x)`.

use std::cmp::{Ordering, Reverse};
use std::collections::{HashMap, HashSet};

use glimpse_proto::message::{Message, MessageId};

/// Maximum `created_at` distance for a fingerprint match.
pub const MATCH_WINDOW_MS: u64 = 2_000;

/// Adjacent optimistic/authoritative records closer than this are ordered
/// authoritative first.
pub const ORDER_EPSILON_MS: u64 = 500;

/// Whether `a` and `b` represent the same logical message.
#[must_use]
pub fn messages_match(a: &Message, b: &Message) -> bool {
    shares_identity(a, b) || fingerprint_match(a, b)
}

fn shares_identity(a: &Message, b: &Message) -> bool {
    [&a.id, &a.temp_id]
        .into_iter()
        .flatten()
        .filter(|id| !id.is_empty())
        .any(|id| b.has_identity(id))
}

fn fingerprint_match(a: &Message, b: &Message) -> bool {
    let (optimistic, authoritative) = match (a.is_optimistic(), b.is_optimistic()) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => return false,
    };
    // An echoed temp id is definitive lineage; a different one is a
    // different send.
    if authoritative
        .temp_id
        .as_ref()
        .is_some_and(|t| optimistic.temp_id.as_ref() != Some(t))
    {
        return false;
    }
    optimistic.sender_id == authoritative.sender_id
        && optimistic.receiver_id == authoritative.receiver_id
        && optimistic.created_at.abs_diff(authoritative.created_at) <= MATCH_WINDOW_MS
        && optimistic.content_fingerprint() == authoritative.content_fingerprint()
}

/// Disjoint-set forest over record indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index becomes the root so groups keep first-seen order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Collapse duplicates and order ascending by creation time.
///
/// When several records of a group are equally authoritative, the one that
/// appears *last* in `input` wins, so callers append fresh data after
/// cached data.
#[must_use]
pub fn merge_messages(input: &[Message]) -> Vec<Message> {
    let records: Vec<&Message> = input
        .iter()
        .filter(|m| {
            let ok = m.is_well_formed();
            if !ok {
                tracing::debug!(id = ?m.identity(), "dropping malformed message");
            }
            ok
        })
        .collect();

    let mut groups = UnionFind::new(records.len());

    let mut by_identity: HashMap<&MessageId, usize> = HashMap::new();
    for (i, msg) in records.iter().enumerate() {
        for id in [&msg.id, &msg.temp_id].into_iter().flatten() {
            if id.is_empty() {
                continue;
            }
            match by_identity.get(id) {
                Some(&j) => groups.union(i, j),
                None => {
                    by_identity.insert(id, i);
                }
            }
        }
    }

    pair_by_fingerprint(&records, &mut groups);

    let mut members: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
    for i in 0..records.len() {
        let root = groups.find(i);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            members.push(Vec::new());
            members.len() - 1
        });
        members[slot].push(i);
    }

    let mut merged: Vec<Message> = members
        .iter()
        .filter_map(|group| {
            let group: Vec<&Message> = group.iter().map(|&i| records[i]).collect();
            collapse(&group)
        })
        .collect();

    merged.sort_by(order_key);
    favor_authoritative(&mut merged);
    merged
}

/// Join each optimistic group to the nearest unclaimed authoritative group
/// it fingerprint-matches.
fn pair_by_fingerprint(records: &[&Message], groups: &mut UnionFind) {
    let mut server_of: HashMap<usize, &MessageId> = HashMap::new();
    // Groups that already carry a temp id belong to some send.
    let mut claimed: HashSet<usize> = HashSet::new();
    for (i, msg) in records.iter().enumerate() {
        let root = groups.find(i);
        if let Some(id) = msg.id.as_ref().filter(|id| !id.is_empty()) {
            server_of.entry(root).or_insert(id);
        }
        if msg.temp_id.is_some() {
            claimed.insert(root);
        }
    }

    let (optimistic, authoritative): (Vec<usize>, Vec<usize>) =
        (0..records.len()).partition(|&i| records[i].is_optimistic());
    for &o in &optimistic {
        let own = groups.find(o);
        if server_of.contains_key(&own) {
            continue;
        }
        let nearest = authoritative
            .iter()
            .copied()
            .filter(|&a| {
                let root = groups.find(a);
                root != own && !claimed.contains(&root) && fingerprint_match(records[o], records[a])
            })
            .min_by_key(|&a| {
                (
                    records[o].created_at.abs_diff(records[a].created_at),
                    Reverse(a),
                )
            });
        let Some(a) = nearest else {
            continue;
        };
        let server_id = server_of.get(&groups.find(a)).copied();
        groups.union(o, a);
        let root = groups.find(o);
        claimed.insert(root);
        if let Some(id) = server_id {
            server_of.insert(root, id);
        }
    }
}

/// Merge `incoming` into `existing` in place.
pub fn merge_into(existing: &mut Vec<Message>, incoming: impl IntoIterator<Item = Message>) {
    existing.extend(incoming);
    *existing = merge_messages(existing);
}

/// Remove every record identified by `id` (server id or temp id).
///
/// Returns `true` if anything was removed.
pub fn remove_identity(list: &mut Vec<Message>, id: &MessageId) -> bool {
    let before = list.len();
    list.retain(|m| !m.has_identity(id));
    list.len() != before
}

/// Collapse one group into its canonical record.
///
/// Returns `None` only for an empty group.
fn collapse(group: &[&Message]) -> Option<Message> {
    let mut winner = *group.first()?;
    for &candidate in &group[1..] {
        if rank(candidate) <= rank(winner) {
            winner = candidate;
        }
    }

    let mut out = winner.clone();
    for other in group {
        if out.temp_id.is_none()
            && let Some(temp) = &other.temp_id
            && out.id.as_ref() != Some(temp)
        {
            out.temp_id = Some(temp.clone());
        }
        out.flags.seen |= other.flags.seen;
        out.flags.view_once |= other.flags.view_once;
        out.flags.is_nsfw |= other.flags.is_nsfw;
        if out.media.is_none() {
            out.media.clone_from(&other.media);
        }
        if out.caption.is_none() {
            out.caption.clone_from(&other.caption);
        }
    }
    if !out.is_optimistic() {
        out.flags.sending = false;
        out.flags.failed = false;
    }
    Some(out)
}

/// Lower is better: authoritative before optimistic, identified before not.
fn rank(m: &Message) -> (bool, bool) {
    (m.is_optimistic(), m.id.is_none())
}

/// Total order used before the epsilon pass.
fn order_key(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.is_optimistic().cmp(&b.is_optimistic()))
        .then_with(|| a.identity().cmp(&b.identity()))
        .then_with(|| a.temp_id.cmp(&b.temp_id))
}

/// Move an authoritative record ahead of an optimistic neighbour that is
/// within [`ORDER_EPSILON_MS`] before it.
fn favor_authoritative(sorted: &mut [Message]) {
    let mut i = 0;
    while i + 1 < sorted.len() {
        let (left, right) = (&sorted[i], &sorted[i + 1]);
        if left.is_optimistic()
            && !right.is_optimistic()
            && left.created_at.abs_diff(right.created_at) <= ORDER_EPSILON_MS
        {
            sorted.swap(i, i + 1);
            i += 2;
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use glimpse_proto::message::{MediaKind, MediaRef, Timestamp, UserId};

    use super::*;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn auth(id: &str, ts: u64, caption: &str) -> Message {
        Message::authoritative(id, &alice(), &bob(), Timestamp::from_millis(ts))
            .with_caption(caption)
    }

    fn opt(temp: &MessageId, ts: u64, caption: &str) -> Message {
        Message::optimistic(temp.clone(), &alice(), &bob(), Timestamp::from_millis(ts))
            .with_caption(caption)
    }

    fn ids(list: &[Message]) -> Vec<String> {
        list.iter()
            .map(|m| m.identity().map(ToString::to_string).unwrap_or_default())
            .collect()
    }

    #[test]
    fn three_messages_come_out_in_order() {
        let merged =
            merge_messages(&[auth("3", 3_000, "c"), auth("1", 1_000, "a"), auth("2", 2_000, "b")]);
        assert_eq!(ids(&merged), vec!["1", "2", "3"]);
    }

    #[test]
    fn same_id_collapses_and_last_wins() {
        let stale = auth("1", 1_000, "old caption");
        let fresh = auth("1", 1_000, "new caption");
        let merged = merge_messages(&[stale, fresh]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].caption.as_deref(), Some("new caption"));
    }

    #[test]
    fn echoed_temp_id_replaces_placeholder() {
        let temp = MessageId::temp();
        let placeholder = opt(&temp, 1_000, "hi");
        let mut confirmed = auth("42", 1_300, "hi");
        confirmed.temp_id = Some(temp.clone());

        let merged = merge_messages(&[placeholder, confirmed]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, Some(MessageId::new("42")));
        assert_eq!(merged[0].temp_id, Some(temp));
        assert!(!merged[0].flags.sending);
    }

    #[test]
    fn fingerprint_match_absorbs_lineage() {
        let temp = MessageId::temp();
        let merged = merge_messages(&[opt(&temp, 1_000, "see you"), auth("9", 2_500, "see you")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, Some(MessageId::new("9")));
        assert_eq!(merged[0].temp_id, Some(temp));
    }

    #[test]
    fn fingerprint_outside_window_does_not_match() {
        let temp = MessageId::temp();
        let merged = merge_messages(&[opt(&temp, 1_000, "hi"), auth("9", 3_500, "hi")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn conflicting_echoed_temp_id_does_not_fingerprint_match() {
        let first = MessageId::temp();
        let second = MessageId::temp();
        let mut confirmed_first = auth("1", 1_000, "ok");
        confirmed_first.temp_id = Some(first);
        let merged = merge_messages(&[confirmed_first, opt(&second, 1_200, "ok")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn placeholder_joins_only_the_nearest_confirmed_twin() {
        let temp = MessageId::temp();
        let merged = merge_messages(&[
            auth("1", 1_000, "ok"),
            auth("2", 2_500, "ok"),
            opt(&temp, 1_800, "ok"),
        ]);
        // 2_500 is closer to the placeholder than 1_000.
        assert_eq!(ids(&merged), vec!["1", "2"]);
        assert_eq!(merged[0].temp_id, None);
        assert_eq!(merged[1].temp_id, Some(temp));
        assert!(merged.iter().all(|m| !m.is_optimistic()));
        assert_eq!(merge_messages(&merged), merged);
    }

    #[test]
    fn twin_placeholders_each_claim_one_confirmation() {
        let first = MessageId::temp();
        let second = MessageId::temp();
        let merged = merge_messages(&[
            opt(&first, 1_000, "ok"),
            opt(&second, 1_200, "ok"),
            auth("1", 1_100, "ok"),
            auth("2", 1_300, "ok"),
        ]);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|m| !m.is_optimistic()));
        let temps: HashSet<_> = merged.iter().filter_map(|m| m.temp_id.clone()).collect();
        assert_eq!(temps, HashSet::from([first, second]));
    }

    #[test]
    fn placeholder_never_bridges_two_server_ids() {
        let temp = MessageId::temp();
        let mut echoed = auth("1", 1_000, "ok");
        echoed.temp_id = Some(temp.clone());
        let merged = merge_messages(&[echoed, opt(&temp, 1_100, "ok"), auth("2", 1_200, "ok")]);
        assert_eq!(ids(&merged), vec!["1", "2"]);
    }

    #[test]
    fn two_optimistic_sends_with_same_text_stay_distinct() {
        let merged = merge_messages(&[
            opt(&MessageId::temp(), 1_000, "lol"),
            opt(&MessageId::temp(), 1_100, "lol"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn seen_never_regresses() {
        let read = auth("1", 1_000, "x").seen();
        let stale = auth("1", 1_000, "x");
        let merged = merge_messages(&[read, stale]);
        assert!(merged[0].flags.seen);
    }

    #[test]
    fn ephemeral_flags_are_unioned() {
        let merged = merge_messages(&[auth("1", 1_000, "x").nsfw(), auth("1", 1_000, "x")]);
        assert!(merged[0].flags.is_nsfw);
        assert!(merged[0].is_ephemeral());
    }

    #[test]
    fn failed_flag_cleared_once_confirmed() {
        let temp = MessageId::temp();
        let mut failed = opt(&temp, 1_000, "x");
        failed.flags.failed = true;
        failed.flags.sending = false;
        let mut confirmed = auth("5", 1_000, "x");
        confirmed.temp_id = Some(temp);
        let merged = merge_messages(&[failed, confirmed]);
        assert_eq!(merged.len(), 1);
        assert!(!merged[0].flags.failed);
    }

    #[test]
    fn transitive_matches_form_one_group() {
        let temp = MessageId::temp();
        // placeholder --temp--> echoed row --id--> fetched row
        let placeholder = opt(&temp, 1_000, "chain");
        let mut echoed = auth("77", 1_100, "chain");
        echoed.temp_id = Some(temp);
        let fetched = auth("77", 1_100, "chain").seen();
        let merged = merge_messages(&[placeholder, fetched, echoed]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].flags.seen);
    }

    #[test]
    fn malformed_records_are_dropped() {
        let mut no_identity = auth("1", 1_000, "x");
        no_identity.id = None;
        let mut no_receiver = auth("2", 1_000, "y");
        no_receiver.receiver_id = UserId::new("");
        let merged = merge_messages(&[no_identity, no_receiver, auth("3", 1_000, "z")]);
        assert_eq!(ids(&merged), vec!["3"]);
    }

    #[test]
    fn authoritative_wins_epsilon_tie() {
        let temp = MessageId::temp();
        let merged = merge_messages(&[auth("1", 1_200, "a"), opt(&temp, 1_000, "b")]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, Some(MessageId::new("1")));
        assert!(merged[1].is_optimistic());
    }

    #[test]
    fn merge_is_idempotent() {
        let temp = MessageId::temp();
        let mut confirmed = auth("2", 2_000, "b");
        confirmed.temp_id = Some(temp.clone());
        let input = vec![
            auth("1", 1_000, "a"),
            opt(&temp, 1_900, "b"),
            confirmed,
            opt(&MessageId::temp(), 2_100, "c"),
            auth("4", 2_200, "d"),
        ];
        let once = merge_messages(&input);
        let twice = merge_messages(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn media_only_messages_match_on_marker() {
        let media = MediaRef {
            url: "https://cdn/1.jpg".into(),
            thumbnail_url: None,
            kind: MediaKind::Image,
        };
        let temp = MessageId::temp();
        let placeholder = Message::optimistic(temp, &alice(), &bob(), Timestamp::from_millis(10));
        let confirmed = Message::authoritative("1", &alice(), &bob(), Timestamp::from_millis(20))
            .with_media(media.clone());
        let merged = merge_messages(&[placeholder, confirmed]);
        // "[empty]" vs "[image]" fingerprints differ.
        assert_eq!(merged.len(), 2);

        let placeholder =
            Message::optimistic(MessageId::temp(), &alice(), &bob(), Timestamp::from_millis(10))
                .with_media(media.clone());
        let confirmed = Message::authoritative("1", &alice(), &bob(), Timestamp::from_millis(20))
            .with_media(media);
        assert_eq!(merge_messages(&[placeholder, confirmed]).len(), 1);
    }

    #[test]
    fn merge_into_and_remove_identity() {
        let mut list = vec![auth("1", 1_000, "a")];
        merge_into(&mut list, [auth("2", 2_000, "b"), auth("1", 1_000, "a")]);
        assert_eq!(ids(&list), vec!["1", "2"]);
        assert!(remove_identity(&mut list, &MessageId::new("1")));
        assert!(!remove_identity(&mut list, &MessageId::new("1")));
        assert_eq!(ids(&list), vec!["2"]);
    }
}
