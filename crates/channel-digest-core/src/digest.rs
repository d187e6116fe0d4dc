//! Digest entry construction.
//!
//! Turns a window's ready items, its persisted clusters and the duplicates
//! pointing at those items into ordered [`DigestEntry`] records:
//!
//! - one entry per cluster, members ordered by importance then age;
//! - items outside every cluster (typically those without an embedding)
//!   become singleton entries;
//! - entries ordered by their most important member;
//! - a duplicate contributes its `{channel, msg_id}` to its canonical's
//!   entry and is carried in `item_ids` so it is marked digested with it.

use std::collections::{HashMap, HashSet};

use crate::cluster::compare_importance;
use crate::models::{ClusterMembership, DigestEntry, DuplicateRef, SourceRef, WindowItem};

struct Group<'a> {
    title: Option<String>,
    members: Vec<&'a WindowItem>,
}

/// Build the ordered entries for one digest.
pub fn build_entries(
    items: &[WindowItem],
    clusters: &[ClusterMembership],
    duplicates: &[DuplicateRef],
) -> Vec<DigestEntry> {
    let by_id: HashMap<i64, &WindowItem> = items.iter().map(|i| (i.item_id, i)).collect();
    let mut assigned: HashSet<i64> = HashSet::new();
    let mut groups: Vec<Group<'_>> = Vec::new();

    for cluster in clusters {
        let mut members: Vec<&WindowItem> = cluster
            .item_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .filter(|i| assigned.insert(i.item_id))
            .collect();
        if members.is_empty() {
            continue;
        }
        members.sort_by(|a, b| compare_importance(a, b));
        groups.push(Group {
            title: cluster.topic.clone(),
            members,
        });
    }

    for item in items {
        if assigned.insert(item.item_id) {
            groups.push(Group {
                title: None,
                members: vec![item],
            });
        }
    }

    // Members are sorted, so the first one is the group's most important.
    groups.sort_by(|a, b| compare_importance(a.members[0], b.members[0]));

    let mut dupes_of: HashMap<i64, Vec<&DuplicateRef>> = HashMap::new();
    for d in duplicates {
        dupes_of.entry(d.duplicate_of_item_id).or_default().push(d);
    }

    groups
        .into_iter()
        .map(|group| {
            let lead = group.members[0];
            let title = group
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| lead.topic.clone());
            let body = group
                .members
                .iter()
                .map(|m| m.summary.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");

            let mut sources = Vec::new();
            let mut item_ids = Vec::new();
            for member in &group.members {
                sources.push(member.source_ref());
                item_ids.push(member.item_id);
                for dup in dupes_of.get(&member.item_id).into_iter().flatten() {
                    let source = SourceRef {
                        channel: dup.channel.clone(),
                        msg_id: dup.source_message_id,
                    };
                    if !sources.contains(&source) {
                        sources.push(source);
                    }
                    item_ids.push(dup.item_id);
                }
            }

            DigestEntry {
                title,
                body,
                sources,
                item_ids,
            }
        })
        .collect()
}

/// Every item id covered by `entries`, duplicates included.
pub fn covered_item_ids(entries: &[DigestEntry]) -> Vec<i64> {
    entries
        .iter()
        .flat_map(|e| e.item_ids.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(id: i64, channel: &str, importance: f64, seen: i64) -> WindowItem {
        WindowItem {
            item_id: id,
            channel: channel.into(),
            source_message_id: id * 10,
            topic: format!("topic {id}"),
            summary: format!("summary {id}"),
            importance_score: importance,
            first_seen_at: ts(seen),
            embedding: None,
        }
    }

    fn cluster(id: i64, topic: Option<&str>, items: &[i64]) -> ClusterMembership {
        ClusterMembership {
            cluster_id: id,
            topic: topic.map(str::to_string),
            item_ids: items.to_vec(),
        }
    }

    #[test]
    fn test_entries_ordered_by_max_importance() {
        let items = vec![
            item(1, "@a", 0.6, 10),
            item(2, "@a", 0.8, 20),
            item(3, "@b", 0.9, 30),
            item(4, "@b", 0.7, 5),
        ];
        let clusters = vec![cluster(100, Some("Energy"), &[1, 2]), cluster(101, None, &[3])];
        let entries = build_entries(&items, &clusters, &[]);

        let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["topic 3", "Energy", "topic 4"]);
        assert_eq!(entries[1].item_ids, vec![2, 1]);
        assert_eq!(entries[1].body, "summary 2\nsummary 1");
        assert_eq!(
            entries[1].sources,
            vec![
                SourceRef { channel: "@a".into(), msg_id: 20 },
                SourceRef { channel: "@a".into(), msg_id: 10 },
            ]
        );
    }

    #[test]
    fn test_unclustered_items_become_singletons() {
        let items = vec![item(1, "@a", 0.5, 10), item(2, "@a", 0.5, 20)];
        let entries = build_entries(&items, &[], &[]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].item_ids, vec![1]);
        assert_eq!(entries[1].item_ids, vec![2]);
    }

    #[test]
    fn test_duplicate_sources_join_canonical_entry() {
        let items = vec![item(1, "@a", 0.5, 10)];
        let dups = vec![DuplicateRef {
            item_id: 9,
            duplicate_of_item_id: 1,
            channel: "@b".into(),
            source_message_id: 77,
        }];
        let entries = build_entries(&items, &[cluster(5, None, &[1])], &dups);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sources.len(), 2);
        assert_eq!(entries[0].sources[1], SourceRef { channel: "@b".into(), msg_id: 77 });
        assert_eq!(covered_item_ids(&entries), vec![1, 9]);
    }

    #[test]
    fn test_cluster_members_outside_window_ignored() {
        let items = vec![item(1, "@a", 0.5, 10)];
        let entries = build_entries(&items, &[cluster(5, Some("x"), &[1, 42]), cluster(6, None, &[43])], &[]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item_ids, vec![1]);
    }

    #[test]
    fn test_empty_window_has_no_entries() {
        assert!(build_entries(&[], &[cluster(1, None, &[1])], &[]).is_empty());
    }
}
