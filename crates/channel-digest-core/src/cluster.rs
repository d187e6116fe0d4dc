//! Single-link clustering over item embeddings.
//!
//! Two items share a cluster iff a chain of items connects them with every
//! consecutive pair at cosine similarity `>= similarity`: the connected
//! components of the similarity graph. Components are found with a
//! union-find, so membership does not depend on input order.
//!
//! Members are ordered by importance (descending), then `first_seen_at`,
//! then item id. Clusters are ordered by their first member, and take that
//! member's topic as label. Items without an embedding are left out; the
//! digest builder turns them into singleton entries.

use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::embedding::cosine_similarity;
use crate::models::{ClusterDraft, WindowItem};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Linkage threshold (`CLUSTER_SIM`).
    pub similarity: f32,
    /// Larger components are split into consecutive chunks. `0` disables.
    pub max_cluster_size: usize,
    /// Cap on the number of items considered, highest importance first.
    pub max_items: usize,
    /// Also require case-insensitive topic equality for an edge.
    pub require_topic_match: bool,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            similarity: 0.82,
            max_cluster_size: 12,
            max_items: 500,
            require_topic_match: false,
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity) {
            bail!("clustering.similarity must be in [0, 1], got {}", self.similarity);
        }
        if self.max_items == 0 {
            bail!("clustering.max_items must be >= 1");
        }
        Ok(())
    }
}

/// Digest ordering: importance descending, then earliest, then lowest id.
pub fn compare_importance(a: &WindowItem, b: &WindowItem) -> Ordering {
    b.importance_score
        .partial_cmp(&a.importance_score)
        .unwrap_or(Ordering::Equal)
        .then(a.first_seen_at.cmp(&b.first_seen_at))
        .then(a.item_id.cmp(&b.item_id))
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

fn topics_agree(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Group `items` into clusters. Items without an embedding are skipped.
pub fn plan_clusters(items: &[WindowItem], params: &ClusterParams) -> Vec<ClusterDraft> {
    let mut eligible: Vec<&WindowItem> = items
        .iter()
        .filter(|i| i.embedding.as_ref().is_some_and(|v| !v.is_empty()))
        .collect();
    eligible.sort_by(|a, b| compare_importance(a, b));
    eligible.truncate(params.max_items);

    let n = eligible.len();
    let mut sets = DisjointSet::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (eligible[i], eligible[j]);
            if params.require_topic_match && !topics_agree(&a.topic, &b.topic) {
                continue;
            }
            let (Some(va), Some(vb)) = (a.embedding.as_deref(), b.embedding.as_deref()) else {
                continue;
            };
            if cosine_similarity(va, vb) >= params.similarity {
                sets.union(i, j);
            }
        }
    }

    // Components in order of their first (most important) member.
    let mut order: Vec<usize> = Vec::new();
    let mut components: HashMap<usize, Vec<&WindowItem>> = HashMap::new();
    for (idx, item) in eligible.iter().enumerate() {
        let root = sets.find(idx);
        components
            .entry(root)
            .or_insert_with(|| {
                order.push(root);
                Vec::new()
            })
            .push(item);
    }

    let mut drafts = Vec::new();
    for root in order {
        let Some(members) = components.remove(&root) else {
            continue;
        };
        let chunk = if params.max_cluster_size == 0 {
            members.len()
        } else {
            params.max_cluster_size
        };
        for part in members.chunks(chunk.max(1)) {
            let topic = part
                .first()
                .map(|i| i.topic.trim())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            drafts.push(ClusterDraft {
                topic,
                item_ids: part.iter().map(|i| i.item_id).collect(),
            });
        }
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(id: i64, importance: f64, topic: &str, embedding: Option<Vec<f32>>) -> WindowItem {
        WindowItem {
            item_id: id,
            channel: "@c".into(),
            source_message_id: id,
            topic: topic.into(),
            summary: format!("summary {id}"),
            importance_score: importance,
            first_seen_at: ts(id),
            embedding,
        }
    }

    fn unit(deg: f32) -> Option<Vec<f32>> {
        let r = deg.to_radians();
        Some(vec![r.cos(), r.sin()])
    }

    fn memberships(drafts: &[ClusterDraft]) -> Vec<Vec<i64>> {
        let mut sets: Vec<Vec<i64>> = drafts
            .iter()
            .map(|d| {
                let mut ids = d.item_ids.clone();
                ids.sort();
                ids
            })
            .collect();
        sets.sort();
        sets
    }

    #[test]
    fn test_single_link_chains() {
        // 0°–30°–60°: neighbours at cos 30° ≈ 0.866, ends at cos 60° = 0.5.
        let items = vec![
            item(1, 0.5, "a", unit(0.0)),
            item(2, 0.5, "a", unit(30.0)),
            item(3, 0.5, "a", unit(60.0)),
            item(4, 0.5, "b", unit(150.0)),
        ];
        let drafts = plan_clusters(&items, &ClusterParams::default());
        assert_eq!(memberships(&drafts), vec![vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn test_membership_ignores_input_order() {
        let mut items = vec![
            item(1, 0.2, "a", unit(0.0)),
            item(2, 0.9, "a", unit(20.0)),
            item(3, 0.5, "b", unit(90.0)),
            item(4, 0.4, "b", unit(100.0)),
        ];
        let forward = memberships(&plan_clusters(&items, &ClusterParams::default()));
        items.reverse();
        let backward = memberships(&plan_clusters(&items, &ClusterParams::default()));
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_members_ordered_and_labelled_by_importance() {
        let items = vec![
            item(1, 0.3, "minor", unit(0.0)),
            item(2, 0.9, "Headline", unit(5.0)),
            item(3, 0.9, "later", unit(10.0)),
        ];
        let drafts = plan_clusters(&items, &ClusterParams::default());
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].item_ids, vec![2, 3, 1]);
        assert_eq!(drafts[0].topic.as_deref(), Some("Headline"));
    }

    #[test]
    fn test_items_without_embedding_excluded() {
        let items = vec![
            item(1, 0.9, "a", None),
            item(2, 0.5, "a", Some(vec![])),
            item(3, 0.5, "a", unit(0.0)),
        ];
        let drafts = plan_clusters(&items, &ClusterParams::default());
        assert_eq!(memberships(&drafts), vec![vec![3]]);
    }

    #[test]
    fn test_topic_match_cuts_edges() {
        let items = vec![item(1, 0.5, "Oil", unit(0.0)), item(2, 0.5, "gas", unit(1.0))];
        let params = ClusterParams {
            require_topic_match: true,
            ..ClusterParams::default()
        };
        assert_eq!(plan_clusters(&items, &params).len(), 2);

        let items = vec![item(1, 0.5, "Oil", unit(0.0)), item(2, 0.5, " oil", unit(1.0))];
        assert_eq!(plan_clusters(&items, &params).len(), 1);
    }

    #[test]
    fn test_large_components_split() {
        let items: Vec<WindowItem> = (1..=5)
            .map(|id| item(id, 1.0 - id as f64 / 10.0, "t", unit(id as f32)))
            .collect();
        let params = ClusterParams {
            max_cluster_size: 2,
            ..ClusterParams::default()
        };
        let drafts = plan_clusters(&items, &params);
        let ids: Vec<Vec<i64>> = drafts.iter().map(|d| d.item_ids.clone()).collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_max_items_keeps_most_important() {
        let items = vec![
            item(1, 0.1, "a", unit(0.0)),
            item(2, 0.9, "b", unit(90.0)),
            item(3, 0.5, "c", unit(180.0)),
        ];
        let params = ClusterParams {
            max_items: 2,
            ..ClusterParams::default()
        };
        assert_eq!(memberships(&plan_clusters(&items, &params)), vec![vec![2], vec![3]]);
    }
}
