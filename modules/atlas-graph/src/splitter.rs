//! Supporter / challenger partitioning of a node's neighbors.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use atlas_common::{InsightNode, Neighbor, RelatedInsight, Split};

/// Default number of insights returned on each side.
pub const DEFAULT_SPLIT_LIMIT: usize = 2;

/// One way of partitioning similarity-ranked candidates around a root.
pub trait SplitStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `candidates` arrive with the root and its duplicates already removed, ordered by
    /// similarity descending. Each side comes back uncapped, in the order its slots should
    /// be filled; the splitter dedupes and caps afterwards.
    fn partition(&self, root: &InsightNode, candidates: &[&Neighbor]) -> Split;
}

/// Supporters share the root's stance within its cluster; challengers hold the opposite one.
pub struct StanceSplit;

impl SplitStrategy for StanceSplit {
    fn name(&self) -> &'static str {
        "stance"
    }

    fn partition(&self, root: &InsightNode, candidates: &[&Neighbor]) -> Split {
        let Some(root_stance) = root.stance else {
            return Split::default();
        };
        let same_cluster = candidates
            .iter()
            .filter(|n| n.insight.cluster_id == root.cluster_id);

        let supporters = same_cluster
            .clone()
            .filter(|n| n.insight.stance == Some(root_stance))
            .map(|n| RelatedInsight::from(*n))
            .collect();
        let challengers = same_cluster
            .filter(|n| n.insight.stance.is_some_and(|s| s.opposes(root_stance)))
            .map(|n| RelatedInsight::from(*n))
            .collect();

        Split {
            supporters,
            challengers,
        }
    }
}

/// Most similar become supporters, least similar become challengers.
///
/// Both sides see every candidate. Supporters fill from the top, challengers from the
/// bottom, and anything a supporter already claimed is skipped when challengers fill.
pub struct SimilarityRankSplit;

impl SplitStrategy for SimilarityRankSplit {
    fn name(&self) -> &'static str {
        "similarity_rank"
    }

    fn partition(&self, _root: &InsightNode, candidates: &[&Neighbor]) -> Split {
        Split {
            supporters: candidates.iter().map(|n| RelatedInsight::from(*n)).collect(),
            challengers: candidates.iter().rev().map(|n| RelatedInsight::from(*n)).collect(),
        }
    }
}

/// Picks a strategy from what the data carries: stance labels when the root and at least
/// one candidate have them, similarity rank otherwise.
#[derive(Default)]
pub struct SupporterChallengerSplitter;

impl SupporterChallengerSplitter {
    pub fn new() -> Self {
        Self
    }

    pub fn strategy_for(&self, root: &InsightNode, candidates: &[&Neighbor]) -> &'static dyn SplitStrategy {
        let labeled = root.stance.is_some() && candidates.iter().any(|n| n.insight.stance.is_some());
        if labeled {
            &StanceSplit
        } else {
            &SimilarityRankSplit
        }
    }

    /// Never returns the root or a normalized-text duplicate of it, and the two lists
    /// never share an insight or a normalized key.
    pub fn split(&self, root: &InsightNode, candidates: &[Neighbor], limit: usize) -> Split {
        if limit == 0 {
            return Split::default();
        }

        let mut ranked: Vec<&Neighbor> = candidates
            .iter()
            .filter(|n| n.insight.id != root.id && n.insight.normalized_key != root.normalized_key)
            .collect();
        ranked.sort_by(|a, b| by_similarity((a.similarity, a.insight.id), (b.similarity, b.insight.id)));

        let strategy = self.strategy_for(root, &ranked);
        let split = strategy.partition(root, &ranked);

        let key_of: HashMap<Uuid, &str> = ranked
            .iter()
            .map(|n| (n.insight.id, n.insight.normalized_key.as_str()))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut keep = |r: &RelatedInsight| match key_of.get(&r.insight.id) {
            Some(key) => seen.insert(key.to_string()),
            None => false,
        };

        // Dedupe before capping. Supporters claim their keys first, so they win over an
        // equal-text challenger and a claimed key never costs a challenger its slot.
        let supporters: Vec<RelatedInsight> = split
            .supporters
            .into_iter()
            .filter(|r| keep(r))
            .take(limit)
            .collect();
        let mut challengers: Vec<RelatedInsight> = split
            .challengers
            .into_iter()
            .filter(|r| keep(r))
            .take(limit)
            .collect();
        challengers.sort_by(|a, b| by_similarity((a.similarity, a.insight.id), (b.similarity, b.insight.id)));

        Split {
            supporters,
            challengers,
        }
    }
}

/// Similarity descending, then id ascending.
fn by_similarity(a: (f64, Uuid), b: (f64, Uuid)) -> Ordering {
    b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_common::{insight_text_key, Stance};
    use chrono::Utc;

    fn node(text: &str, cluster: &str, stance: Option<Stance>) -> InsightNode {
        InsightNode {
            id: Uuid::new_v4(),
            text: text.to_string(),
            normalized_key: insight_text_key(text),
            embedding: vec![1.0, 0.0],
            cluster_id: cluster.to_string(),
            stance,
            canonical_claim: None,
            counterclaim: None,
            created_at: Utc::now(),
        }
    }

    fn neighbor(insight: InsightNode, similarity: f64) -> Neighbor {
        Neighbor {
            insight,
            similarity,
        }
    }

    fn ids(items: &[RelatedInsight]) -> Vec<Uuid> {
        items.iter().map(|r| r.insight.id).collect()
    }

    #[test]
    fn stance_path_groups_by_label() {
        let root = node("Remote work boosts productivity", "c1", Some(Stance::Pro));
        let pro = node("Working from home helps output", "c1", Some(Stance::Pro));
        let con = node("Remote work lowers focus", "c1", Some(Stance::Con));
        let neutral = node("Remote work is common now", "c1", Some(Stance::Neutral));
        let other_cluster = node("Office rents are falling", "c2", Some(Stance::Con));

        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[
                neighbor(neutral, 0.95),
                neighbor(con.clone(), 0.9),
                neighbor(pro.clone(), 0.85),
                neighbor(other_cluster, 0.8),
            ],
            DEFAULT_SPLIT_LIMIT,
        );
        assert_eq!(ids(&split.supporters), vec![pro.id]);
        assert_eq!(ids(&split.challengers), vec![con.id]);
    }

    #[test]
    fn neutral_root_has_no_challengers() {
        let root = node("Remote work is common now", "c1", Some(Stance::Neutral));
        let con = node("Remote work lowers focus", "c1", Some(Stance::Con));
        let split = SupporterChallengerSplitter::new().split(&root, &[neighbor(con, 0.9)], 2);
        assert!(split.supporters.is_empty());
        assert!(split.challengers.is_empty());
    }

    #[test]
    fn unlabeled_root_falls_back_to_similarity_rank() {
        let root = node("Cities should plant more trees", "c1", None);
        let n: Vec<InsightNode> = (0..5)
            .map(|i| node(&format!("Tree insight number {i}"), "c1", None))
            .collect();
        let candidates: Vec<Neighbor> = n
            .iter()
            .enumerate()
            .map(|(i, insight)| neighbor(insight.clone(), 0.95 - i as f64 * 0.05))
            .collect();

        let splitter = SupporterChallengerSplitter::new();
        let refs: Vec<&Neighbor> = candidates.iter().collect();
        assert_eq!(splitter.strategy_for(&root, &refs).name(), "similarity_rank");

        let split = splitter.split(&root, &candidates, 2);
        assert_eq!(ids(&split.supporters), vec![n[0].id, n[1].id]);
        assert_eq!(ids(&split.challengers), vec![n[3].id, n[4].id]);
    }

    #[test]
    fn fallback_lists_stay_disjoint_with_few_candidates() {
        let root = node("Cities should plant more trees", "c1", None);
        let a = node("Trees cool streets", "c1", None);
        let b = node("Trees cost money to maintain", "c1", None);
        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[neighbor(a.clone(), 0.9), neighbor(b.clone(), 0.8)],
            2,
        );
        assert_eq!(ids(&split.supporters), vec![a.id, b.id]);
        assert!(split.challengers.is_empty());
    }

    #[test]
    fn root_and_duplicates_are_excluded() {
        let root = node("Remote work boosts productivity", "c1", Some(Stance::Pro));
        let dup = node("remote work boosts   productivity!", "c1", Some(Stance::Pro));
        let twin_a = node("Hybrid schedules help teams", "c1", Some(Stance::Pro));
        let twin_b = node("hybrid schedules help teams.", "c1", Some(Stance::Con));

        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[
                neighbor(root.clone(), 1.0),
                neighbor(dup, 0.99),
                neighbor(twin_b, 0.95),
                neighbor(twin_a.clone(), 0.9),
            ],
            2,
        );
        assert_eq!(ids(&split.supporters), vec![twin_a.id]);
        assert!(split.challengers.is_empty());
    }

    #[test]
    fn duplicate_supporters_do_not_leave_empty_slots() {
        let root = node("Remote work boosts productivity", "c1", Some(Stance::Pro));
        let p1 = node("Home offices help output", "c1", Some(Stance::Pro));
        let p1_dup = node("home offices help output!", "c1", Some(Stance::Pro));
        let p2 = node("Skipping the commute saves energy", "c1", Some(Stance::Pro));

        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[
                neighbor(p1.clone(), 0.95),
                neighbor(p1_dup, 0.94),
                neighbor(p2.clone(), 0.90),
            ],
            2,
        );
        assert_eq!(ids(&split.supporters), vec![p1.id, p2.id]);
        assert!(split.challengers.is_empty());
    }

    #[test]
    fn duplicate_challengers_do_not_leave_empty_slots() {
        let root = node("Remote work boosts productivity", "c1", Some(Stance::Pro));
        let c1 = node("Remote work lowers focus", "c1", Some(Stance::Con));
        let c1_dup = node("remote work lowers   focus.", "c1", Some(Stance::Con));
        let c2 = node("Teams drift apart when remote", "c1", Some(Stance::Con));

        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[
                neighbor(c1.clone(), 0.9),
                neighbor(c1_dup, 0.89),
                neighbor(c2.clone(), 0.8),
            ],
            2,
        );
        assert_eq!(ids(&split.challengers), vec![c1.id, c2.id]);
    }

    #[test]
    fn fallback_challengers_refill_after_claimed_keys() {
        let root = node("Cities should plant more trees", "c1", None);
        let a = node("Trees cool streets", "c1", None);
        let b = node("Trees cost money to maintain", "c1", None);
        let c = node("Shade lowers energy bills", "c1", None);
        let d = node("Roots crack the pavement", "c1", None);
        let b_dup = node("trees cost money to maintain!", "c1", None);

        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[
                neighbor(a.clone(), 0.95),
                neighbor(b.clone(), 0.9),
                neighbor(c.clone(), 0.85),
                neighbor(d.clone(), 0.8),
                neighbor(b_dup, 0.75),
            ],
            2,
        );
        assert_eq!(ids(&split.supporters), vec![a.id, b.id]);
        assert_eq!(ids(&split.challengers), vec![c.id, d.id]);
    }

    #[test]
    fn fallback_supporters_skip_duplicates_before_capping() {
        let root = node("Cities should plant more trees", "c1", None);
        let a = node("Trees cool streets", "c1", None);
        let a_dup = node("trees cool streets.", "c1", None);
        let b = node("Trees cost money to maintain", "c1", None);
        let c = node("Shade lowers energy bills", "c1", None);
        let d = node("Roots crack the pavement", "c1", None);

        let split = SupporterChallengerSplitter::new().split(
            &root,
            &[
                neighbor(a.clone(), 0.95),
                neighbor(a_dup, 0.94),
                neighbor(b.clone(), 0.9),
                neighbor(c.clone(), 0.85),
                neighbor(d.clone(), 0.8),
            ],
            2,
        );
        assert_eq!(ids(&split.supporters), vec![a.id, b.id]);
        assert_eq!(ids(&split.challengers), vec![c.id, d.id]);
    }
}
