use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Enums ---

/// Position of an insight relative to its cluster's canonical claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Pro,
    Con,
    Neutral,
}

impl Stance {
    /// Pro and con oppose each other. Neutral opposes nothing.
    pub fn opposes(self, other: Stance) -> bool {
        matches!(
            (self, other),
            (Stance::Pro, Stance::Con) | (Stance::Con, Stance::Pro)
        )
    }

    /// Lenient parse for classifier output. Unknown labels fall back to neutral.
    pub fn from_label(label: &str) -> Stance {
        match label.trim().to_lowercase().as_str() {
            "pro" | "support" | "supportive" | "for" => Stance::Pro,
            "con" | "oppose" | "opposing" | "against" => Stance::Con,
            _ => Stance::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Pro => "pro",
            Stance::Con => "con",
            Stance::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Stance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Similarity,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Similarity => "similarity",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// --- Cluster ---

/// Summary stub given to every freshly created cluster until it is relabeled.
pub const CLUSTER_STUB_SUMMARY: &str =
    "Semantically related insights grouped by embedding proximity.";

/// A topical grouping of insights. Created implicitly, never deleted.
/// `version` increments on every write and backs compare-and-swap updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub centroid: Vec<f32>,
    pub item_count: u64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ClusterNode {
    /// A new cluster seeded by its first member.
    pub fn seeded(centroid: Vec<f32>, now: DateTime<Utc>) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        let id = format!("cluster-{}", &hex[..8]);
        Self {
            title: format!("Cluster {}", &hex[..6]),
            summary: CLUSTER_STUB_SUMMARY.to_string(),
            id,
            centroid,
            item_count: 1,
            version: 0,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            summary: self.summary.clone(),
            item_count: self.item_count,
        }
    }
}

/// Cluster metadata handed to callers. The centroid is deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub item_count: u64,
}

// --- Insight ---

/// A single accepted short claim. `cluster_id` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightNode {
    pub id: Uuid,
    pub text: String,
    /// Deduplication key, unique across all insights.
    pub normalized_key: String,
    pub embedding: Vec<f32>,
    pub cluster_id: String,
    /// `None` when no stance label was available upstream.
    pub stance: Option<Stance>,
    pub canonical_claim: Option<String>,
    pub counterclaim: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InsightNode {
    pub fn view(&self) -> InsightView {
        InsightView {
            id: self.id,
            text: self.text.clone(),
            cluster_id: self.cluster_id.clone(),
            stance: self.stance,
            canonical_claim: self.canonical_claim.clone(),
            created_at: self.created_at,
        }
    }
}

/// Read-side projection of an insight without its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightView {
    pub id: Uuid,
    pub text: String,
    pub cluster_id: String,
    pub stance: Option<Stance>,
    pub canonical_claim: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert trigger payload: an item that already passed moderation, embedding and stance labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInsight {
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub stance: Option<Stance>,
    #[serde(default)]
    pub canonical_claim: Option<String>,
    #[serde(default)]
    pub counterclaim: Option<String>,
}

// --- Edges ---

/// Logically undirected weighted link between two insights of the same cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub src: Uuid,
    pub dst: Uuid,
    /// Cosine similarity at creation time, clamped to [0, 1].
    pub weight: f64,
    pub edge_type: EdgeType,
    pub created_at: DateTime<Utc>,
}

impl SimilarityEdge {
    pub fn new(src: Uuid, dst: Uuid, similarity: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            src,
            dst,
            weight: similarity.clamp(0.0, 1.0),
            edge_type: EdgeType::Similarity,
            created_at,
        }
    }

    /// The endpoint opposite `id`, or `None` if the edge does not touch `id`.
    pub fn other(&self, id: Uuid) -> Option<Uuid> {
        if self.src == id {
            Some(self.dst)
        } else if self.dst == id {
            Some(self.src)
        } else {
            None
        }
    }

    pub fn touches(&self, id: Uuid) -> bool {
        self.src == id || self.dst == id
    }

    /// Direction-independent identity of the edge.
    pub fn key(&self) -> (Uuid, Uuid) {
        edge_key(self.src, self.dst)
    }
}

/// Ordered endpoint pair so (a, b) and (b, a) address the same edge.
pub fn edge_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// --- Query results ---

/// A nearest-neighbor hit from the vector query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub insight: InsightNode,
    pub similarity: f64,
}

/// An insight related to a root, with the similarity that ranked it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedInsight {
    #[serde(flatten)]
    pub insight: InsightView,
    pub similarity: f64,
}

impl From<&Neighbor> for RelatedInsight {
    fn from(n: &Neighbor) -> Self {
        Self {
            insight: n.insight.view(),
            similarity: n.similarity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub supporters: Vec<RelatedInsight>,
    pub challengers: Vec<RelatedInsight>,
}

/// Induced subgraph returned by neighborhood expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<InsightView>,
    pub edges: Vec<SimilarityEdge>,
    pub clusters: BTreeMap<String, ClusterSummary>,
    /// Set when the deadline cut traversal short. Never an error.
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stance_opposition_is_pro_con_only() {
        assert!(Stance::Pro.opposes(Stance::Con));
        assert!(Stance::Con.opposes(Stance::Pro));
        assert!(!Stance::Pro.opposes(Stance::Pro));
        assert!(!Stance::Neutral.opposes(Stance::Pro));
        assert!(!Stance::Con.opposes(Stance::Neutral));
        assert!(!Stance::Neutral.opposes(Stance::Neutral));
    }

    #[test]
    fn stance_labels_parse_leniently() {
        assert_eq!(Stance::from_label(" PRO "), Stance::Pro);
        assert_eq!(Stance::from_label("against"), Stance::Con);
        assert_eq!(Stance::from_label("unclear"), Stance::Neutral);
    }

    #[test]
    fn edge_other_is_symmetric() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let edge = SimilarityEdge::new(a, b, 0.8, Utc::now());
        assert_eq!(edge.other(a), Some(b));
        assert_eq!(edge.other(b), Some(a));
        assert_eq!(edge.other(Uuid::new_v4()), None);
        assert_eq!(edge_key(a, b), edge_key(b, a));
    }

    #[test]
    fn edge_weight_is_clamped() {
        let edge = SimilarityEdge::new(Uuid::new_v4(), Uuid::new_v4(), 1.0000002, Utc::now());
        assert_eq!(edge.weight, 1.0);
        let edge = SimilarityEdge::new(Uuid::new_v4(), Uuid::new_v4(), -0.3, Utc::now());
        assert_eq!(edge.weight, 0.0);
    }

    #[test]
    fn seeded_cluster_has_stub_labels() {
        let c = ClusterNode::seeded(vec![1.0, 0.0], Utc::now());
        assert!(c.id.starts_with("cluster-"));
        assert_eq!(c.id.len(), "cluster-".len() + 8);
        assert_eq!(c.title, format!("Cluster {}", &c.id[8..14]));
        assert_eq!(c.item_count, 1);
        assert_eq!(c.summary, CLUSTER_STUB_SUMMARY);
    }

    #[test]
    fn new_insight_accepts_missing_labels() {
        let parsed: NewInsight = serde_json::from_value(serde_json::json!({
            "text": "remote work boosts productivity",
            "embedding": [1.0, 0.0],
        }))
        .unwrap();
        assert_eq!(parsed.stance, None);
        assert!(parsed.canonical_claim.is_none());

        let labeled: NewInsight = serde_json::from_value(serde_json::json!({
            "text": "remote work lowers focus",
            "embedding": [0.0, 1.0],
            "stance": "con",
        }))
        .unwrap();
        assert_eq!(labeled.stance, Some(Stance::Con));
    }
}
