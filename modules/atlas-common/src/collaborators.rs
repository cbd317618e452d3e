//! Contracts for the external services that run before an insight reaches the graph.
//! Concrete providers live outside this workspace.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::Stance;

/// Returns a fixed-dimension embedding for normalized text.
#[async_trait::async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailDecision {
    Accept,
    Revise,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub decision: GuardrailDecision,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub type_label: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Moderation gate for submissions.
#[async_trait::async_trait]
pub trait SubmissionGuardrail: Send + Sync {
    async fn review(&self, text: &str) -> Result<GuardrailVerdict>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StanceLabel {
    pub stance: Stance,
    pub canonical_claim: String,
    #[serde(default)]
    pub counterclaim: Option<String>,
}

/// Labels an insight's stance against the summary of the cluster it is joining.
#[async_trait::async_trait]
pub trait StanceClassifier: Send + Sync {
    async fn classify(&self, text: &str, cluster_summary: &str) -> Result<StanceLabel>;
}
