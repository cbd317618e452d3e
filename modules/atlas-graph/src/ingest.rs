//! Raw-text submissions: moderation, embedding and stance labeling ahead of the insert path.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use atlas_common::{
    validate_insight_text, AtlasError, GuardrailDecision, GuardrailVerdict, NewInsight,
    StanceClassifier, SubmissionGuardrail, TextEmbedder, CLUSTER_STUB_SUMMARY,
};

use crate::pipeline::{InsertOutcome, InsightPipeline};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    Accepted(Box<InsertOutcome>),
    NeedsRevision(GuardrailVerdict),
    Rejected(GuardrailVerdict),
}

pub struct Ingestor {
    pipeline: Arc<InsightPipeline>,
    guardrail: Arc<dyn SubmissionGuardrail>,
    embedder: Arc<dyn TextEmbedder>,
    classifier: Arc<dyn StanceClassifier>,
}

impl Ingestor {
    pub fn new(
        pipeline: Arc<InsightPipeline>,
        guardrail: Arc<dyn SubmissionGuardrail>,
        embedder: Arc<dyn TextEmbedder>,
        classifier: Arc<dyn StanceClassifier>,
    ) -> Self {
        Self {
            pipeline,
            guardrail,
            embedder,
            classifier,
        }
    }

    /// Run a submission through the collaborators and insert it if accepted.
    ///
    /// Already-known text short-circuits before any collaborator is called.
    pub async fn submit(&self, text: &str) -> Result<Submission, AtlasError> {
        let text = validate_insight_text(text)?;

        if let Some(existing) = self.pipeline.find_existing(&text).await? {
            return Ok(Submission::Accepted(Box::new(existing)));
        }

        let verdict = self
            .guardrail
            .review(&text)
            .await
            .map_err(|e| AtlasError::Collaborator(format!("guardrail: {e}")))?;
        match verdict.decision {
            GuardrailDecision::Accept => {}
            GuardrailDecision::Revise => {
                info!(categories = ?verdict.categories, "Submission needs revision");
                return Ok(Submission::NeedsRevision(verdict));
            }
            GuardrailDecision::Reject => {
                info!(categories = ?verdict.categories, "Submission rejected");
                return Ok(Submission::Rejected(verdict));
            }
        }

        let embedding = self
            .embedder
            .embed(&text)
            .await
            .map_err(|e| AtlasError::Collaborator(format!("embedder: {e}")))?;

        let context = self
            .pipeline
            .assigner()
            .nearest(&embedding)
            .await?
            .map(|c| c.summary)
            .unwrap_or_else(|| CLUSTER_STUB_SUMMARY.to_string());

        let new = match self.classifier.classify(&text, &context).await {
            Ok(label) => NewInsight {
                text,
                embedding,
                stance: Some(label.stance),
                canonical_claim: Some(label.canonical_claim),
                counterclaim: label.counterclaim,
            },
            Err(e) => {
                warn!(error = %e, "Stance classification failed, inserting unlabeled");
                NewInsight {
                    text,
                    embedding,
                    stance: None,
                    canonical_claim: None,
                    counterclaim: None,
                }
            }
        };

        let outcome = self.pipeline.insert(new).await?;
        Ok(Submission::Accepted(Box::new(outcome)))
    }
}
