//! Raw-text submissions through fake collaborators.
//!
//! Run with: cargo test -p atlas-graph --test ingest_test

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use atlas_common::{
    AtlasError, GraphSettings, GuardrailDecision, GuardrailVerdict, Stance, StanceClassifier,
    StanceLabel, SubmissionGuardrail, TextEmbedder, CLUSTER_STUB_SUMMARY,
};
use atlas_graph::{
    AtlasReader, AtlasStore, ClusterStore, Ingestor, InsightPipeline, MemoryStore, Submission,
};

const DIM: usize = 4;

// --- Fake collaborators ---

/// Texts mentioning "remote" land near one axis, everything else near another.
struct KeywordEmbedder {
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl TextEmbedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("embedding provider timed out"));
        }
        let wobble = (text.len() % 7) as f32 * 0.02;
        Ok(if text.to_lowercase().contains("remote") {
            vec![1.0, wobble, 0.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0, wobble]
        })
    }
}

struct KeywordGuardrail {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl SubmissionGuardrail for KeywordGuardrail {
    async fn review(&self, text: &str) -> Result<GuardrailVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lowered = text.to_lowercase();
        let (decision, categories) = if lowered.contains("idiot") {
            (GuardrailDecision::Reject, vec!["harassment".to_string()])
        } else if lowered.contains("everyone knows") {
            (GuardrailDecision::Revise, vec!["unsupported".to_string()])
        } else {
            (GuardrailDecision::Accept, Vec::new())
        };
        Ok(GuardrailVerdict {
            decision,
            categories,
            type_label: None,
            reason: None,
        })
    }
}

struct NegationClassifier {
    failing: AtomicBool,
    contexts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl StanceClassifier for NegationClassifier {
    async fn classify(&self, text: &str, cluster_summary: &str) -> Result<StanceLabel> {
        self.contexts.lock().unwrap().push(cluster_summary.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("classifier returned malformed json"));
        }
        let stance = if text.contains("lowers") || text.contains("hurts") {
            Stance::Con
        } else {
            Stance::Pro
        };
        Ok(StanceLabel {
            stance,
            canonical_claim: "Remote work improves productivity.".to_string(),
            counterclaim: Some("Remote work harms productivity.".to_string()),
        })
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    pipeline: Arc<InsightPipeline>,
    ingestor: Ingestor,
    embedder: Arc<KeywordEmbedder>,
    guardrail: Arc<KeywordGuardrail>,
    classifier: Arc<NegationClassifier>,
}

fn harness() -> Harness {
    let settings = GraphSettings {
        embedding_dim: DIM,
        ..GraphSettings::default()
    };
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn AtlasStore> = store.clone();
    let reader = Arc::new(AtlasReader::new(dyn_store.clone(), &settings));
    let pipeline = Arc::new(InsightPipeline::new(dyn_store, settings, reader));

    let embedder = Arc::new(KeywordEmbedder {
        failing: AtomicBool::new(false),
    });
    let guardrail = Arc::new(KeywordGuardrail {
        calls: AtomicUsize::new(0),
    });
    let classifier = Arc::new(NegationClassifier {
        failing: AtomicBool::new(false),
        contexts: Mutex::new(Vec::new()),
    });
    let ingestor = Ingestor::new(
        pipeline.clone(),
        guardrail.clone(),
        embedder.clone(),
        classifier.clone(),
    );

    Harness {
        store,
        pipeline,
        ingestor,
        embedder,
        guardrail,
        classifier,
    }
}

fn accepted(submission: Submission) -> atlas_graph::InsertOutcome {
    match submission {
        Submission::Accepted(outcome) => *outcome,
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn accepted_submission_is_labeled_and_inserted() {
    let h = harness();
    let out = accepted(h.ingestor.submit("  remote work boosts   productivity ").await.unwrap());

    assert_eq!(out.insight.text, "remote work boosts productivity.");
    assert_eq!(out.insight.stance, Some(Stance::Pro));
    assert_eq!(
        out.insight.canonical_claim.as_deref(),
        Some("Remote work improves productivity.")
    );
    assert!(out.cluster_created);
    assert_eq!(h.store.insight_count(), 1);

    // The first submission had no cluster to join, so the classifier saw the stub summary.
    assert_eq!(h.classifier.contexts.lock().unwrap()[0], CLUSTER_STUB_SUMMARY);
}

#[tokio::test]
async fn classifier_sees_the_joined_cluster_summary() {
    let h = harness();
    let first = accepted(h.ingestor.submit("remote work boosts productivity").await.unwrap());
    h.pipeline
        .relabel_cluster(&first.cluster.id, "Remote work", "Whether remote work helps teams.")
        .await
        .unwrap();

    let second = accepted(h.ingestor.submit("remote work lowers focus").await.unwrap());
    assert_eq!(second.cluster.id, first.cluster.id);
    assert_eq!(second.insight.stance, Some(Stance::Con));
    assert_eq!(
        h.classifier.contexts.lock().unwrap().last().map(String::as_str),
        Some("Whether remote work helps teams.")
    );
    let challengers: Vec<_> = second.split.challengers.iter().map(|r| r.insight.id).collect();
    assert_eq!(challengers, vec![first.insight.id]);
}

#[tokio::test]
async fn moderation_outcomes_do_not_mutate() {
    let h = harness();

    match h.ingestor.submit("remote workers are idiots").await.unwrap() {
        Submission::Rejected(v) => assert_eq!(v.categories, vec!["harassment".to_string()]),
        other => panic!("expected rejection, got {other:?}"),
    }
    match h.ingestor.submit("everyone knows remote work fails").await.unwrap() {
        Submission::NeedsRevision(v) => assert_eq!(v.decision, GuardrailDecision::Revise),
        other => panic!("expected revision request, got {other:?}"),
    }

    assert_eq!(h.store.insight_count(), 0);
    assert!(h.store.load_clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicates_skip_collaborators() {
    let h = harness();
    let first = accepted(h.ingestor.submit("Remote work boosts productivity.").await.unwrap());
    assert_eq!(h.guardrail.calls.load(Ordering::SeqCst), 1);

    let again = accepted(h.ingestor.submit("remote work boosts productivity!").await.unwrap());
    assert!(again.duplicate);
    assert_eq!(again.insight.id, first.insight.id);
    assert_eq!(h.guardrail.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.insight_count(), 1);
}

#[tokio::test]
async fn collaborator_failures() {
    let h = harness();

    h.embedder.failing.store(true, Ordering::SeqCst);
    let err = h.ingestor.submit("remote work boosts productivity").await.unwrap_err();
    assert!(matches!(err, AtlasError::Collaborator(_)), "{err:?}");
    assert!(!err.is_retryable());
    assert_eq!(h.store.insight_count(), 0);

    // A failed stance label degrades to an unlabeled insight.
    h.embedder.failing.store(false, Ordering::SeqCst);
    h.classifier.failing.store(true, Ordering::SeqCst);
    let out = accepted(h.ingestor.submit("remote work boosts productivity").await.unwrap());
    assert_eq!(out.insight.stance, None);
    assert_eq!(h.store.insight_count(), 1);
}

#[tokio::test]
async fn short_text_is_rejected_before_collaborators() {
    let h = harness();
    let err = h.ingestor.submit("   meh  ").await.unwrap_err();
    assert!(matches!(err, AtlasError::Validation(_)));
    assert_eq!(h.guardrail.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn submission_serializes_with_status_tag() {
    let h = harness();
    let out = h.ingestor.submit("remote work boosts productivity").await.unwrap();
    let json = serde_json::to_value(&out).unwrap();
    assert_eq!(json["status"], "accepted");
    assert_eq!(json["duplicate"], false);
    assert!(json["supporters"].is_array());
    assert!(json["challengers"].is_array());
    assert_eq!(json["insight"]["stance"], "pro");
}
