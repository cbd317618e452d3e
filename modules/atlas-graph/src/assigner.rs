//! Online cluster assignment: nearest centroid or a freshly seeded cluster.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use atlas_common::{cosine_similarity, ema_blend, AtlasError, ClusterNode, GraphSettings};

use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use crate::store::{AtlasStore, ClusterWrite, StoreError};

/// Where a vector lands before the cluster write is prepared.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Existing { cluster_id: String, similarity: f64 },
    New,
}

/// Best cluster for `vector`: maximum cosine, ties to the lowest id.
/// Clusters whose centroid has the wrong length are ignored.
pub fn select_cluster<'a>(clusters: &'a [ClusterNode], vector: &[f32]) -> Option<(&'a ClusterNode, f64)> {
    let mut best: Option<(&ClusterNode, f64)> = None;
    for cluster in clusters {
        if cluster.centroid.len() != vector.len() {
            continue;
        }
        let sim = cosine_similarity(&cluster.centroid, vector);
        best = match best {
            Some((b, s)) if s > sim || (s == sim && b.id <= cluster.id) => Some((b, s)),
            _ => Some((cluster, sim)),
        };
    }
    best
}

pub struct ClusterAssigner {
    store: Arc<dyn AtlasStore>,
    settings: GraphSettings,
    retry: RetryPolicy,
    locks: KeyedLocks<String>,
}

impl ClusterAssigner {
    pub fn new(store: Arc<dyn AtlasStore>, settings: GraphSettings) -> Self {
        Self {
            retry: RetryPolicy::from_settings(&settings),
            store,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Reject vectors the clustering math cannot use.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), AtlasError> {
        if vector.len() != self.settings.embedding_dim {
            return Err(AtlasError::Validation(format!(
                "embedding has dimension {}, expected {}",
                vector.len(),
                self.settings.embedding_dim
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(AtlasError::Validation("embedding contains non-finite values".into()));
        }
        if vector.iter().all(|v| *v == 0.0) {
            return Err(AtlasError::Validation("embedding has zero norm".into()));
        }
        Ok(())
    }

    /// Pick the target cluster from the current centroids.
    pub async fn target(&self, vector: &[f32]) -> Result<Target, StoreError> {
        let clusters = self.store.load_clusters().await?;
        Ok(match select_cluster(&clusters, vector) {
            Some((cluster, similarity)) if similarity >= self.settings.cluster_similarity_threshold => {
                Target::Existing {
                    cluster_id: cluster.id.clone(),
                    similarity,
                }
            }
            _ => Target::New,
        })
    }

    /// Best cluster at or above the join threshold, if any.
    pub async fn nearest(&self, vector: &[f32]) -> Result<Option<ClusterNode>, AtlasError> {
        self.validate_vector(vector)?;
        let clusters = self.store.load_clusters().await?;
        Ok(select_cluster(&clusters, vector)
            .filter(|(_, sim)| *sim >= self.settings.cluster_similarity_threshold)
            .map(|(c, _)| c.clone()))
    }

    /// Build the cluster write for `target` from a fresh read of the cluster.
    async fn prepare(&self, target: &Target, vector: &[f32]) -> Result<ClusterWrite, StoreError> {
        let now = Utc::now();
        match target {
            Target::New => Ok(ClusterWrite::Create(ClusterNode::seeded(vector.to_vec(), now))),
            Target::Existing { cluster_id, .. } => {
                let Some(current) = self.store.get_cluster(cluster_id).await? else {
                    // Selected from a snapshot that no longer has it. Retry re-selects.
                    return Err(StoreError::Conflict(cluster_id.clone()));
                };
                let mut next = current.clone();
                next.centroid = ema_blend(&current.centroid, vector, self.settings.cluster_ema_alpha);
                next.item_count = current.item_count + 1;
                next.updated_at = now;
                Ok(ClusterWrite::Update {
                    cluster: next,
                    expected_version: current.version,
                })
            }
        }
    }

    /// Assign `vector` to a cluster and commit the cluster write through `commit`.
    ///
    /// `commit` receives the prepared write and must apply it atomically (with any other
    /// rows that belong to the same unit). Updates to an existing cluster run under that
    /// cluster's lock and rely on the store's version check; transient failures are retried
    /// with backoff and surface as `Contention` or `StoreUnavailable` once attempts run out.
    pub async fn assign_with<T, F, Fut>(
        &self,
        vector: &[f32],
        mut commit: F,
    ) -> Result<(T, ClusterWrite), AtlasError>
    where
        F: FnMut(ClusterWrite) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.validate_vector(vector)?;

        let mut attempt = 0;
        loop {
            let result = async {
                let target = self.target(vector).await?;
                let _guard = match &target {
                    Target::Existing { cluster_id, .. } => Some(self.locks.lock(cluster_id).await),
                    Target::New => None,
                };
                let write = self.prepare(&target, vector).await?;
                let out = commit(write.clone()).await?;
                Ok::<_, StoreError>((out, write, target))
            }
            .await;

            match result {
                Ok((out, write, target)) => {
                    match &target {
                        Target::Existing { cluster_id, similarity } => debug!(
                            cluster_id = %cluster_id,
                            similarity,
                            item_count = write.cluster().item_count,
                            "Centroid updated"
                        ),
                        Target::New => debug!(cluster_id = %write.cluster().id, "Cluster created"),
                    }
                    return Ok((out, write));
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Cluster commit failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(exhausted(e, attempt + 1)),
            }
        }
    }

    /// `assign(vector) -> (cluster_id, created)`, persisting only the cluster.
    pub async fn assign(&self, vector: &[f32]) -> Result<(String, bool), AtlasError> {
        let store = self.store.clone();
        let ((), write) = self
            .assign_with(vector, |write| {
                let store = store.clone();
                async move {
                    let expected = match &write {
                        ClusterWrite::Create(_) => None,
                        ClusterWrite::Update {
                            expected_version, ..
                        } => Some(*expected_version),
                    };
                    if write.created() {
                        // A fresh id colliding with a stored one is a conflict, not an overwrite.
                        if store.get_cluster(&write.cluster().id).await?.is_some() {
                            return Err(StoreError::Conflict(write.cluster().id.clone()));
                        }
                    }
                    store.upsert_cluster(write.cluster(), expected).await
                }
            })
            .await?;
        Ok((write.cluster().id.clone(), write.created()))
    }

    /// Replace a cluster's title and summary. The centroid is untouched.
    pub async fn relabel(
        &self,
        cluster_id: &str,
        title: &str,
        summary: &str,
    ) -> Result<ClusterNode, AtlasError> {
        let title = title.trim();
        let summary = summary.trim();
        if title.is_empty() {
            return Err(AtlasError::Validation("cluster title must not be empty".into()));
        }

        let key = cluster_id.to_string();
        let _guard = self.locks.lock(&key).await;
        let mut attempt = 0;
        loop {
            let result = async {
                let Some(mut cluster) = self.store.get_cluster(cluster_id).await? else {
                    return Ok(None);
                };
                let expected = cluster.version;
                cluster.title = title.to_string();
                cluster.summary = summary.to_string();
                cluster.updated_at = Utc::now();
                self.store.upsert_cluster(&cluster, Some(expected)).await?;
                cluster.version = expected + 1;
                Ok::<_, StoreError>(Some(cluster))
            }
            .await;

            match result {
                Ok(Some(cluster)) => return Ok(cluster),
                Ok(None) => return Err(AtlasError::NotFound(format!("cluster {cluster_id}"))),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    warn!(cluster_id, attempt = attempt + 1, error = %e, "Relabel failed, retrying");
                    self.retry.wait(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(exhausted(e, attempt + 1)),
            }
        }
    }
}

fn exhausted(e: StoreError, attempts: u32) -> AtlasError {
    match e {
        StoreError::Conflict(key) => AtlasError::Contention { key, attempts },
        other => other.into(),
    }
}
