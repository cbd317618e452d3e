pub mod assigner;
pub mod client;
pub mod expander;
pub mod ingest;
pub mod locks;
pub mod memory;
pub mod migrate;
pub mod neo4j_store;
pub mod pipeline;
pub mod reader;
pub mod retry;
pub mod similarity;
pub mod splitter;
pub mod store;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use assigner::ClusterAssigner;
pub use client::GraphClient;
pub use expander::NeighborhoodExpander;
pub use ingest::{Ingestor, Submission};
pub use memory::MemoryStore;
pub use migrate::migrate;
pub use neo4j_store::Neo4jStore;
pub use pipeline::{InsertOutcome, InsightPipeline};
pub use reader::AtlasReader;
pub use similarity::SimilarityGraphBuilder;
pub use splitter::{SimilarityRankSplit, SplitStrategy, StanceSplit, SupporterChallengerSplitter};
pub use store::{
    AtlasStore, ClusterStore, ClusterWrite, GraphStore, InsightStore, StoreError, UpsertOutcome,
};
