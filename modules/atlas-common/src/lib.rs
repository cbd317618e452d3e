pub mod types;
pub mod text;
pub mod vector;
pub mod config;
pub mod error;
pub mod collaborators;

pub use types::*;
pub use text::{insight_text_key, normalize_insight_text, validate_insight_text};
pub use vector::{cosine_similarity, ema_blend, l2_normalize};
pub use config::{Config, GraphSettings};
pub use error::AtlasError;
pub use collaborators::*;
