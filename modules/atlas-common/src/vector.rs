//! Embedding vector math shared by cluster assignment and edge building.

/// Cosine similarity in f64. Zero-norm inputs compare as 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Scale to unit length. A zero vector is returned unchanged.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| (*x as f64 / norm) as f32).collect()
}

/// EMA centroid update: normalize(centroid * (1 - alpha) + vector * alpha).
pub fn ema_blend(centroid: &[f32], vector: &[f32], alpha: f64) -> Vec<f32> {
    let blended: Vec<f32> = centroid
        .iter()
        .zip(vector.iter())
        .map(|(c, v)| (*c as f64 * (1.0 - alpha) + *v as f64 * alpha) as f32)
        .collect();
    l2_normalize(&blended)
}
