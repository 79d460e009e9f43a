//! Vector math used by both reconciliation and search.
//!
//! Everything here is total: malformed input (empty, mismatched length,
//! zero magnitude) yields a neutral value instead of an error or NaN, so a
//! single bad catalog entry cannot abort a whole search.

/// Decimal places kept when an embedding is normalized for storage.
pub const STORED_PRECISION: u32 = 6;

/// Decimal places of the similarity reported to callers.
pub const SCORE_PRECISION: u32 = 4;

/// Norm tolerance used when checking that a stored embedding is unit length.
pub const UNIT_TOLERANCE: f32 = 1e-3;

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Round `value` to `places` decimal places.
pub fn round_to(value: f32, places: u32) -> f32 {
    let factor = 10f64.powi(places as i32);
    ((value as f64 * factor).round() / factor) as f32
}

/// Return a unit-length copy of `v`, rounded to [`STORED_PRECISION`] places.
///
/// An empty vector stays empty and a zero vector is returned as-is.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if v.is_empty() || norm == 0.0 || !norm.is_finite() {
        return v.to_vec();
    }

    v.iter()
        .map(|x| round_to(x / norm, STORED_PRECISION))
        .collect()
}

/// Cosine similarity in `[-1, 1]`.
///
/// Returns 0 when either vector is empty, the lengths differ, or either
/// magnitude is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0f32;
    let mut mag_a = 0f32;
    let mut mag_b = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    let score = dot / (mag_a.sqrt() * mag_b.sqrt());
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Whether `v` has unit length within `tolerance`.
pub fn is_unit(v: &[f32], tolerance: f32) -> bool {
    !v.is_empty() && (l2_norm(v) - 1.0).abs() <= tolerance
}
