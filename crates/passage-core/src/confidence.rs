//! Confidence sanitization and acceptance thresholds.
//!
//! The external vector search can legitimately return NaN or
//! out-of-range similarity for degenerate inputs (empty candidate
//! set, zero-norm embedding). Nothing past this module may see a
//! non-finite confidence.

/// Advisory similarity threshold passed to the external vector search.
/// Governs candidate retrieval only.
pub const MATCH_THRESHOLD: f64 = 0.6;

/// Acceptance floor applied by this system to the returned top-1
/// candidate. Intentionally looser than [`MATCH_THRESHOLD`]: the
/// search is allowed to surface marginal candidates for this layer to
/// filter. Keep the two independently configurable.
pub const ACCEPT_FLOOR: f64 = 0.5;

/// Confidence recorded on failed attempts with no candidate at all.
pub const NO_MATCH_CONFIDENCE: f64 = 0.0;

/// Default confidence for manual/administrative attendance marks made
/// without a fresh similarity score.
pub const MANUAL_MARK_CONFIDENCE: f64 = 0.9;

/// Sanitize a raw similarity score from the external search:
/// non-finite values become 0.0, everything else clamps into [0, 1].
pub fn sanitize_similarity(raw: f64) -> f64 {
    if !raw.is_finite() {
        return NO_MATCH_CONFIDENCE;
    }
    raw.clamp(0.0, 1.0)
}

/// Sanitize an operator-supplied confidence on the mark-attendance
/// path: absent or non-finite values fall back to
/// [`MANUAL_MARK_CONFIDENCE`], finite values clamp into [0, 1].
pub fn sanitize_manual_confidence(raw: Option<f64>) -> f64 {
    match raw {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => MANUAL_MARK_CONFIDENCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_nan_maps_to_zero() {
        assert_eq!(sanitize_similarity(f64::NAN), 0.0);
    }

    #[test]
    fn test_sanitize_infinities() {
        assert_eq!(sanitize_similarity(f64::INFINITY), 0.0);
        assert_eq!(sanitize_similarity(f64::NEG_INFINITY), 0.0);
    }

    #[test]
    fn test_sanitize_clamps_out_of_range() {
        assert_eq!(sanitize_similarity(1.7), 1.0);
        assert_eq!(sanitize_similarity(-0.3), 0.0);
    }

    #[test]
    fn test_sanitize_passes_valid_scores() {
        assert_eq!(sanitize_similarity(0.82), 0.82);
        assert_eq!(sanitize_similarity(0.0), 0.0);
        assert_eq!(sanitize_similarity(1.0), 1.0);
    }

    #[test]
    fn test_manual_confidence_defaults() {
        assert_eq!(sanitize_manual_confidence(None), MANUAL_MARK_CONFIDENCE);
        assert_eq!(
            sanitize_manual_confidence(Some(f64::NAN)),
            MANUAL_MARK_CONFIDENCE
        );
        assert_eq!(
            sanitize_manual_confidence(Some(f64::INFINITY)),
            MANUAL_MARK_CONFIDENCE
        );
    }

    #[test]
    fn test_manual_confidence_clamps_finite_values() {
        assert_eq!(sanitize_manual_confidence(Some(0.82)), 0.82);
        assert_eq!(sanitize_manual_confidence(Some(2.0)), 1.0);
        // An explicit zero is kept, not treated as absent.
        assert_eq!(sanitize_manual_confidence(Some(0.0)), 0.0);
    }

    #[test]
    fn test_floor_is_looser_than_search_threshold() {
        // Intentional slack between retrieval and acceptance; the two
        // constants must stay independent.
        assert!(ACCEPT_FLOOR < MATCH_THRESHOLD);
    }
}
