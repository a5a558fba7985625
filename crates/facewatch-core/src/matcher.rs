//! Nearest-neighbor identity matching.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};

/// Reference acceptance threshold for L2-normalized FaceNet embeddings.
pub const DEFAULT_THRESHOLD: f32 = 1.05;

/// Strategy for classifying a query embedding against a gallery snapshot.
pub trait Matcher {
    fn classify(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Exhaustive Euclidean nearest-neighbor matcher.
///
/// Scans every entry, keeps the global minimum and accepts it when it is
/// strictly below the threshold. Ties keep the earliest entry in gallery
/// order. No normalization is applied; embeddings are expected to come out
/// of the embedder already normalized.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn classify(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        if let Some(dimension) = gallery.dimension() {
            if dimension != query.dimension() {
                tracing::debug!(
                    expected = dimension,
                    actual = query.dimension(),
                    "query dimension does not match gallery"
                );
                return MatchResult::unmatched(f32::INFINITY);
            }
        }

        if query.values.iter().any(|v| !v.is_finite()) {
            // NaN distances never compare below the running minimum.
            tracing::debug!(dimension = query.dimension(), "query embedding has non-finite values");
            return MatchResult::unmatched(f32::INFINITY);
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.identities().iter().enumerate() {
            let distance = query.euclidean_distance(&identity.embedding);
            // Strict comparison: an equal distance never displaces an earlier entry.
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance < threshold => MatchResult {
                identity: Some(gallery.identities()[idx].clone()),
                distance: best_distance,
            },
            _ => MatchResult::unmatched(best_distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    fn gallery(entries: &[(&str, &str, &[f32])]) -> Gallery {
        Gallery::from_identities(
            entries
                .iter()
                .map(|(id, name, v)| Identity::new(*id, *name, v.to_vec()))
                .collect(),
        )
        .unwrap()
    }

    fn alice_and_bob() -> Gallery {
        gallery(&[("001", "Alice", &[0.0, 0.0]), ("002", "Bob", &[10.0, 10.0])])
    }

    #[test]
    fn test_matches_nearest_identity() {
        let result = EuclideanMatcher.classify(&Embedding::new(vec![0.1, 0.1]), &alice_and_bob(), DEFAULT_THRESHOLD);
        let identity = result.identity.as_ref().expect("expected a match");
        assert_eq!(identity.name, "Alice");
        assert_eq!(identity.id, "001");
        assert!((result.distance - 0.141_421).abs() < 1e-4);
    }

    #[test]
    fn test_midpoint_is_unmatched() {
        let result = EuclideanMatcher.classify(&Embedding::new(vec![5.0, 5.0]), &alice_and_bob(), DEFAULT_THRESHOLD);
        assert!(!result.is_match());
        // Still reports the true minimum distance.
        assert!((result.distance - 50f32.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let g = gallery(&[("1", "a", &[0.0])]);
        let result = EuclideanMatcher.classify(&Embedding::new(vec![1.0]), &g, 1.0);
        assert!(!result.is_match());
        assert_eq!(result.distance, 1.0);
    }

    #[test]
    fn test_empty_gallery_is_unmatched() {
        let result = EuclideanMatcher.classify(&Embedding::new(vec![0.0, 0.0]), &Gallery::empty(), DEFAULT_THRESHOLD);
        assert!(!result.is_match());
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_tie_picks_lowest_index() {
        let g = gallery(&[
            ("far", "far", &[5.0, 0.0]),
            ("left", "left", &[-1.0, 0.0]),
            ("right", "right", &[1.0, 0.0]),
            ("left2", "left2", &[-1.0, 0.0]),
        ]);
        for _ in 0..10 {
            let result = EuclideanMatcher.classify(&Embedding::new(vec![0.0, 0.0]), &g, 2.0);
            assert_eq!(result.identity.map(|i| i.id).as_deref(), Some("left"));
            assert_eq!(result.distance, 1.0);
        }
    }

    #[test]
    fn test_scans_whole_gallery() {
        // Best match is the last entry.
        let g = gallery(&[
            ("1", "decoy1", &[0.0, 1.0, 0.0]),
            ("2", "decoy2", &[0.0, 0.0, 1.0]),
            ("3", "match", &[1.0, 0.0, 0.0]),
        ]);
        let result = EuclideanMatcher.classify(&Embedding::new(vec![1.0, 0.0, 0.0]), &g, 0.5);
        assert_eq!(result.identity.map(|i| i.name).as_deref(), Some("match"));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_dimension_mismatch_is_unmatched() {
        let result = EuclideanMatcher.classify(&Embedding::new(vec![0.0, 0.0, 0.0]), &alice_and_bob(), 100.0);
        assert!(!result.is_match());
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_non_finite_query_is_unmatched() {
        for bad in [f32::NAN, f32::INFINITY] {
            let result = EuclideanMatcher.classify(&Embedding::new(vec![0.0, bad]), &alice_and_bob(), 100.0);
            assert!(!result.is_match());
            assert_eq!(result.distance, f32::INFINITY);
        }
    }

    #[test]
    fn test_agrees_with_brute_force_minimum() {
        // Deterministic pseudo-random galleries and queries.
        let mut seed = 0x2545_f491_u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed % 2000) as f32 / 1000.0 - 1.0
        };

        for round in 0..50 {
            let identities: Vec<Identity> = (0..(round % 7 + 1))
                .map(|i| Identity::new(i.to_string(), format!("p{i}"), (0..4).map(|_| next()).collect::<Vec<_>>()))
                .collect();
            let g = Gallery::from_identities(identities.clone()).unwrap();
            let query = Embedding::new((0..4).map(|_| next()).collect());
            let threshold = 0.8;

            let expected = identities
                .iter()
                .map(|i| query.euclidean_distance(&i.embedding))
                .fold(f32::INFINITY, f32::min);

            let result = EuclideanMatcher.classify(&query, &g, threshold);
            assert_eq!(result.distance, expected);
            assert_eq!(result.is_match(), expected < threshold);
        }
    }
}
