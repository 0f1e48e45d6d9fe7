//! Nearest-identity search over a gallery snapshot.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};

/// Default acceptance threshold on Euclidean distance.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.8;

/// Strategy for comparing a query embedding against a gallery of known identities.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Best-of-N Euclidean matcher with a full linear scan.
///
/// Each identity scores the minimum distance over its references; the
/// lowest-scoring identity is accepted iff its score is strictly below the
/// threshold. Exact ties keep the first identity in gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best = None;

        for identity in gallery.iter() {
            let Some(distance) = identity.best_distance(query) else {
                continue;
            };
            // Strict comparison: the first identity wins exact ties.
            if best.is_none() || distance < best_distance {
                best_distance = distance;
                best = Some(identity);
            }
        }

        match best {
            Some(identity) => MatchResult {
                face_index: 0,
                candidate: Some(identity.identity_ref()),
                distance: best_distance,
                accepted: best_distance < threshold,
            },
            None => MatchResult::unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{Identity, ReferenceEmbedding};
    use crate::profile::Profile;
    use crate::types::EMBEDDING_DIM;

    fn vec_with(first: f32) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = first;
        Embedding::new(values)
    }

    fn identity(name: &str, refs: Vec<Embedding>) -> Identity {
        Identity {
            profile: Profile::new(name),
            references: refs
                .into_iter()
                .map(|embedding| ReferenceEmbedding { source: None, embedding })
                .collect(),
        }
    }

    fn alice_bob() -> Gallery {
        // A at origin, B at 1.5 along the first axis.
        Gallery::new(vec![
            identity("Alice", vec![vec_with(0.0)]),
            identity("Bob", vec![vec_with(1.5)]),
        ])
    }

    #[test]
    fn test_alice_accepted_at_point_three() {
        let result = EuclideanMatcher.compare(&vec_with(0.3), &alice_bob(), DEFAULT_MATCH_THRESHOLD);
        assert!(result.accepted);
        assert_eq!(result.identity().map(|i| i.name.as_str()), Some("Alice"));
        assert!((result.distance - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_exact_tie_keeps_gallery_order() {
        // 0.75 from both A and B.
        let result = EuclideanMatcher.compare(&vec_with(0.75), &alice_bob(), 0.8);
        assert!(result.accepted);
        assert_eq!(result.candidate.as_ref().map(|i| i.name.as_str()), Some("Alice"));
    }

    #[test]
    fn test_equidistant_point_nine_is_unknown() {
        let gallery = Gallery::new(vec![
            identity("Alice", vec![vec_with(0.0)]),
            identity("Bob", vec![vec_with(1.8)]),
        ]);
        let result = EuclideanMatcher.compare(&vec_with(0.9), &gallery, 0.8);
        assert!(!result.accepted);
        assert!(result.identity().is_none());
        assert!((result.distance - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let gallery = Gallery::new(vec![identity("Alice", vec![vec_with(0.0)])]);
        let at = EuclideanMatcher.compare(&vec_with(0.5), &gallery, 0.5);
        assert!(!at.accepted);
        let below = EuclideanMatcher.compare(&vec_with(0.5), &gallery, 0.5001);
        assert!(below.accepted);
    }

    #[test]
    fn test_empty_gallery_always_unknown() {
        for threshold in [0.0, 0.8, f32::MAX, f32::INFINITY] {
            let result = EuclideanMatcher.compare(&vec_with(0.0), &Gallery::default(), threshold);
            assert!(!result.accepted);
            assert!(result.candidate.is_none());
        }
    }

    #[test]
    fn test_self_match_accepted_for_any_positive_threshold() {
        let query = vec_with(0.42);
        let gallery = Gallery::new(vec![
            identity("Other", vec![vec_with(3.0)]),
            identity("Self", vec![vec_with(9.0), query.clone()]),
        ]);
        for threshold in [1e-6, 0.1, 0.8, 10.0] {
            let result = EuclideanMatcher.compare(&query, &gallery, threshold);
            assert!(result.accepted);
            assert_eq!(result.distance, 0.0);
            assert_eq!(result.identity().map(|i| i.name.as_str()), Some("Self"));
        }
    }

    #[test]
    fn test_best_of_n_beats_average() {
        // Carol has one excellent and one terrible reference; Dave two mediocre.
        let gallery = Gallery::new(vec![
            identity("Dave", vec![vec_with(0.5), vec_with(-0.5)]),
            identity("Carol", vec![vec_with(0.1), vec_with(20.0)]),
        ]);
        let result = EuclideanMatcher.compare(&vec_with(0.0), &gallery, 0.8);
        assert_eq!(result.identity().map(|i| i.name.as_str()), Some("Carol"));
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_accepted_iff_min_below_threshold() {
        let gallery = Gallery::new(vec![
            identity("A", vec![vec_with(0.0)]),
            identity("B", vec![vec_with(2.0)]),
            identity("C", vec![vec_with(-1.3), vec_with(4.0)]),
        ]);
        for step in 0..60 {
            let x = -2.0 + step as f32 * 0.1;
            let query = vec_with(x);
            let expected = [("A", 0.0f32), ("B", 2.0), ("C", -1.3), ("C", 4.0)]
                .iter()
                .map(|(n, c)| (*n, (x - c).abs()))
                .fold(None, |best: Option<(&str, f32)>, (n, d)| match best {
                    Some((_, bd)) if bd <= d => best,
                    _ => Some((n, d)),
                })
                .unwrap();

            let result = EuclideanMatcher.compare(&query, &gallery, 0.8);
            assert!((result.distance - expected.1).abs() < 1e-5, "x={x}");
            assert_eq!(result.accepted, result.distance < 0.8, "x={x}");
            if result.accepted {
                assert_eq!(result.identity().map(|i| i.name.as_str()), Some(expected.0), "x={x}");
            }
        }
    }

    #[test]
    fn test_identity_without_references_ignored() {
        let gallery = Gallery::new(vec![identity("Ghost", vec![])]);
        let result = EuclideanMatcher.compare(&vec_with(0.0), &gallery, 0.8);
        assert!(result.candidate.is_none());
    }
}
