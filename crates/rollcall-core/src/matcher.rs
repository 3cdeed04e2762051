//! Nearest-neighbour identity matching with an acceptance threshold.
//!
//! The closest enrolled identity is only accepted when its Euclidean distance
//! is strictly below the threshold, so a stranger is reported as unknown rather
//! than as whoever happens to be nearest.

use crate::types::{Embedding, EnrolledFace};

/// Default acceptance distance for FaceNet embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;

/// Outcome of matching a probe against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Accepted identity `(id, full_name)`, if any.
    pub identity: Option<(String, String)>,
    /// Distance to the nearest enrolled embedding, `None` for an empty gallery.
    pub nearest_distance: Option<f32>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// `1 - distance` for an accepted match, 0 otherwise.
    pub fn confidence(&self) -> f32 {
        match (&self.identity, self.nearest_distance) {
            (Some(_), Some(distance)) => 1.0 - distance,
            _ => 0.0,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait IdentityMatcher {
    fn find(&self, probe: &Embedding, gallery: &[EnrolledFace]) -> MatchResult;
}

/// Linear scan over the gallery by Euclidean distance.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl EuclideanMatcher {
    /// `threshold` must lie in (0, 1] so an accepted match always has positive confidence.
    pub fn new(threshold: f32) -> Self {
        debug_assert!(threshold > 0.0 && threshold <= 1.0, "threshold = {threshold}");
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl IdentityMatcher for EuclideanMatcher {
    fn find(&self, probe: &Embedding, gallery: &[EnrolledFace]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, face) in gallery.iter().enumerate() {
            if face.embedding.dim() != probe.dim() {
                tracing::warn!(
                    id = %face.id,
                    stored = face.embedding.dim(),
                    probe = probe.dim(),
                    "skipping enrolled embedding with mismatched dimension"
                );
                continue;
            }

            let distance = probe.euclidean_distance(&face.embedding);
            // Strict `<`: on equal distances the first entry wins.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        let Some((idx, distance)) = best else {
            return MatchResult { identity: None, nearest_distance: None };
        };

        let identity = (distance < self.threshold).then(|| {
            let face = &gallery[idx];
            debug_assert!(1.0 - distance > 0.0, "accepted match with non-positive confidence");
            (face.id.clone(), face.full_name.clone())
        });

        tracing::debug!(
            nearest = %gallery[idx].id,
            distance,
            accepted = identity.is_some(),
            "gallery scanned"
        );

        MatchResult {
            identity,
            nearest_distance: Some(distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrolled(id: &str, values: Vec<f32>) -> EnrolledFace {
        EnrolledFace {
            id: id.into(),
            full_name: format!("{id} name"),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_scans_whole_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            enrolled("decoy1", vec![0.0, 1.0, 0.0]),
            enrolled("decoy2", vec![0.0, 0.0, 1.0]),
            enrolled("alice", vec![0.9, 0.0, 0.0]),
        ];

        let result = EuclideanMatcher::default().find(&probe, &gallery);
        assert!(result.is_match());
        assert_eq!(
            result.identity,
            Some(("alice".to_string(), "alice name".to_string()))
        );
        assert!((result.confidence() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_beyond_threshold_is_unknown() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![enrolled("far", vec![0.6, 0.8])]; // distance 1.0

        let result = EuclideanMatcher::default().find(&probe, &gallery);
        assert!(!result.is_match());
        assert_eq!(result.confidence(), 0.0);
        assert!((result.nearest_distance.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let probe = Embedding::new(vec![0.0]);
        let at = vec![enrolled("edge", vec![0.5])];
        let matcher = EuclideanMatcher::new(0.5);
        assert!(!matcher.find(&probe, &at).is_match());

        let inside = vec![enrolled("near", vec![0.49])];
        assert!(matcher.find(&probe, &inside).is_match());
    }

    #[test]
    fn test_empty_gallery() {
        let result = EuclideanMatcher::default().find(&Embedding::new(vec![1.0]), &[]);
        assert_eq!(result, MatchResult { identity: None, nearest_distance: None });
        assert_eq!(result.confidence(), 0.0);
    }

    #[test]
    fn test_tie_keeps_first() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            enrolled("first", vec![0.3, 0.0]),
            enrolled("second", vec![0.0, 0.3]),
        ];
        let result = EuclideanMatcher::default().find(&probe, &gallery);
        assert_eq!(result.identity.map(|(id, _)| id).as_deref(), Some("first"));
    }

    #[test]
    fn test_skips_mismatched_dimensions() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![
            enrolled("legacy", vec![1.0, 0.0, 0.0]),
            enrolled("bob", vec![1.0, 0.5]),
        ];
        let result = EuclideanMatcher::default().find(&probe, &gallery);
        assert_eq!(result.identity.map(|(id, _)| id).as_deref(), Some("bob"));
    }
}
