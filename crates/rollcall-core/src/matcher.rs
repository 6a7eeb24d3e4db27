//! Nearest-neighbor identity matching under a distance threshold.

use crate::types::{KnownSignature, MatchResult, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_COSINE_THRESHOLD: f64 = 0.6;
pub const DEFAULT_EUCLIDEAN_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Signature, b: &Signature) -> f64 {
        match self {
            DistanceMetric::Cosine => a.cosine_distance(b),
            DistanceMetric::Euclidean => a.euclidean_distance(b),
        }
    }

    pub fn default_threshold(&self) -> f64 {
        match self {
            DistanceMetric::Cosine => DEFAULT_COSINE_THRESHOLD,
            DistanceMetric::Euclidean => DEFAULT_EUCLIDEAN_THRESHOLD,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => f.write_str("cosine"),
            DistanceMetric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            other => Err(format!("unknown distance metric '{other}' (expected cosine|euclidean)")),
        }
    }
}

/// Active metric together with its acceptance threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub metric: DistanceMetric,
    pub threshold: f64,
}

impl MatchPolicy {
    pub fn new(metric: DistanceMetric, threshold: f64) -> Self {
        Self { metric, threshold }
    }

    /// Policy with the metric's default threshold.
    pub fn with_default_threshold(metric: DistanceMetric) -> Self {
        Self::new(metric, metric.default_threshold())
    }

    pub fn accepts(&self, distance: f64) -> bool {
        distance <= self.threshold
    }

    /// Confidence shown to callers. Never used to decide a match.
    pub fn confidence(&self, distance: f64) -> f64 {
        match self.metric {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Euclidean => {
                if self.threshold > 0.0 {
                    (1.0 - distance / self.threshold).max(0.0)
                } else {
                    0.0
                }
            }
        }
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::with_default_threshold(DistanceMetric::Cosine)
    }
}

/// Strategy for finding the closest known identity to a query signature.
pub trait Matcher {
    fn policy(&self) -> MatchPolicy;

    fn best_match(&self, query: &Signature, known: &[KnownSignature]) -> Option<MatchResult>;
}

/// Linear scan over every known signature.
///
/// A candidate replaces the current best only when it is strictly closer and
/// within the threshold, so the earliest of equally distant candidates wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborMatcher {
    policy: MatchPolicy,
}

impl NearestNeighborMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for NearestNeighborMatcher {
    fn policy(&self) -> MatchPolicy {
        self.policy
    }

    fn best_match(&self, query: &Signature, known: &[KnownSignature]) -> Option<MatchResult> {
        let mut best_dist = f64::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in known.iter().enumerate() {
            let d = self.policy.metric.distance(query, &candidate.signature);
            if d < best_dist && self.policy.accepts(d) {
                best_dist = d;
                best_idx = Some(i);
            }
        }

        best_idx.map(|idx| MatchResult {
            identity_id: known[idx].identity_id.clone(),
            display_name: known[idx].display_name.clone(),
            distance: best_dist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(id: &str, values: &[f32]) -> KnownSignature {
        KnownSignature {
            identity_id: id.into(),
            display_name: format!("name-{id}"),
            signature: Signature::new(values.to_vec()),
        }
    }

    fn cosine() -> NearestNeighborMatcher {
        NearestNeighborMatcher::new(MatchPolicy::with_default_threshold(DistanceMetric::Cosine))
    }

    #[test]
    fn test_scans_whole_gallery() {
        let query = Signature::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            known("decoy1", &[0.0, 1.0, 0.0]),
            known("decoy2", &[0.0, 0.0, 1.0]),
            known("match", &[1.0, 0.0, 0.0]),
        ];

        let result = cosine().best_match(&query, &gallery).unwrap();
        assert_eq!(result.identity_id, "match");
        assert_eq!(result.display_name, "name-match");
        assert!(result.distance.abs() < 1e-4);
    }

    #[test]
    fn test_no_match_beyond_threshold() {
        let query = Signature::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![known("other", &[0.0, 1.0, 0.0])];
        assert!(cosine().best_match(&query, &gallery).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let query = Signature::new(vec![1.0, 0.0]);
        assert!(cosine().best_match(&query, &[]).is_none());
    }

    #[test]
    fn test_self_distance_within_threshold() {
        let v: Vec<f32> = (0..128).map(|i| ((i * 37 % 11) as f32 - 5.0) / 3.0).collect();
        let query = Signature::new(v.clone());
        let result = cosine().best_match(&query, &[known("STU001", &v)]).unwrap();
        assert!(result.distance.abs() < 1e-4);
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let query = Signature::new(vec![0.0, 0.0]);
        let gallery = vec![known("first", &[1.0, 0.0]), known("second", &[0.0, 1.0])];
        let matcher = NearestNeighborMatcher::new(MatchPolicy::new(DistanceMetric::Euclidean, 10.0));
        let result = matcher.best_match(&query, &gallery).unwrap();
        assert_eq!(result.identity_id, "first");
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let query = Signature::new(vec![0.0, 0.0]);
        let gallery = vec![known("edge", &[10.0, 0.0])];

        let at = NearestNeighborMatcher::new(MatchPolicy::new(DistanceMetric::Euclidean, 10.0));
        let result = at.best_match(&query, &gallery).unwrap();
        assert_eq!(result.distance, 10.0);

        let just_below = f64::from_bits(10.0f64.to_bits() - 1);
        let beyond = NearestNeighborMatcher::new(MatchPolicy::new(DistanceMetric::Euclidean, just_below));
        assert!(beyond.best_match(&query, &gallery).is_none());
    }

    #[test]
    fn test_closer_candidate_outside_threshold_ignored() {
        let query = Signature::new(vec![0.0]);
        let gallery = vec![known("far", &[3.0]), known("near", &[1.0])];
        let matcher = NearestNeighborMatcher::new(MatchPolicy::new(DistanceMetric::Euclidean, 0.5));
        assert!(matcher.best_match(&query, &gallery).is_none());
    }

    #[test]
    fn test_confidence() {
        let cos = MatchPolicy::with_default_threshold(DistanceMetric::Cosine);
        assert!((cos.confidence(0.25) - 0.75).abs() < 1e-12);

        let euc = MatchPolicy::new(DistanceMetric::Euclidean, 10.0);
        assert!((euc.confidence(2.5) - 0.75).abs() < 1e-12);
        assert_eq!(euc.confidence(12.0), 0.0);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("Euclidean".parse::<DistanceMetric>(), Ok(DistanceMetric::Euclidean));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
