use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Axis-aligned face region in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face signature vector (128-d for Facenet, 512-d for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance `1 - dot / (|a| * |b| + eps)`. Lower = more similar.
    ///
    /// Accumulates in f64 so self-distance stays within 1e-4 of zero even for
    /// 512-d vectors.
    pub fn cosine_distance(&self, other: &Signature) -> f64 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(a), f64::from(b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        1.0 - dot / (norm_a.sqrt() * norm_b.sqrt() + COSINE_EPSILON)
    }

    /// L2 norm of `self - other`.
    pub fn euclidean_distance(&self, other: &Signature) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Element-wise mean of several signatures.
    ///
    /// Returns `None` for an empty slice or when dimensions disagree.
    pub fn mean(signatures: &[Signature]) -> Option<Signature> {
        let first = signatures.first()?;
        let dim = first.dim();
        if signatures.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut sums = vec![0.0f64; dim];
        for signature in signatures {
            for (sum, &v) in sums.iter_mut().zip(signature.values.iter()) {
                *sum += f64::from(v);
            }
        }

        let n = signatures.len() as f64;
        Some(Signature {
            values: sums.into_iter().map(|s| (s / n) as f32).collect(),
        })
    }
}

/// Guards the cosine denominator against zero-norm vectors.
pub const COSINE_EPSILON: f64 = 1e-8;

/// One face found by the external detector, with its extracted signature.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub signature: Signature,
}

/// A registered person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored signature joined with its identity's display name.
#[derive(Debug, Clone)]
pub struct KnownSignature {
    pub identity_id: String,
    pub display_name: String,
    pub signature: Signature,
}

/// Closest known identity for one query signature.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity_id: String,
    pub display_name: String,
    pub distance: f64,
}

/// A face recognized in an image, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub identity_id: String,
    pub display_name: String,
    /// Presentation value derived from distance, rounded to 4 decimals.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(AttendanceStatus::Present),
            "Absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

/// Row to be written to the ledger for one (identity, date) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerRow {
    pub identity_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub marked_at: DateTime<Utc>,
    pub source: String,
}

/// Ledger row joined with the identity's display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity_id: String,
    pub display_name: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub marked_at: DateTime<Utc>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_identities: usize,
    pub present_count: usize,
    pub absent_count: usize,
    pub present_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> Signature {
        Signature::new(values.to_vec())
    }

    #[test]
    fn test_cosine_distance_identical() {
        let a = sig(&[0.3, -1.2, 4.5, 0.01]);
        assert!(a.cosine_distance(&a).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = sig(&[1.0, 0.0]);
        let b = sig(&[0.0, 1.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = sig(&[1.0, 0.0]);
        let b = sig(&[-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[1.0, 0.0]);
        let d = a.cosine_distance(&b);
        assert!(d.is_finite());
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), 5.0);
    }

    #[test]
    fn test_mean_signature() {
        let mean = Signature::mean(&[sig(&[1.0, 2.0]), sig(&[3.0, 6.0])]).unwrap();
        assert_eq!(mean.values, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_empty_and_mismatched() {
        assert!(Signature::mean(&[]).is_none());
        assert!(Signature::mean(&[sig(&[1.0]), sig(&[1.0, 2.0])]).is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Present".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Present));
        assert_eq!("Absent".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Absent));
        assert!("present".parse::<AttendanceStatus>().is_err());
    }
}
