//! Recognition accuracy against labelled test images.

use crate::pipeline::round_to;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

/// Score `(expected, predicted)` pairs.
///
/// A wrong identity counts as both a false positive and a missed true
/// identity. An expected identity with no prediction is a false negative;
/// a prediction where none was expected is a false positive.
pub fn evaluate<'a, I>(pairs: I) -> AccuracyReport
where
    I: IntoIterator<Item = (Option<&'a str>, Option<&'a str>)>,
{
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);

    for (expected, predicted) in pairs {
        match (expected, predicted) {
            (Some(e), Some(p)) if e == p => tp += 1,
            (Some(_), Some(_)) => {
                fp += 1;
                fn_ += 1;
            }
            (Some(_), None) => fn_ += 1,
            (None, Some(_)) => fp += 1,
            (None, None) => {}
        }
    }

    let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    AccuracyReport {
        precision: round_to(precision, 4),
        recall: round_to(recall, 4),
        f1_score: round_to(f1, 4),
        tp,
        fp,
        fn_,
    }
}
