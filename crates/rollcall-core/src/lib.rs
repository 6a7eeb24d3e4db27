//! rollcall-core: face signature matching and attendance reconciliation.
//!
//! Faces are found and embedded by a [`FaceEmbedder`] (SCRFD detection with
//! Facenet or ArcFace signatures via ONNX Runtime), matched against stored
//! signatures by nearest neighbor, and reconciled into a daily ledger with
//! exactly one row per registered identity.

pub mod detector;
pub mod embedder;
pub mod evaluation;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod reconciler;
pub mod report;
pub mod repository;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use embedder::{DetectorBackend, EmbedderConfig, EmbedderError, FaceEmbedder, OnnxEmbedder};
pub use matcher::{DistanceMetric, MatchPolicy, Matcher, NearestNeighborMatcher};
pub use pipeline::{EnrollError, Enrollment, RecognitionPipeline, RecognizeError};
pub use recognizer::EmbeddingModel;
pub use repository::{
    IdentityRegistry, InsertOutcome, LedgerRepository, LedgerTxn, RepositoryError, SignatureRepository,
};
pub use types::{
    AttendanceStatus, BoundingBox, DailySummary, DetectedFace, Identity, KnownSignature, LedgerEntry,
    MatchResult, NewLedgerRow, Recognition, Signature,
};
