//! Recognition and enrollment on top of a [`FaceEmbedder`] and a [`Matcher`].

use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::matcher::Matcher;
use crate::repository::{IdentityRegistry, RepositoryError, SignatureRepository};
use crate::types::{Identity, Recognition, Signature};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("identity already registered: {0}")]
    DuplicateRegistration(String),
    #[error("identity not registered: {0}")]
    UnknownIdentity(String),
    #[error("no face detected in any photo; retry with a clearer front-facing photo")]
    NoFaceDetected,
    #[error("invalid enrollment: {0}")]
    InvalidInput(String),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub identity: Identity,
    /// Number of photos that contributed a face to the stored signature.
    pub faces_used: usize,
}

/// Owns the embedder for the lifetime of the process; constructed once at
/// startup.
pub struct RecognitionPipeline<E, M> {
    embedder: E,
    matcher: M,
}

impl<E: FaceEmbedder, M: Matcher> RecognitionPipeline<E, M> {
    pub fn new(embedder: E, matcher: M) -> Self {
        Self { embedder, matcher }
    }

    /// Identify every face in `image`.
    ///
    /// Faces are matched independently: two faces may resolve to the same
    /// identity. The embedder is not called when no stored signature has the
    /// active model's dimension.
    pub fn recognize<S>(&mut self, signatures: &S, image: &RgbImage) -> Result<Vec<Recognition>, RecognizeError>
    where
        S: SignatureRepository + ?Sized,
    {
        let dim = self.embedder.signature_dim();
        let mut known = signatures.load_all()?;
        let before = known.len();
        known.retain(|k| k.signature.dim() == dim);
        if known.len() != before {
            tracing::warn!(
                skipped = before - known.len(),
                expected_dim = dim,
                "ignoring stored signatures from a different embedding model"
            );
        }
        if known.is_empty() {
            tracing::debug!("no comparable signatures; skipping detection");
            return Ok(Vec::new());
        }

        let faces = self.embedder.detect_and_embed(image)?;
        let policy = self.matcher.policy();

        let mut recognized = Vec::new();
        for face in &faces {
            match self.matcher.best_match(&face.signature, &known) {
                Some(m) => {
                    let confidence = round_to(policy.confidence(m.distance), 4);
                    tracing::debug!(
                        identity_id = %m.identity_id,
                        distance = m.distance,
                        confidence,
                        "face matched"
                    );
                    recognized.push(Recognition {
                        identity_id: m.identity_id,
                        display_name: m.display_name,
                        confidence,
                    });
                }
                None => tracing::debug!(bbox = ?face.bbox, "face did not match any identity"),
            }
        }

        tracing::info!(
            faces = faces.len(),
            recognized = recognized.len(),
            known = known.len(),
            "recognition complete"
        );
        Ok(recognized)
    }

    /// Register a new identity from one or more photos.
    ///
    /// Duplicate ids are rejected before any model work. The stored signature
    /// is the mean of the best face from each photo; nothing is stored if no
    /// photo yields a face.
    pub fn enroll<R>(
        &mut self,
        registry: &R,
        identity_id: &str,
        display_name: &str,
        photos: &[RgbImage],
    ) -> Result<Enrollment, EnrollError>
    where
        R: IdentityRegistry + ?Sized,
    {
        let identity_id = identity_id.trim();
        let display_name = display_name.trim();
        if identity_id.is_empty() {
            return Err(EnrollError::InvalidInput("identity id is empty".into()));
        }
        if display_name.is_empty() {
            return Err(EnrollError::InvalidInput("display name is empty".into()));
        }
        if registry.exists(identity_id)? {
            return Err(EnrollError::DuplicateRegistration(identity_id.to_string()));
        }

        let (signature, faces_used) = self.aggregate(photos)?;
        let identity = match registry.register(identity_id, display_name, &signature) {
            Ok(identity) => identity,
            Err(RepositoryError::DuplicateIdentity(id)) => {
                return Err(EnrollError::DuplicateRegistration(id))
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(identity_id, faces_used, "identity enrolled");
        Ok(Enrollment { identity, faces_used })
    }

    /// Replace the stored signature of an existing identity.
    pub fn reenroll<R>(
        &mut self,
        registry: &R,
        identity_id: &str,
        photos: &[RgbImage],
    ) -> Result<Enrollment, EnrollError>
    where
        R: IdentityRegistry + SignatureRepository + ?Sized,
    {
        let identity_id = identity_id.trim();
        let identity = registry
            .get(identity_id)?
            .ok_or_else(|| EnrollError::UnknownIdentity(identity_id.to_string()))?;

        let (signature, faces_used) = self.aggregate(photos)?;
        registry.put(identity_id, &signature)?;

        tracing::info!(identity_id, faces_used, "signature replaced");
        Ok(Enrollment { identity, faces_used })
    }

    fn aggregate(&mut self, photos: &[RgbImage]) -> Result<(Signature, usize), EnrollError> {
        let mut per_photo = Vec::with_capacity(photos.len());
        for (i, photo) in photos.iter().enumerate() {
            let faces = self.embedder.detect_and_embed(photo)?;
            let best = faces
                .into_iter()
                .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence));
            match best {
                Some(face) => per_photo.push(face.signature),
                None => tracing::debug!(photo = i, "no face in enrollment photo"),
            }
        }

        let signature = Signature::mean(&per_photo).ok_or(EnrollError::NoFaceDetected)?;
        Ok((signature, per_photo.len()))
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
