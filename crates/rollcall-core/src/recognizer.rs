//! Signature extraction from face crops via ONNX Runtime.
//!
//! Two models are supported: Facenet (128-d, 160×160 input, per-image
//! standardization) and ArcFace w600k_r50 (512-d, 112×112 input, symmetric
//! 127.5 normalization, L2-normalized output). Both take NCHW RGB input.

use crate::types::Signature;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding model selected system-wide. All stored signatures must come from
/// the same model, since dimensions differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingModel {
    Facenet,
    ArcFace,
}

impl EmbeddingModel {
    pub fn signature_dim(&self) -> usize {
        match self {
            EmbeddingModel::Facenet => 128,
            EmbeddingModel::ArcFace => 512,
        }
    }

    pub fn input_size(&self) -> u32 {
        match self {
            EmbeddingModel::Facenet => 160,
            EmbeddingModel::ArcFace => 112,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            EmbeddingModel::Facenet => "facenet128.onnx",
            EmbeddingModel::ArcFace => "w600k_r50.onnx",
        }
    }
}

impl fmt::Display for EmbeddingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingModel::Facenet => f.write_str("facenet"),
            EmbeddingModel::ArcFace => f.write_str("arcface"),
        }
    }
}

impl FromStr for EmbeddingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "facenet" => Ok(EmbeddingModel::Facenet),
            "arcface" => Ok(EmbeddingModel::ArcFace),
            other => Err(format!("unknown embedding model '{other}' (expected facenet|arcface)")),
        }
    }
}

pub struct SignatureExtractor {
    session: Session,
    model: EmbeddingModel,
}

impl SignatureExtractor {
    pub fn load(
        model_path: &Path,
        model: EmbeddingModel,
        intra_threads: usize,
    ) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            %model,
            dim = model.signature_dim(),
            "loaded signature model"
        );

        Ok(Self { session, model })
    }

    pub fn model(&self) -> EmbeddingModel {
        self.model
    }

    /// Extract a signature from a face crop of any size.
    pub fn extract(&mut self, crop: &RgbImage) -> Result<Signature, RecognizerError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let input = preprocess(self.model, crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("signature output: {e}")))?;

        let expected = self.model.signature_dim();
        if raw.len() != expected {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {expected}-dim signature from {}, got {}",
                self.model,
                raw.len()
            )));
        }

        Ok(finalize(self.model, raw.to_vec()))
    }
}

/// Resize the crop to the model's square input and normalize into NCHW.
fn preprocess(model: EmbeddingModel, crop: &RgbImage) -> Array4<f32> {
    let size = model.input_size();
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);
    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));

    match model {
        EmbeddingModel::ArcFace => {
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[0, c, y as usize, x as usize]] =
                        (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }
        EmbeddingModel::Facenet => {
            // Per-image standardization ("prewhitening").
            let count = (side * side * 3) as f32;
            let mean = resized.as_raw().iter().map(|&v| v as f32).sum::<f32>() / count;
            let variance = resized
                .as_raw()
                .iter()
                .map(|&v| (v as f32 - mean).powi(2))
                .sum::<f32>()
                / count;
            let std = variance.sqrt().max(1.0 / count.sqrt());

            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - mean) / std;
                }
            }
        }
    }

    tensor
}

/// ArcFace signatures are compared on the unit sphere; Facenet output is kept
/// raw so the euclidean threshold keeps its usual scale.
fn finalize(model: EmbeddingModel, raw: Vec<f32>) -> Signature {
    match model {
        EmbeddingModel::ArcFace => {
            let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                Signature::new(raw.iter().map(|x| x / norm).collect())
            } else {
                Signature::new(raw)
            }
        }
        EmbeddingModel::Facenet => Signature::new(raw),
    }
}
