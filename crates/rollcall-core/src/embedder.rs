//! Face detection + signature extraction capability.
//!
//! The pipeline only sees [`FaceEmbedder`]. The concrete strategy is chosen
//! from configuration once at startup and handed to the engine.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{EmbeddingModel, RecognizerError, SignatureExtractor};
use crate::types::{BoundingBox, DetectedFace};
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Fraction of the larger box side added on every edge before cropping.
const CROP_PADDING: f32 = 0.1;

const SCRFD_FILE_NAME: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Detects every face in an image and extracts one signature per face.
pub trait FaceEmbedder: Send {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedderError>;

    fn signature_dim(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorBackend {
    /// SCRFD ONNX detector.
    Scrfd,
    /// Whole image is one face; for photos that are already face crops.
    FullFrame,
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorBackend::Scrfd => f.write_str("scrfd"),
            DetectorBackend::FullFrame => f.write_str("full-frame"),
        }
    }
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scrfd" => Ok(DetectorBackend::Scrfd),
            "full-frame" | "fullframe" | "none" => Ok(DetectorBackend::FullFrame),
            other => Err(format!("unknown detector backend '{other}' (expected scrfd|full-frame)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub model_dir: PathBuf,
    pub detector: DetectorBackend,
    pub model: EmbeddingModel,
    pub detection_confidence: f32,
    pub intra_threads: usize,
}

impl EmbedderConfig {
    pub fn detector_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_FILE_NAME)
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(self.model.file_name())
    }
}

enum Detection {
    Scrfd(FaceDetector),
    FullFrame,
}

/// ONNX-backed embedder: one detector strategy plus one signature model.
pub struct OnnxEmbedder {
    detection: Detection,
    extractor: SignatureExtractor,
}

impl OnnxEmbedder {
    /// Load every model the configuration needs. Fails fast on a missing file.
    pub fn load(config: &EmbedderConfig) -> Result<Self, EmbedderError> {
        let detection = match config.detector {
            DetectorBackend::Scrfd => Detection::Scrfd(FaceDetector::load(
                &config.detector_path(),
                config.intra_threads,
                config.detection_confidence,
            )?),
            DetectorBackend::FullFrame => Detection::FullFrame,
        };
        let extractor =
            SignatureExtractor::load(&config.model_path(), config.model, config.intra_threads)?;

        tracing::info!(
            detector = %config.detector,
            model = %config.model,
            "embedder ready"
        );
        Ok(Self { detection, extractor })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedderError> {
        let boxes = match &mut self.detection {
            Detection::Scrfd(detector) => detector.detect(image)?,
            Detection::FullFrame => full_frame_box(image).into_iter().collect(),
        };

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let Some(crop) = padded_crop(image, &bbox) else {
                tracing::debug!(?bbox, "skipping empty face crop");
                continue;
            };
            let signature = self.extractor.extract(&crop)?;
            faces.push(DetectedFace { bbox, signature });
        }
        Ok(faces)
    }

    fn signature_dim(&self) -> usize {
        self.extractor.model().signature_dim()
    }
}

fn full_frame_box(image: &RgbImage) -> Option<BoundingBox> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    Some(BoundingBox {
        x: 0.0,
        y: 0.0,
        width: image.width() as f32,
        height: image.height() as f32,
        confidence: 1.0,
    })
}

/// Crop `bbox` grown by [`CROP_PADDING`] of its larger side, clamped to the
/// image. Returns `None` when nothing of the box lies inside the image.
pub fn padded_crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let pad = (CROP_PADDING * bbox.width.max(bbox.height)).floor().max(0.0);
    let (img_w, img_h) = (image.width() as f32, image.height() as f32);

    let x1 = (bbox.x - pad).max(0.0).floor();
    let y1 = (bbox.y - pad).max(0.0).floor();
    let x2 = (bbox.x + bbox.width + pad).min(img_w).floor();
    let y2 = (bbox.y + bbox.height + pad).min(img_h).floor();

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let crop = imageops::crop_imm(image, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32);
    Some(crop.to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
        BoundingBox { x, y, width, height, confidence: 0.9 }
    }

    #[test]
    fn test_padded_crop_grows_by_larger_side() {
        let image = RgbImage::from_pixel(200, 200, Rgb([1, 2, 3]));
        let crop = padded_crop(&image, &bbox(50.0, 50.0, 40.0, 60.0)).unwrap();
        // pad = 6 on every edge.
        assert_eq!(crop.dimensions(), (52, 72));
    }

    #[test]
    fn test_padded_crop_clamps_to_image() {
        let image = RgbImage::from_pixel(100, 80, Rgb([0, 0, 0]));
        let crop = padded_crop(&image, &bbox(-10.0, 60.0, 50.0, 50.0)).unwrap();
        assert_eq!(crop.dimensions(), (45, 80 - 55));
    }

    #[test]
    fn test_padded_crop_outside_image() {
        let image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        assert!(padded_crop(&image, &bbox(300.0, 300.0, 20.0, 20.0)).is_none());
    }

    #[test]
    fn test_full_frame_box() {
        let image = RgbImage::new(64, 48);
        let b = full_frame_box(&image).unwrap();
        assert_eq!((b.width, b.height), (64.0, 48.0));
        assert!(full_frame_box(&RgbImage::new(0, 0)).is_none());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("scrfd".parse::<DetectorBackend>(), Ok(DetectorBackend::Scrfd));
        assert_eq!("full-frame".parse::<DetectorBackend>(), Ok(DetectorBackend::FullFrame));
        assert!("mtcnn".parse::<DetectorBackend>().is_err());
    }
}
