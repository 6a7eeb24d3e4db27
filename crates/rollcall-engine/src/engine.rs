use std::sync::Arc;

use image::RgbImage;
use rollcall_core::{
    EnrollError, Enrollment, FaceEmbedder, IdentityRegistry, Matcher, RecognitionPipeline, Recognition,
    RecognizeError, RepositoryError, SignatureRepository,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("could not decode image: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("embedder error: {0}")]
    Embedder(#[from] rollcall_core::EmbedderError),
    #[error(transparent)]
    Recognize(#[from] RecognizeError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("store error: {0}")]
    Store(#[from] rollcall_store::StoreError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the service to the engine thread. Images travel as
/// encoded bytes and are decoded on the engine thread.
enum EngineRequest {
    Recognize {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Recognition>, EngineError>>,
    },
    Enroll {
        identity_id: String,
        display_name: String,
        photos: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
    Reenroll {
        identity_id: String,
        photos: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<Enrollment, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Identify every face in an encoded image.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<Vec<Recognition>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Recognize { image, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn enroll(
        &self,
        identity_id: String,
        display_name: String,
        photos: Vec<Vec<u8>>,
    ) -> Result<Enrollment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            identity_id,
            display_name,
            photos,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn reenroll(&self, identity_id: String, photos: Vec<Vec<u8>>) -> Result<Enrollment, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Reenroll {
            identity_id,
            photos,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline (and with it the loaded models) and serves
/// requests one at a time. It exits when every handle has been dropped.
pub fn spawn_engine<E, M, S>(pipeline: RecognitionPipeline<E, M>, store: Arc<S>) -> Result<EngineHandle, EngineError>
where
    E: FaceEmbedder + 'static,
    M: Matcher + Send + 'static,
    S: IdentityRegistry + SignatureRepository + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);
    let mut pipeline = pipeline;

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { image, reply } => {
                        let result = run_recognize(&mut pipeline, store.as_ref(), &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll {
                        identity_id,
                        display_name,
                        photos,
                        reply,
                    } => {
                        let result = decode_photos(&photos).and_then(|photos| {
                            pipeline
                                .enroll(store.as_ref(), &identity_id, &display_name, &photos)
                                .map_err(EngineError::from)
                        });
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reenroll {
                        identity_id,
                        photos,
                        reply,
                    } => {
                        let result = decode_photos(&photos).and_then(|photos| {
                            pipeline
                                .reenroll(store.as_ref(), &identity_id, &photos)
                                .map_err(EngineError::from)
                        });
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_recognize<E, M, S>(
    pipeline: &mut RecognitionPipeline<E, M>,
    store: &S,
    image: &[u8],
) -> Result<Vec<Recognition>, EngineError>
where
    E: FaceEmbedder,
    M: Matcher,
    S: SignatureRepository + ?Sized,
{
    let image = decode_image(image)?;
    Ok(pipeline.recognize(store, &image)?)
}

/// Decode any format `image` supports into packed RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::InvalidInput("image is empty".into()));
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Photos that fail to decode are skipped; enrollment then fails with
/// `NoFaceDetected` if nothing usable remains.
fn decode_photos(photos: &[Vec<u8>]) -> Result<Vec<RgbImage>, EngineError> {
    if photos.is_empty() {
        return Err(EngineError::InvalidInput("at least one photo is required".into()));
    }
    let decoded: Vec<RgbImage> = photos
        .iter()
        .enumerate()
        .filter_map(|(i, bytes)| match decode_image(bytes) {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::warn!(photo = i, error = %e, "skipping undecodable enrollment photo");
                None
            }
        })
        .collect();
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert!(matches!(decode_image(&[]), Err(EngineError::InvalidInput(_))));
        assert!(matches!(decode_image(b"not an image"), Err(EngineError::ImageDecode(_))));
    }

    #[test]
    fn test_decode_photos_skips_bad_entries() {
        let good = crate::service::tests::png(4, 4);
        let photos = decode_photos(&[b"junk".to_vec(), good]).unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].dimensions(), (4, 4));

        assert!(matches!(decode_photos(&[]), Err(EngineError::InvalidInput(_))));
    }
}
