//! Async attendance API over the engine thread and the store.
//!
//! Model work goes through the [`EngineHandle`]; store reads and ledger
//! reconciliation run on tokio's blocking pool so callers never block the
//! runtime on SQLite.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rollcall_core::evaluation::{self, AccuracyReport};
use rollcall_core::{
    reconciler, report, DailySummary, Enrollment, FaceEmbedder, Identity, IdentityRegistry, LedgerEntry,
    LedgerRepository, Matcher, NearestNeighborMatcher, OnnxEmbedder, RecognitionPipeline, Recognition,
    RepositoryError, SignatureRepository,
};
use rollcall_store::SqliteStore;
use serde::Serialize;

use crate::config::Config;
use crate::engine::{spawn_engine, EngineError, EngineHandle};

/// Source tag for rows marked from an uploaded image.
pub const DEFAULT_SOURCE: &str = "image";

/// Outcome of marking attendance from one image.
#[derive(Debug, Clone, Serialize)]
pub struct MarkOutcome {
    pub date: NaiveDate,
    pub recognized: Vec<Recognition>,
    /// Identities whose row for `date` was written by this call.
    pub newly_marked: Vec<String>,
}

/// One labelled image for [`AttendanceService::evaluate`].
#[derive(Debug, Clone)]
pub struct EvaluationSample {
    pub image: Vec<u8>,
    pub expected: Option<String>,
}

pub struct AttendanceService<S = SqliteStore> {
    engine: EngineHandle,
    store: Arc<S>,
}

impl<S> Clone for AttendanceService<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl AttendanceService<SqliteStore> {
    /// Open the database, load the models and start the engine thread.
    /// Fails fast if any of them is unavailable.
    pub fn start(config: &Config) -> Result<Self, EngineError> {
        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        tracing::info!(path = %config.db_path.display(), "database opened");

        let embedder = OnnxEmbedder::load(&config.embedder_config())?;
        let policy = config.match_policy();
        tracing::info!(
            model = %config.embedding_model,
            metric = %policy.metric,
            threshold = policy.threshold,
            "models loaded"
        );

        let pipeline = RecognitionPipeline::new(embedder, NearestNeighborMatcher::new(policy));
        Self::new(pipeline, store)
    }
}

impl<S> AttendanceService<S>
where
    S: IdentityRegistry + SignatureRepository + LedgerRepository + Send + Sync + 'static,
{
    pub fn new<E, M>(pipeline: RecognitionPipeline<E, M>, store: Arc<S>) -> Result<Self, EngineError>
    where
        E: FaceEmbedder + 'static,
        M: Matcher + Send + 'static,
    {
        let engine = spawn_engine(pipeline, Arc::clone(&store))?;
        Ok(Self { engine, store })
    }

    pub async fn recognize(&self, image: Vec<u8>) -> Result<Vec<Recognition>, EngineError> {
        self.engine.recognize(image).await
    }

    /// Write the ledger for `date` from a set of recognized identity ids.
    pub async fn reconcile(
        &self,
        recognized: Vec<String>,
        date: NaiveDate,
        source: String,
    ) -> Result<Vec<String>, EngineError> {
        self.with_store(move |store| reconciler::reconcile(store, &recognized, date, &source, Utc::now()))
            .await
    }

    /// Recognize faces in `image` and reconcile the ledger for `date`.
    ///
    /// The fill pass runs even when no face is recognized, so after this
    /// returns every registered identity has a row for `date`.
    pub async fn mark_from_image(
        &self,
        image: Vec<u8>,
        date: NaiveDate,
        source: String,
    ) -> Result<MarkOutcome, EngineError> {
        let recognized = self.recognize(image).await?;
        let ids = recognized.iter().map(|r| r.identity_id.clone()).collect();
        let newly_marked = self.reconcile(ids, date, source).await?;
        Ok(MarkOutcome {
            date,
            recognized,
            newly_marked,
        })
    }

    pub async fn enroll(
        &self,
        identity_id: String,
        display_name: String,
        photos: Vec<Vec<u8>>,
    ) -> Result<Enrollment, EngineError> {
        self.engine.enroll(identity_id, display_name, photos).await
    }

    pub async fn reenroll(&self, identity_id: String, photos: Vec<Vec<u8>>) -> Result<Enrollment, EngineError> {
        self.engine.reenroll(identity_id, photos).await
    }

    /// Delete an identity together with its signature and ledger rows.
    pub async fn remove_identity(&self, identity_id: String) -> Result<bool, EngineError> {
        self.with_store(move |store| store.remove(&identity_id)).await
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, EngineError> {
        self.with_store(|store| store.list()).await
    }

    pub async fn get_ledger(&self, date: NaiveDate) -> Result<Vec<LedgerEntry>, EngineError> {
        self.with_store(move |store| store.ledger_for(date)).await
    }

    pub async fn get_summary(&self, date: NaiveDate) -> Result<DailySummary, EngineError> {
        self.with_store(move |store| report::daily_summary(store, store, date)).await
    }

    pub async fn get_summary_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailySummary>, EngineError> {
        self.with_store(move |store| report::summary_range(store, store, from, to)).await
    }

    /// Score recognition against labelled images. The prediction for an
    /// image is its first recognized face; an image that cannot be decoded
    /// counts as no prediction.
    pub async fn evaluate(&self, samples: Vec<EvaluationSample>) -> Result<AccuracyReport, EngineError> {
        let mut pairs = Vec::with_capacity(samples.len());
        for (i, sample) in samples.into_iter().enumerate() {
            let predicted = match self.recognize(sample.image).await {
                Ok(recognized) => recognized.into_iter().next().map(|r| r.identity_id),
                Err(EngineError::ImageDecode(e)) => {
                    tracing::warn!(sample = i, error = %e, "evaluation image could not be decoded");
                    None
                }
                Err(EngineError::InvalidInput(msg)) => {
                    tracing::warn!(sample = i, %msg, "evaluation image rejected");
                    None
                }
                Err(e) => return Err(e),
            };
            pairs.push((sample.expected, predicted));
        }

        let report = evaluation::evaluate(pairs.iter().map(|(e, p)| (e.as_deref(), p.as_deref())));
        tracing::info!(
            samples = pairs.len(),
            precision = report.precision,
            recall = report.recall,
            f1 = report.f1_score,
            "evaluation complete"
        );
        Ok(report)
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, RepositoryError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(store.as_ref())).await??)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rollcall_core::testing::{FakeEmbedder, MemoryStore};
    use rollcall_core::{AttendanceStatus, BoundingBox, DetectedFace, EnrollError, Signature};
    use std::io::Cursor;

    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn face(values: Vec<f32>, confidence: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 4.0,
                height: 4.0,
                confidence,
            },
            signature: Signature::new(values),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn service(script: Vec<Vec<DetectedFace>>, store: Arc<MemoryStore>) -> AttendanceService<MemoryStore> {
        let pipeline = RecognitionPipeline::new(FakeEmbedder::new(2, script), NearestNeighborMatcher::default());
        AttendanceService::new(pipeline, store).unwrap()
    }

    fn registered(ids: &[(&str, Vec<f32>)]) -> Arc<MemoryStore> {
        let store = MemoryStore::default();
        for (id, values) in ids {
            store.register(id, &format!("name-{id}"), &Signature::new(values.clone())).unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_mark_from_image_marks_present_and_fills_absent() {
        let store = registered(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]);
        let svc = service(vec![vec![face(vec![1.0, 0.0], 0.9)]], Arc::clone(&store));

        let outcome = svc.mark_from_image(png(8, 8), day(1), DEFAULT_SOURCE.into()).await.unwrap();
        assert_eq!(outcome.recognized.len(), 1);
        assert_eq!(outcome.recognized[0].identity_id, "alice");
        assert_eq!(outcome.recognized[0].confidence, 1.0);
        assert_eq!(outcome.newly_marked, vec!["alice".to_string()]);

        let ledger = svc.get_ledger(day(1)).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].identity_id, "alice");
        assert_eq!(ledger[0].status, AttendanceStatus::Present);
        assert_eq!(ledger[0].source.as_deref(), Some("image"));
        assert_eq!(ledger[1].status, AttendanceStatus::Absent);

        let summary = svc.get_summary(day(1)).await.unwrap();
        assert_eq!(summary.present_count, 1);
        assert_eq!(summary.absent_count, 1);
        assert_eq!(summary.present_percent, 50.0);
    }

    #[tokio::test]
    async fn test_second_mark_same_day_is_noop() {
        let store = registered(&[("alice", vec![1.0, 0.0])]);
        let script = vec![vec![face(vec![1.0, 0.0], 0.9)], vec![face(vec![1.0, 0.0], 0.9)]];
        let svc = service(script, Arc::clone(&store));

        svc.mark_from_image(png(8, 8), day(2), "cam-1".into()).await.unwrap();
        let again = svc.mark_from_image(png(8, 8), day(2), "cam-2".into()).await.unwrap();
        assert_eq!(again.recognized.len(), 1);
        assert!(again.newly_marked.is_empty());

        let ledger = svc.get_ledger(day(2)).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].source.as_deref(), Some("cam-1"));
    }

    #[tokio::test]
    async fn test_empty_registry_skips_embedder() {
        let store = Arc::new(MemoryStore::default());
        let embedder = FakeEmbedder::new(2, vec![vec![face(vec![1.0, 0.0], 0.9)]]);
        let calls = embedder.calls();
        let pipeline = RecognitionPipeline::new(embedder, NearestNeighborMatcher::default());
        let svc = AttendanceService::new(pipeline, store).unwrap();

        let recognized = svc.recognize(png(8, 8)).await.unwrap();
        assert!(recognized.is_empty());
        assert_eq!(calls.get(), 0);

        let summary = svc.get_summary(day(3)).await.unwrap();
        assert_eq!(summary.total_identities, 0);
        assert_eq!(summary.present_percent, 0.0);
    }

    #[tokio::test]
    async fn test_recognize_rejects_undecodable_image() {
        let store = registered(&[("alice", vec![1.0, 0.0])]);
        let svc = service(vec![], store);
        let err = svc.recognize(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::ImageDecode(_)));
    }

    #[tokio::test]
    async fn test_enroll_then_duplicate_rejected() {
        let store = Arc::new(MemoryStore::default());
        let script = vec![vec![face(vec![1.0, 0.0], 0.8)], vec![face(vec![0.0, 1.0], 0.8)]];
        let svc = service(script, Arc::clone(&store));

        let enrollment = svc
            .enroll("STU001".into(), "Alice".into(), vec![png(8, 8)])
            .await
            .unwrap();
        assert_eq!(enrollment.identity.identity_id, "STU001");
        assert_eq!(enrollment.faces_used, 1);

        let err = svc
            .enroll("STU001".into(), "Alice again".into(), vec![png(8, 8)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::DuplicateRegistration(_))));

        let identities = svc.list_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].display_name, "Alice");
    }

    #[tokio::test]
    async fn test_reenroll_replaces_signature() {
        let store = registered(&[("alice", vec![1.0, 0.0])]);
        let script = vec![vec![face(vec![0.0, 1.0], 0.9)], vec![face(vec![0.0, 1.0], 0.9)]];
        let svc = service(script, Arc::clone(&store));

        svc.reenroll("alice".into(), vec![png(8, 8)]).await.unwrap();
        let recognized = svc.recognize(png(8, 8)).await.unwrap();
        assert_eq!(recognized[0].identity_id, "alice");

        let err = svc.reenroll("nobody".into(), vec![png(8, 8)]).await.unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::UnknownIdentity(_))));
    }

    #[tokio::test]
    async fn test_remove_identity_drops_ledger_rows() {
        let store = registered(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]);
        let svc = service(vec![], Arc::clone(&store));

        svc.reconcile(vec!["alice".into()], day(4), "manual".into()).await.unwrap();
        assert!(svc.remove_identity("alice".into()).await.unwrap());
        assert!(!svc.remove_identity("alice".into()).await.unwrap());

        let ledger = svc.get_ledger(day(4)).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].identity_id, "bob");
    }

    #[tokio::test]
    async fn test_summary_range_covers_every_day() {
        let store = registered(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]);
        let svc = service(vec![], Arc::clone(&store));

        svc.reconcile(vec!["alice".into(), "bob".into()], day(6), "manual".into())
            .await
            .unwrap();

        let range = svc.get_summary_range(day(5), day(7)).await.unwrap();
        let present: Vec<usize> = range.iter().map(|s| s.present_count).collect();
        assert_eq!(present, vec![0, 2, 0]);
        assert!(range.iter().all(|s| s.total_identities == 2));

        assert!(svc.get_summary_range(day(7), day(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_counts_misses() {
        let store = registered(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]);
        let script = vec![vec![face(vec![1.0, 0.0], 0.9)], vec![]];
        let svc = service(script, store);

        let samples = vec![
            EvaluationSample {
                image: png(8, 8),
                expected: Some("alice".into()),
            },
            EvaluationSample {
                image: png(8, 8),
                expected: Some("bob".into()),
            },
            EvaluationSample {
                image: b"garbage".to_vec(),
                expected: Some("alice".into()),
            },
        ];
        let report = svc.evaluate(samples).await.unwrap();
        assert_eq!((report.tp, report.fp, report.fn_), (1, 0, 2));
        assert_eq!(report.precision, 1.0);
    }
}
