use crate::config::{Config, ConfigError};
use rollcall_core::{
    AttendancePipeline, AttendanceStore, EnrollError, EnrollOutcome, EnrollRequest, FaceModels,
    FaceNetEncoder, ModelError, OnnxLivenessClassifier, RawFaceStorage, Recognition, ScrfdDetector,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<EnrollOutcome, EnrollError>>,
    },
    Recognize {
        image: Vec<u8>,
        reply: oneshot::Sender<Recognition>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Enroll an identity from a batch of photos.
    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrollOutcome, EngineError> {
        Ok(self
            .call(|reply| EngineRequest::Enroll { request, reply })
            .await??)
    }

    /// Recognize one frame. Any engine failure, including a timeout, reports Unknown.
    pub async fn recognize(&self, image: Vec<u8>) -> Recognition {
        match self.call(|reply| EngineRequest::Recognize { image, reply }).await {
            Ok(recognition) => recognition,
            Err(err) => {
                tracing::warn!(error = %err, "recognition unavailable; reporting unknown");
                Recognition::unknown()
            }
        }
    }

    /// Queue a request and wait for its reply. The timeout covers both the
    /// wait for queue space and the engine's work.
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(request(reply_tx))
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Load the three ONNX models and spawn the engine.
///
/// Fails fast at startup if any model is missing or the config is unusable.
pub fn spawn_engine(
    config: &Config,
    store: Arc<dyn AttendanceStore>,
) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let locator = ScrfdDetector::load(&detector_path, config.min_detection_confidence)?;
    tracing::info!(path = %detector_path, "face detector loaded");

    let liveness_path = config.liveness_model_path();
    let liveness = OnnxLivenessClassifier::load(&liveness_path)?;
    tracing::info!(path = %liveness_path, "liveness classifier loaded");

    let embedder_path = config.embedder_model_path();
    let extractor = FaceNetEncoder::load(&embedder_path)?;
    tracing::info!(path = %embedder_path, "embedding model loaded");

    let pipeline = AttendancePipeline::new(
        FaceModels {
            locator: Box::new(locator),
            liveness: Box::new(liveness),
            extractor: Box::new(extractor),
        },
        config.pipeline_settings()?,
    );

    spawn_with(
        pipeline,
        store,
        RawFaceStorage::new(&config.storage_dir),
        Duration::from_secs(config.inference_timeout_secs),
    )
}

/// Run `pipeline` on a dedicated OS thread. The thread owns the models; requests
/// are served one at a time in arrival order.
pub fn spawn_with(
    mut pipeline: AttendancePipeline,
    store: Arc<dyn AttendanceStore>,
    storage: RawFaceStorage,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { request, reply } => {
                        // The caller may time out mid-run; never commit for a caller that left.
                        let result = pipeline.enroll_unless(store.as_ref(), &storage, &request, &|| {
                            reply.is_closed()
                        });
                        if let Err(err) = &result {
                            tracing::warn!(id = %request.id, error = %err, "enrollment rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { reply, .. } if reply.is_closed() => {
                        tracing::debug!("caller gone; skipping stale recognition");
                    }
                    EngineRequest::Recognize { image, reply } => {
                        let recognition = pipeline.recognize(store.as_ref(), &image);
                        tracing::debug!(identity = recognition.label(), "recognition complete");
                        let _ = reply.send(recognition);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use rollcall_core::{
        BoundingBox, Embedding, EmbeddingExtractor, FaceLocator, LivenessGate, PipelineSettings,
        Verdict,
    };
    use rollcall_store::SqliteStore;
    use std::io::Cursor;

    struct SlowLocator(Duration);

    impl FaceLocator for SlowLocator {
        fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ModelError> {
            std::thread::sleep(self.0);
            Ok(Some(BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.99,
            }))
        }
    }

    struct AlwaysLive;

    impl LivenessGate for AlwaysLive {
        fn score(&mut self, _face: &RgbImage) -> Result<f32, ModelError> {
            Ok(0.98)
        }
    }

    struct FlatExtractor;

    impl EmbeddingExtractor for FlatExtractor {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, ModelError> {
            Ok(Embedding::new(vec![0.1; 8]))
        }
    }

    fn png() -> Vec<u8> {
        let img = RgbImage::from_pixel(32, 32, Rgb([120, 90, 60]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn engine(dir: &tempfile::TempDir, delay: Duration, timeout: Duration) -> EngineHandle {
        engine_with_store(dir, delay, timeout).0
    }

    fn engine_with_store(
        dir: &tempfile::TempDir,
        delay: Duration,
        timeout: Duration,
    ) -> (EngineHandle, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open(dir.path().join("rollcall.db")).unwrap());
        let pipeline = AttendancePipeline::new(
            FaceModels {
                locator: Box::new(SlowLocator(delay)),
                liveness: Box::new(AlwaysLive),
                extractor: Box::new(FlatExtractor),
            },
            PipelineSettings::default(),
        );
        let handle = spawn_with(
            pipeline,
            Arc::clone(&store) as Arc<dyn AttendanceStore>,
            RawFaceStorage::new(dir.path().join("storage")),
            timeout,
        )
        .unwrap();
        (handle, store)
    }

    fn request(id: &str, images: Vec<Vec<u8>>) -> EnrollRequest {
        EnrollRequest {
            id: id.into(),
            full_name: "Ada Lovelace".into(),
            department: "Engineering".into(),
            images,
        }
    }

    #[tokio::test]
    async fn test_enroll_then_recognize_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir, Duration::ZERO, Duration::from_secs(5));

        let outcome = handle.enroll(request(" Ada ", vec![png(), png()])).await.unwrap();
        assert_eq!(outcome.identity_id, "ada");
        assert_eq!(outcome.used, 2);
        assert!(outcome.image_dir.join("ada_1.jpg").exists());

        let recognition = handle.recognize(png()).await;
        assert_eq!(
            recognition.verdict,
            Verdict::Match {
                id: "ada".into(),
                full_name: "Ada Lovelace".into()
            }
        );
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir, Duration::ZERO, Duration::from_secs(5));

        let recognition = handle.recognize(b"not an image".to_vec()).await;
        assert_eq!(recognition, Recognition::unknown());
    }

    #[tokio::test]
    async fn test_enroll_errors_are_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir, Duration::ZERO, Duration::from_secs(5));

        let err = handle.enroll(request("   ", vec![png()])).await.unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::InvalidId)));

        let err = handle
            .enroll(request("bob", vec![png(), b"garbage".to_vec()]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::Decode { index: 1, .. })));
    }

    #[tokio::test]
    async fn test_slow_recognition_times_out_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir, Duration::from_millis(500), Duration::from_millis(50));

        let recognition = handle.recognize(png()).await;
        assert_eq!(recognition, Recognition::unknown());
    }

    #[tokio::test]
    async fn test_slow_enrollment_times_out_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir, Duration::from_millis(500), Duration::from_millis(50));

        let err = handle.enroll(request("ada", vec![png()])).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_timed_out_enrollment_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, store) =
            engine_with_store(&dir, Duration::from_millis(300), Duration::from_millis(50));

        let err = handle.enroll(request("ada", vec![png()])).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        // Let the engine finish the abandoned request.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(store.list_identities().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_engine_recognizes_as_unknown() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = EngineHandle {
            tx,
            timeout: Duration::from_secs(5),
        };

        assert_eq!(handle.recognize(png()).await, Recognition::unknown());
        let err = handle.enroll(request("ada", vec![png()])).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_full_queue_counts_against_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(&dir, Duration::from_millis(500), Duration::from_millis(50));

        // One request in flight plus four queued fills the channel.
        for _ in 0..5 {
            let handle = handle.clone();
            tokio::spawn(async move { handle.recognize(png()).await });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let recognition = handle.recognize(png()).await;
        assert_eq!(recognition, Recognition::unknown());
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
