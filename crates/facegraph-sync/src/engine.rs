use facegraph_core::config::SyncConfig;
use facegraph_core::pipeline::{FacePipeline, FaceProcessor, PipelineError, ProcessedFile};
use facegraph_core::types::FileId;
use facegraph_core::{BlazeFace, CancelFlag, MobileFaceNet};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] facegraph_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] facegraph_core::recognizer::RecognizerError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Process {
        file_id: FileId,
        image: RgbImage,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<ProcessedFile, EngineError>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    model_version: Arc<str>,
}

impl EngineHandle {
    /// Version tag of the embedding model the engine runs.
    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Run one decoded image through the pipeline.
    pub async fn process(
        &self,
        file_id: FileId,
        image: RgbImage,
        cancel: CancelFlag,
    ) -> Result<ProcessedFile, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Process {
                file_id,
                image,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Drop the models and stop the engine thread. Requests already queued
    /// ahead of this one are still served; later ones fail with
    /// [`EngineError::ChannelClosed`].
    pub async fn dispose(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Dispose { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously, so a missing or broken model fails
/// here rather than on the first file.
pub fn spawn_engine(
    blazeface_path: &str,
    mobilefacenet_path: &str,
    config: &SyncConfig,
) -> Result<EngineHandle, EngineError> {
    let detector = BlazeFace::load(blazeface_path, &config.detection)?;
    tracing::info!(path = blazeface_path, "BlazeFace detector loaded");

    let recognizer = MobileFaceNet::load(mobilefacenet_path)?;
    tracing::info!(path = mobilefacenet_path, "MobileFaceNet recognizer loaded");

    spawn_with_processor(Box::new(FacePipeline::new(detector, recognizer, config)))
}

/// Spawn the engine around an already-built processor.
pub fn spawn_with_processor(mut processor: Box<dyn FaceProcessor>) -> Result<EngineHandle, EngineError> {
    let model_version: Arc<str> = Arc::from(processor.model_version());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegraph-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Process {
                        file_id,
                        image,
                        cancel,
                        reply,
                    } => {
                        let result = processor
                            .process(&file_id, &image, &cancel)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Dispose { reply } => {
                        drop(processor);
                        tracing::info!("engine disposed");
                        let _ = reply.send(());
                        return;
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, model_version })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use facegraph_core::geometry::{BBox, Point};
    use facegraph_core::types::{FaceDetection, FaceRecord, FileFaces};
    use facegraph_core::FaceCrop;

    /// Deterministic processor: one face per file whose embedding is the
    /// image's mean colour. Files named `*fail*` error, `*slow*` sleep until
    /// cancelled.
    pub(crate) struct FakeProcessor;

    impl FaceProcessor for FakeProcessor {
        fn model_version(&self) -> &str {
            "fake-v1"
        }

        fn process(
            &mut self,
            file_id: &FileId,
            image: &RgbImage,
            cancel: &CancelFlag,
        ) -> Result<ProcessedFile, PipelineError> {
            if file_id.as_str().contains("fail") {
                return Err(PipelineError::Detector(
                    facegraph_core::DetectorError::InferenceFailed("fake failure".into()),
                ));
            }
            if file_id.as_str().contains("slow") {
                while !cancel.is_cancelled() {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                return Err(PipelineError::Cancelled);
            }

            let mut sum = [0.0f32; 3];
            for p in image.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            let n = (image.width() * image.height()).max(1) as f32;
            let embedding = sum.iter().map(|s| s / n + 1.0).collect();

            let bbox = BBox::new(0.0, 0.0, image.width() as f32, image.height() as f32);
            let record = FaceRecord {
                face_index: 0,
                detection: FaceDetection {
                    bbox,
                    landmarks: vec![Point::new(1.0, 1.0), Point::new(2.0, 1.0)],
                    probability: 0.99,
                },
                aligned_box: bbox,
                rotation: 0.0,
                crop_box: bbox,
                embedding,
            };
            Ok(ProcessedFile {
                faces: FileFaces {
                    file_id: file_id.clone(),
                    faces: vec![record],
                    model_version: self.model_version().to_string(),
                    processed_at: Utc::now(),
                },
                crops: vec![(
                    0,
                    FaceCrop {
                        image: image.clone(),
                        source_box: bbox,
                        rotation: 0.0,
                    },
                )],
            })
        }
    }

    #[tokio::test]
    async fn test_process_and_dispose() {
        let engine = spawn_with_processor(Box::new(FakeProcessor)).unwrap();
        assert_eq!(engine.model_version(), "fake-v1");

        let image = RgbImage::from_pixel(4, 4, image::Rgb([9, 19, 29]));
        let out = engine
            .process(FileId::new("a.jpg"), image, CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(out.faces.faces[0].embedding, vec![10.0, 20.0, 30.0]);

        let err = engine
            .process(FileId::new("fail.jpg"), RgbImage::new(1, 1), CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::Detector(_))));

        engine.dispose().await.unwrap();
        let err = engine
            .process(FileId::new("b.jpg"), RgbImage::new(1, 1), CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChannelClosed));
    }

    #[test]
    fn test_missing_models_fail_fast() {
        let err = spawn_engine("/nonexistent/blazeface.onnx", "/nonexistent/mfn.onnx", &SyncConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::Detector(facegraph_core::DetectorError::ModelNotFound(_))
        ));
    }
}
