//! Face embedding models.
//!
//! The pipeline treats the embedding model as a black box behind
//! [`EmbeddingModel`]; [`MobileFaceNet`] is the ONNX Runtime backend.

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const MOBILEFACENET_INPUT_SIZE: usize = 112;
const MOBILEFACENET_MEAN: f32 = 127.5;
const MOBILEFACENET_STD: f32 = 128.0;
const MOBILEFACENET_EMBEDDING_DIM: usize = 192;
pub const MOBILEFACENET_MODEL_VERSION: &str = "mobilefacenet";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (place the MobileFaceNet ONNX export in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces one embedding vector per canonical face image.
pub trait EmbeddingModel: Send {
    /// Identifies the model that produced an embedding; stored with every
    /// record so embeddings from different models are never compared.
    fn model_version(&self) -> &str;

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError>;
}

/// MobileFaceNet-based face recognizer.
pub struct MobileFaceNet {
    session: Session,
}

impl MobileFaceNet {
    /// Load the MobileFaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded MobileFaceNet model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112x112 aligned face into a NCHW float tensor.
    ///
    /// Pixels outside the image (a smaller input) are left at zero.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = MOBILEFACENET_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - MOBILEFACENET_MEAN) / MOBILEFACENET_STD;
            }
        }

        tensor
    }
}

impl EmbeddingModel for MobileFaceNet {
    fn model_version(&self) -> &str {
        MOBILEFACENET_MODEL_VERSION
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != MOBILEFACENET_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {MOBILEFACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(l2_normalize(raw_data.to_vec()))
    }
}

/// L2-normalize a vector; a zero vector is returned unchanged.
pub fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
    values
}
