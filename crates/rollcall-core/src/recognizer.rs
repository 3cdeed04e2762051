//! Identity embedding extraction via a FaceNet-style encoder.
//!
//! The face crop is resized to 160×160 and mapped from 0–255 to roughly
//! [-1, 1]. The encoder output is used as-is; every stored embedding must come
//! from the same model so the distance threshold stays meaningful.

use crate::model::{load_session, square_nchw, ModelError};
use crate::types::Embedding;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
/// Output dimension of the InceptionResnetV1 (VGGFace2) encoder.
pub const FACENET_EMBEDDING_DIM: usize = 512;

/// Turns a face crop into an identity embedding.
pub trait EmbeddingExtractor {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, ModelError>;
}

/// FaceNet encoder via ONNX Runtime.
pub struct FaceNetEncoder {
    session: Session,
}

impl FaceNetEncoder {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        Ok(Self {
            session: load_session(model_path, "facenet")?,
        })
    }
}

impl EmbeddingExtractor for FaceNetEncoder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, ModelError> {
        let input = preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

fn preprocess(face: &RgbImage) -> ndarray::Array4<f32> {
    square_nchw(face, FACENET_INPUT_SIZE, |_, v| (v - FACENET_MEAN) / FACENET_STD)
}
