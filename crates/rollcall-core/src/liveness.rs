//! Anti-spoofing gate.
//!
//! A binary real-vs-spoof classifier scores the face crop; anything below the
//! threshold is rejected outright. There is no retry and no soft fallback.

use crate::model::{load_session, square_nchw, ModelError};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;

const LIVENESS_INPUT_SIZE: u32 = 224;
// ImageNet statistics, applied to 0–1 scaled channels.
const LIVENESS_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const LIVENESS_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Default realness threshold: scores below it are spoofs.
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;

/// Scores how likely a face crop is a live person (1.0) rather than a spoof (0.0).
pub trait LivenessGate {
    fn score(&mut self, face: &RgbImage) -> Result<f32, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessVerdict {
    Real,
    Spoof,
}

impl LivenessVerdict {
    pub fn from_score(score: f32, threshold: f32) -> Self {
        if score < threshold {
            LivenessVerdict::Spoof
        } else {
            LivenessVerdict::Real
        }
    }
}

/// MobileNetV2-backbone classifier with a sigmoid head, exported to ONNX.
pub struct OnnxLivenessClassifier {
    session: Session,
}

impl OnnxLivenessClassifier {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        Ok(Self {
            session: load_session(model_path, "liveness")?,
        })
    }
}

impl LivenessGate for OnnxLivenessClassifier {
    fn score(&mut self, face: &RgbImage) -> Result<f32, ModelError> {
        let input = preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("liveness score: {e}")))?;

        let score = raw
            .first()
            .copied()
            .ok_or_else(|| ModelError::InferenceFailed("liveness model returned no score".into()))?;

        tracing::debug!(score, "liveness scored");
        Ok(score)
    }
}

fn preprocess(face: &RgbImage) -> ndarray::Array4<f32> {
    square_nchw(face, LIVENESS_INPUT_SIZE, |c, v| {
        (v / 255.0 - LIVENESS_MEAN[c]) / LIVENESS_STD[c]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_verdict_threshold_is_inclusive_for_real() {
        assert_eq!(LivenessVerdict::from_score(0.5, 0.5), LivenessVerdict::Real);
        assert_eq!(LivenessVerdict::from_score(0.4999, 0.5), LivenessVerdict::Spoof);
        assert_eq!(LivenessVerdict::from_score(0.97, 0.5), LivenessVerdict::Real);
        assert_eq!(LivenessVerdict::from_score(0.0, 0.5), LivenessVerdict::Spoof);
    }

    #[test]
    fn test_preprocess_shape() {
        let face = RgbImage::from_pixel(90, 120, Rgb([128, 128, 128]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn test_preprocess_imagenet_normalization() {
        let face = RgbImage::from_pixel(224, 224, Rgb([255, 0, 128]));
        let tensor = preprocess(&face);
        let r = tensor[[0, 0, 10, 10]];
        let g = tensor[[0, 1, 10, 10]];
        let b = tensor[[0, 2, 10, 10]];
        assert!((r - (1.0 - 0.485) / 0.229).abs() < 1e-5, "r = {r}");
        assert!((g - (0.0 - 0.456) / 0.224).abs() < 1e-5, "g = {g}");
        assert!((b - (128.0 / 255.0 - 0.406) / 0.225).abs() < 1e-5, "b = {b}");
    }
}
