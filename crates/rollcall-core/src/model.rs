//! Shared ONNX Runtime plumbing: session loading, face cropping and tensor layout.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}; place the exported ONNX file in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Open an ONNX session, failing early when the file is missing.
pub(crate) fn load_session(model_path: &str, kind: &str) -> Result<Session, ModelError> {
    if !Path::new(model_path).exists() {
        return Err(ModelError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        kind,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}

/// Decode an encoded image (JPEG, PNG, ...) into packed RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Cut the face region out of the frame. `None` when the box lies outside the image.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let rect = face.clip_to(image.width(), image.height())?;
    Some(imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image())
}

/// Resize to `size`×`size` (bilinear) and lay out as a 1×3×H×W tensor.
///
/// `normalize` receives the channel index (0=R, 1=G, 2=B) and the raw 0–255 value.
pub(crate) fn square_nchw(
    image: &RgbImage,
    size: u32,
    normalize: impl Fn(usize, f32) -> f32,
) -> Array4<f32> {
    let resized = if image.dimensions() == (size, size) {
        image.clone()
    } else {
        imageops::resize(image, size, size, FilterType::Triangle)
    };

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = normalize(c, pixel[c] as f32);
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_decode_rgb_rejects_garbage() {
        assert!(decode_rgb(b"definitely not an image").is_err());
    }

    #[test]
    fn test_crop_face_clamps_origin() {
        let image = RgbImage::from_pixel(40, 30, Rgb([10, 20, 30]));
        let face = BoundingBox { x: -5.0, y: -5.0, width: 20.0, height: 15.0, confidence: 0.9 };
        let crop = crop_face(&image, &face).unwrap();
        assert_eq!(crop.dimensions(), (15, 10));
    }

    #[test]
    fn test_crop_face_outside_image() {
        let image = RgbImage::new(40, 30);
        let face = BoundingBox { x: 50.0, y: 0.0, width: 20.0, height: 15.0, confidence: 0.9 };
        assert!(crop_face(&image, &face).is_none());
    }

    #[test]
    fn test_square_nchw_shape_and_channels() {
        let image = RgbImage::from_pixel(37, 53, Rgb([255, 0, 128]));
        let tensor = square_nchw(&image, 16, |_, v| v);
        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);
        assert_eq!(tensor[[0, 0, 7, 7]], 255.0);
        assert_eq!(tensor[[0, 1, 7, 7]], 0.0);
        assert_eq!(tensor[[0, 2, 7, 7]], 128.0);
    }

    #[test]
    fn test_square_nchw_passes_channel_index() {
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]));
        let tensor = square_nchw(&image, 4, |c, v| v + c as f32 * 10.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 11.0);
        assert_eq!(tensor[[0, 2, 0, 0]], 21.0);
    }
}
