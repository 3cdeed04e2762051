//! Face location.
//!
//! [`FaceLocator`] is the capability the pipeline consumes. [`ScrfdDetector`]
//! backs it with an SCRFD model: letterboxed RGB input, three-stride anchor
//! decoding and non-maximum suppression. Only the most confident face is
//! returned; the pipeline assumes single-subject capture.

use crate::model::{load_session, ModelError};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default minimum detection confidence.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Finds the primary face in an RGB image.
pub trait FaceLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ModelError>;
}

/// Scale and offset applied when fitting the frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let pad_x = ((SCRFD_INPUT_SIZE as u32 - new_w) / 2) as f32;
        let pad_y = ((SCRFD_INPUT_SIZE as u32 - new_h) / 2) as f32;
        (Self { scale, pad_x, pad_y }, new_w, new_h)
    }

    /// Map a point in model-input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    min_confidence: f32,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, min_confidence: f32) -> Result<Self, ModelError> {
        let session = load_session(model_path, "scrfd")?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(ModelError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let outputs = output_layout(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");

        Ok(Self {
            session,
            min_confidence,
            outputs,
        })
    }

    /// All detections above the confidence floor, most confident first.
    pub fn detect_all(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let slots = self.outputs[level];
            let (_, scores) = outputs[slots.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, distances) = outputs[slots.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_level(scores, distances, stride, &letterbox, self.min_confidence));
        }

        Ok(suppress(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceLocator for ScrfdDetector {
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ModelError> {
        let faces = self.detect_all(image)?;
        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), "multiple faces detected; using the most confident");
        }
        Ok(faces.into_iter().next())
    }
}

/// Letterbox the frame into the 640×640 input and normalize.
///
/// Padding uses the mean value so it normalizes to zero.
fn letterbox_tensor(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height());
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let off_x = letterbox.pad_x as usize;
    let off_y = letterbox.pad_y as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, off_y + y as usize, off_x + x as usize]] =
                (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output names to stride slots.
///
/// Exports either name their tensors `score_8`, `bbox_16`, ... or use numeric
/// names with scores first, then boxes, then keypoints.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
            })
        })
        .collect();

    match named {
        Some(levels) => [levels[0], levels[1], levels[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized; using positional layout");
            std::array::from_fn(|i| StrideOutputs { score: i, bbox: i + 3 })
        }
    }
}

/// Decode anchor-free distance predictions for one stride level.
fn decode_level(
    scores: &[f32],
    distances: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    min_confidence: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_w * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score >= min_confidence)
        .filter_map(|(idx, &score)| {
            let d = distances.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn suppress(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
