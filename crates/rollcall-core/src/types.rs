use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A detected face in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Integer pixel rectangle that lies fully inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Bounding box expressed as a percentage (0–100) of the image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    /// Clip the box to an image of the given size.
    ///
    /// The origin is clamped to zero and the far edge to the image border.
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clip_to(&self, image_width: u32, image_height: u32) -> Option<PixelRect> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(image_width as f32).floor();
        let y1 = (self.y + self.height).min(image_height as f32).floor();

        if !(x1 > x0 && y1 > y0) {
            return None;
        }

        Some(PixelRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Express the box relative to the image size, for display-resolution independence.
    pub fn to_percent(&self, image_width: u32, image_height: u32) -> PercentRect {
        let w = image_width.max(1) as f32;
        let h = image_height.max(1) as f32;
        PercentRect {
            x: self.x / w * 100.0,
            y: self.y / h * 100.0,
            w: self.width / w * 100.0,
            h: self.height / h * 100.0,
        }
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Identity embedding produced by the face encoder (512-d for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to another embedding of the same dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Component-wise arithmetic mean.
    ///
    /// Returns `None` for an empty slice or when dimensions disagree.
    pub fn mean(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.dim();
        if samples.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut sum = vec![0.0f32; dim];
        for sample in samples {
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }

        let n = samples.len() as f32;
        Some(Embedding::new(sum.into_iter().map(|v| v / n).collect()))
    }

    /// Little-endian `f32` byte encoding, used for blob storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Embedding> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Embedding::new(values))
    }
}

/// An enrolled person. `embedding: None` means registered but not face-verified.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub full_name: String,
    pub department: String,
    pub image_path: String,
    pub embedding: Option<Embedding>,
}

/// Gallery entry consumed by the matcher.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub id: String,
    pub full_name: String,
    pub embedding: Embedding,
}

/// Listing row for enrolled identities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub full_name: String,
    pub department: String,
    pub image_path: String,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Success,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Success => "Success",
            AttendanceStatus::Late => "Late",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Success" => Some(AttendanceStatus::Success),
            "Late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }
}

/// One check-in. At most one exists per identity and calendar day.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub check_in_time: NaiveDateTime,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

impl AttendanceRecord {
    pub fn day(&self) -> NaiveDate {
        self.check_in_time.date()
    }
}

/// Attendance log row joined with identity details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceLogEntry {
    pub identity_id: String,
    pub full_name: String,
    pub department: String,
    pub check_in_time: NaiveDateTime,
    pub confidence: f32,
    pub status: AttendanceStatus,
}
