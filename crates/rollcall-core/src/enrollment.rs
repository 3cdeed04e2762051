//! Enrollment: many photos of one person in, one averaged embedding out.
//!
//! Every image is decoded and archived under the identity's raw-face folder.
//! Images without a usable face are skipped and counted; the stored embedding
//! is the component-wise mean over the remaining ones.

use crate::detector::FaceLocator;
use crate::model::{crop_face, decode_rgb, ModelError};
use crate::recognizer::EmbeddingExtractor;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{Embedding, Identity};
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("identity id must be non-empty and use only a-z, 0-9, '.', '_' or '-'")]
    InvalidId,
    #[error("enrollment abandoned by the caller before it was stored")]
    Abandoned,
    #[error("image {index} could not be decoded: {source}")]
    Decode {
        index: usize,
        #[source]
        source: image::ImageError,
    },
    #[error("no usable face found in {images} image(s)")]
    NoUsableFace { images: usize },
    #[error("could not create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not save {}: {source}", path.display())]
    SaveImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Enrollment input: identity metadata plus encoded photos.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub id: String,
    pub full_name: String,
    pub department: String,
    pub images: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollOutcome {
    pub identity_id: String,
    /// Images that contributed to the averaged embedding.
    pub used: usize,
    /// Images dropped because no face could be located.
    pub skipped: usize,
    pub image_dir: PathBuf,
}

/// Trim and lowercase an identity id. `None` unless the result is a single
/// safe path component: `[a-z0-9._-]+`, and neither `.` nor `..`.
pub fn normalize_id(raw: &str) -> Option<String> {
    let id = raw.trim().to_lowercase();
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-');
    let valid = !id.is_empty() && id != "." && id != ".." && id.chars().all(allowed);
    valid.then_some(id)
}

/// On-disk archive of enrollment photos: `<root>/raw_faces/<id>/<id>_<n>.jpg`.
#[derive(Debug, Clone)]
pub struct RawFaceStorage {
    root: PathBuf,
}

impl RawFaceStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn identity_dir(&self, id: &str) -> PathBuf {
        self.root.join("raw_faces").join(id)
    }

    fn prepare(&self, id: &str) -> Result<PathBuf, EnrollError> {
        let dir = self.identity_dir(id);
        std::fs::create_dir_all(&dir).map_err(|source| EnrollError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    fn save(&self, dir: &Path, id: &str, ordinal: usize, image: &RgbImage) -> Result<PathBuf, EnrollError> {
        let path = dir.join(format!("{id}_{ordinal}.jpg"));
        image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| EnrollError::SaveImage {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Builds one representative embedding per identity from a batch of photos.
pub struct EnrollmentAggregator<'m> {
    locator: &'m mut dyn FaceLocator,
    extractor: &'m mut dyn EmbeddingExtractor,
}

impl<'m> EnrollmentAggregator<'m> {
    pub fn new(locator: &'m mut dyn FaceLocator, extractor: &'m mut dyn EmbeddingExtractor) -> Self {
        Self { locator, extractor }
    }

    /// Enroll or re-enroll an identity. Nothing is written to the store unless
    /// at least one image yields a face.
    pub fn enroll(
        &mut self,
        store: &dyn AttendanceStore,
        storage: &RawFaceStorage,
        request: &EnrollRequest,
    ) -> Result<EnrollOutcome, EnrollError> {
        self.enroll_unless(store, storage, request, &|| false)
    }

    /// Like [`enroll`](Self::enroll), but returns [`EnrollError::Abandoned`]
    /// without touching the store if `abandoned()` holds once the embedding is ready.
    pub fn enroll_unless(
        &mut self,
        store: &dyn AttendanceStore,
        storage: &RawFaceStorage,
        request: &EnrollRequest,
        abandoned: &dyn Fn() -> bool,
    ) -> Result<EnrollOutcome, EnrollError> {
        let id = normalize_id(&request.id).ok_or(EnrollError::InvalidId)?;
        let dir = storage.prepare(&id)?;

        let mut samples = Vec::with_capacity(request.images.len());
        for (index, bytes) in request.images.iter().enumerate() {
            let image = decode_rgb(bytes).map_err(|source| EnrollError::Decode { index, source })?;
            storage.save(&dir, &id, index + 1, &image)?;

            match self.sample(&image)? {
                Some(embedding) => samples.push(embedding),
                None => tracing::debug!(id = %id, index, "enroll: no usable face, image skipped"),
            }
        }

        if samples.is_empty() {
            return Err(EnrollError::NoUsableFace {
                images: request.images.len(),
            });
        }

        let embedding = Embedding::mean(&samples).ok_or_else(|| {
            ModelError::InferenceFailed("encoder returned embeddings of differing dimensions".into())
        })?;

        if abandoned() {
            tracing::warn!(id = %id, "enrollment abandoned; store left unchanged");
            return Err(EnrollError::Abandoned);
        }

        store.upsert_identity(&Identity {
            id: id.clone(),
            full_name: request.full_name.clone(),
            department: request.department.clone(),
            image_path: dir.to_string_lossy().into_owned(),
            embedding: Some(embedding),
        })?;

        let outcome = EnrollOutcome {
            identity_id: id,
            used: samples.len(),
            skipped: request.images.len() - samples.len(),
            image_dir: dir,
        };
        tracing::info!(
            id = %outcome.identity_id,
            used = outcome.used,
            skipped = outcome.skipped,
            "identity enrolled"
        );
        Ok(outcome)
    }

    fn sample(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ModelError> {
        let Some(face) = self.locator.locate(image)? else {
            return Ok(None);
        };
        let Some(crop) = crop_face(image, &face) else {
            return Ok(None);
        };
        self.extractor.embed(&crop).map(Some)
    }
}
