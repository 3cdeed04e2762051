//! In-crate fakes for the model capabilities, the store and the clock.

use crate::attendance::Clock;
use crate::detector::FaceLocator;
use crate::liveness::LivenessGate;
use crate::model::ModelError;
use crate::recognizer::EmbeddingExtractor;
use crate::store::{AttendanceStore, InsertOutcome, StoreError};
use crate::types::{
    AttendanceLogEntry, AttendanceRecord, AttendanceStatus, BoundingBox, Embedding, EnrolledFace,
    Identity, IdentitySummary,
};
use chrono::{NaiveDate, NaiveDateTime};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// PNG-encoded solid-colour image.
pub fn solid_png(rgb: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(64, 48, Rgb(rgb));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Finds a face covering the centre of any image that is not pure black.
pub struct FakeLocator;

impl FaceLocator for FakeLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Option<BoundingBox>, ModelError> {
        if image.get_pixel(0, 0).0 == [0, 0, 0] {
            return Ok(None);
        }
        Ok(Some(BoundingBox {
            x: 8.0,
            y: 6.0,
            width: 32.0,
            height: 24.0,
            confidence: 0.99,
        }))
    }
}

pub struct FakeLiveness(pub f32);

impl LivenessGate for FakeLiveness {
    fn score(&mut self, _face: &RgbImage) -> Result<f32, ModelError> {
        Ok(self.0)
    }
}

/// Embedding = the crop's colour divided by 100, so distances are easy to pick.
pub struct FakeExtractor;

impl EmbeddingExtractor for FakeExtractor {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, ModelError> {
        let [r, g, b] = face.get_pixel(0, 0).0;
        Ok(Embedding::new(vec![r as f32 / 100.0, g as f32 / 100.0, b as f32 / 100.0]))
    }
}

pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

pub fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

#[derive(Default)]
pub struct MemoryStore {
    pub identities: Mutex<Vec<Identity>>,
    pub attendance: Mutex<Vec<AttendanceRecord>>,
    pub offline: AtomicBool,
}

impl MemoryStore {
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.attendance.lock().unwrap().clone()
    }

    pub fn identity(&self, id: &str) -> Option<Identity> {
        self.identities.lock().unwrap().iter().find(|i| i.id == id).cloned()
    }
}

impl AttendanceStore for MemoryStore {
    fn list_enrolled_embeddings(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        self.check()?;
        Ok(self
            .identities
            .lock()
            .unwrap()
            .iter()
            .filter_map(|i| {
                Some(EnrolledFace {
                    id: i.id.clone(),
                    full_name: i.full_name.clone(),
                    embedding: i.embedding.clone()?,
                })
            })
            .collect())
    }

    fn find_attendance(
        &self,
        identity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<AttendanceStatus>, StoreError> {
        self.check()?;
        Ok(self
            .attendance
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.identity_id == identity_id && r.day() == day)
            .map(|r| r.status))
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let mut rows = self.attendance.lock().unwrap();
        if let Some(existing) = rows
            .iter()
            .find(|r| r.identity_id == record.identity_id && r.day() == record.day())
        {
            return Ok(InsertOutcome::AlreadyRecorded(existing.status));
        }
        rows.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.identities.lock().unwrap();
        match rows.iter_mut().find(|i| i.id == identity.id) {
            Some(row) => *row = identity.clone(),
            None => rows.push(identity.clone()),
        }
        Ok(())
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        self.check()?;
        Ok(self
            .identities
            .lock()
            .unwrap()
            .iter()
            .rev()
            .map(|i| IdentitySummary {
                id: i.id.clone(),
                full_name: i.full_name.clone(),
                department: i.department.clone(),
                image_path: i.image_path.clone(),
                is_verified: i.embedding.is_some(),
            })
            .collect())
    }

    fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        self.check()?;
        let identities = self.identities.lock().unwrap();
        Ok(self
            .attendance
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .filter_map(|r| {
                let who = identities.iter().find(|i| i.id == r.identity_id)?;
                Some(AttendanceLogEntry {
                    identity_id: r.identity_id.clone(),
                    full_name: who.full_name.clone(),
                    department: who.department.clone(),
                    check_in_time: r.check_in_time,
                    confidence: r.confidence,
                    status: r.status,
                })
            })
            .collect())
    }
}

/// A store whose attendance lookup always misses, as if another recognition
/// committed between the lookup and the insert.
#[derive(Default)]
pub struct StaleReadStore(pub MemoryStore);

impl AttendanceStore for StaleReadStore {
    fn list_enrolled_embeddings(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        self.0.list_enrolled_embeddings()
    }

    fn find_attendance(
        &self,
        _identity_id: &str,
        _day: NaiveDate,
    ) -> Result<Option<AttendanceStatus>, StoreError> {
        Ok(None)
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        self.0.insert_attendance(record)
    }

    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.0.upsert_identity(identity)
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        self.0.list_identities()
    }

    fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        self.0.recent_attendance(limit)
    }
}
