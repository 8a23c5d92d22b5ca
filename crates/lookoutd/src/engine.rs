use crate::collaborators::CaseProvider;
use crate::store::{RepresentationRef, RepresentationStore, StoreError};
use image::RgbImage;
use lookout_core::{crop, BoundingBox, CaseId, FaceCrop, FaceDetect, GalleryEntry, Matcher};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("no face detected in reference image")]
    NoFaceDetected,
    #[error("case {0} is not active")]
    CaseNotActive(CaseId),
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RegisterError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rejected(case) => RegisterError::CaseNotActive(case),
            other => RegisterError::Store(other),
        }
    }
}

/// Best match for a frame, at or above the similarity threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub case_id: CaseId,
    pub similarity: f32,
}

/// Detection, crop extraction, cache access and ranking for both call paths:
/// registering a reference photo and matching a submitted frame.
pub struct MatchingEngine {
    detector: Box<dyn FaceDetect>,
    matcher: Box<dyn Matcher>,
    store: Arc<RepresentationStore>,
    cases: Arc<dyn CaseProvider>,
    threshold: f32,
}

impl MatchingEngine {
    pub fn new(
        detector: Box<dyn FaceDetect>,
        matcher: Box<dyn Matcher>,
        store: Arc<RepresentationStore>,
        cases: Arc<dyn CaseProvider>,
        threshold: f32,
    ) -> Self {
        Self { detector, matcher, store, cases, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn store(&self) -> &Arc<RepresentationStore> {
        &self.store
    }

    /// Run the detector, degrading any failure to "no faces".
    fn detect_faces(&self, image: &RgbImage) -> Vec<BoundingBox> {
        match self.detector.detect(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    width = image.width(),
                    height = image.height(),
                    "face detection failed; treating as no faces"
                );
                Vec::new()
            }
        }
    }

    /// First detected face, cropped. Additional faces are ignored.
    fn first_face(&self, image: &RgbImage) -> Option<FaceCrop> {
        let faces = self.detect_faces(image);
        let face = faces.first()?;
        tracing::debug!(faces = faces.len(), confidence = face.confidence, "using first detected face");
        crop::extract(image, face)
    }

    /// Register a reference photo for an active case.
    pub fn register(&self, image: &RgbImage, case_id: &CaseId) -> Result<RepresentationRef, RegisterError> {
        if !self.cases.is_active(case_id) {
            return Err(RegisterError::CaseNotActive(case_id.clone()));
        }

        let face = self.first_face(image).ok_or(RegisterError::NoFaceDetected)?;

        // Re-checked under the store's exclusive section: a close that lands
        // after this point purges the new entry, one before it rejects it.
        let reference = self
            .store
            .append_if(case_id, &face, || self.cases.is_active(case_id))?;

        tracing::info!(
            case_id = %case_id,
            reference = %reference,
            width = face.width(),
            height = face.height(),
            "reference face registered"
        );
        Ok(reference)
    }

    /// Match the first face of `image` against every active case.
    pub fn match_image(&self, image: &RgbImage) -> Option<MatchOutcome> {
        let Some(query) = self.first_face(image) else {
            tracing::debug!("no face in frame");
            return None;
        };

        let gallery = self.gallery();
        let result = self.matcher.compare(&query, &gallery, self.threshold);

        match result.case_id {
            Some(case_id) if result.matched => {
                tracing::info!(case_id = %case_id, similarity = result.similarity, "match found");
                Some(MatchOutcome { case_id, similarity: result.similarity })
            }
            _ => {
                tracing::debug!(
                    best_similarity = result.similarity,
                    threshold = self.threshold,
                    candidates = gallery.len(),
                    "no match above threshold"
                );
                None
            }
        }
    }

    /// Stored crops of every active case, in case enumeration order.
    fn gallery(&self) -> Vec<GalleryEntry> {
        let mut gallery = Vec::new();
        for case_id in self.cases.active_case_ids() {
            for reference in self.store.entries_for(&case_id) {
                if let Some(crop) = self.store.load_representation(&reference) {
                    gallery.push(GalleryEntry { case_id: case_id.clone(), crop });
                }
            }
        }
        gallery
    }
}
