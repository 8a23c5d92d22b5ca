use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crop::FaceCrop;
use crate::similarity::Signature;

/// Bounding box for a detected face, in source image pixel coordinates.
///
/// Coordinates come straight from the detector and may extend past the image
/// edges; [`crate::crop::extract`] clamps them before cropping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Identifier of a missing-person case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One stored representation offered to a [`Matcher`], tagged with its owning case.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub case_id: CaseId,
    pub crop: FaceCrop,
}

/// Result of matching a query crop against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Similarity of the best candidate, in [0, 1]. 0 for an empty gallery.
    pub similarity: f32,
    /// Case owning the best candidate, set only when `matched`.
    pub case_id: Option<CaseId>,
}

impl MatchResult {
    fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            case_id: None,
        }
    }
}

/// Strategy for ranking a query crop against the stored representations of
/// every candidate case.
///
/// The brute-force [`LinearScanMatcher`] is the only implementation; an
/// indexed nearest-neighbour structure can replace it behind this trait once
/// the active-case cap grows.
pub trait Matcher: Send + Sync {
    fn compare(&self, query: &FaceCrop, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Scores the query against every gallery entry and keeps the maximum.
///
/// Ties keep the entry encountered first. A best similarity equal to the
/// threshold counts as a match.
pub struct LinearScanMatcher;

impl Matcher for LinearScanMatcher {
    fn compare(&self, query: &FaceCrop, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let query_sig = Signature::of(query);
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let sim = query_sig.score(&Signature::of(&entry.crop));
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                case_id: Some(gallery[idx].case_id.clone()),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn striped(seed: u8) -> FaceCrop {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            let v = ((x * 3 + y * 5) as u8).wrapping_mul(seed);
            Rgb([v, v / 2, 255 - v])
        });
        FaceCrop::from_image(img)
    }

    fn flat(level: u8) -> FaceCrop {
        let img = RgbImage::from_fn(40, 40, |x, _| Rgb([level.saturating_add((x % 2) as u8); 3]));
        FaceCrop::from_image(img)
    }

    fn entry(case: &str, crop: FaceCrop) -> GalleryEntry {
        GalleryEntry { case_id: CaseId::from(case), crop }
    }

    #[test]
    fn test_linear_scan_finds_best_anywhere() {
        // Best match is the last entry: every entry must be visited.
        let query = striped(7);
        let gallery = vec![
            entry("decoy1", flat(10)),
            entry("decoy2", flat(200)),
            entry("match", striped(7)),
        ];

        let result = LinearScanMatcher.compare(&query, &gallery, 0.6);
        assert!(result.matched);
        assert_eq!(result.case_id, Some(CaseId::from("match")));
        assert!((result.similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_linear_scan_below_threshold() {
        let query = striped(7);
        let gallery = vec![entry("other", flat(10))];

        let result = LinearScanMatcher.compare(&query, &gallery, 0.99);
        assert!(!result.matched);
        assert!(result.case_id.is_none());
        assert!(result.similarity < 0.99);
    }

    #[test]
    fn test_linear_scan_threshold_boundary_is_a_match() {
        let query = striped(3);
        let candidate = striped(11);
        let exact = Signature::of(&query).score(&Signature::of(&candidate));

        let result = LinearScanMatcher.compare(&query, &[entry("c1", candidate)], exact);
        assert!(result.matched, "similarity equal to threshold must match");
        assert_eq!(result.similarity, exact);
    }

    #[test]
    fn test_linear_scan_tie_keeps_first() {
        let query = striped(5);
        let gallery = vec![entry("first", striped(5)), entry("second", striped(5))];

        let result = LinearScanMatcher.compare(&query, &gallery, 0.5);
        assert_eq!(result.case_id, Some(CaseId::from("first")));
    }

    #[test]
    fn test_linear_scan_empty_gallery() {
        let result = LinearScanMatcher.compare(&striped(5), &[], 0.5);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }
}
