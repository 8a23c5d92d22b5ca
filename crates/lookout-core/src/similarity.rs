//! Histogram-correlation similarity between face crops.
//!
//! Both crops are resized to a canonical 100×100, reduced to a single luma
//! channel and summarised as a 256-bin intensity histogram. The Pearson
//! correlation of the two histograms lies in [-1, 1] and is remapped to
//! [0, 1] so that 1 means identical intensity distributions.

use crate::crop::FaceCrop;
use image::imageops::{self, FilterType};

const CANONICAL_SIZE: u32 = 100;
const HISTOGRAM_BINS: usize = 256;

/// Precomputed histogram of a crop. Lets a query be reduced once and scored
/// against many stored crops.
#[derive(Debug, Clone)]
pub struct Signature {
    /// `None` for an empty crop, which scores 0 against everything.
    histogram: Option<[f64; HISTOGRAM_BINS]>,
}

impl Signature {
    pub fn of(crop: &FaceCrop) -> Self {
        if crop.is_empty() {
            return Self { histogram: None };
        }

        let resized = imageops::resize(crop.image(), CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle);
        let luma = imageops::grayscale(&resized);

        let mut histogram = [0.0f64; HISTOGRAM_BINS];
        for p in luma.pixels() {
            histogram[p.0[0] as usize] += 1.0;
        }
        Self { histogram: Some(histogram) }
    }

    /// Similarity in [0, 1]. Degenerate signatures score 0.
    pub fn score(&self, other: &Signature) -> f32 {
        match (&self.histogram, &other.histogram) {
            (Some(a), Some(b)) => match correlation(a, b) {
                Some(c) => (((c + 1.0) / 2.0) as f32).clamp(0.0, 1.0),
                None => 0.0,
            },
            _ => 0.0,
        }
    }
}

/// Pearson correlation of two histograms. `None` when either has zero variance.
fn correlation(a: &[f64; HISTOGRAM_BINS], b: &[f64; HISTOGRAM_BINS]) -> Option<f64> {
    let n = HISTOGRAM_BINS as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        num += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom > f64::EPSILON && denom.is_finite() {
        Some(num / denom)
    } else {
        None
    }
}

/// Similarity of two face crops, in [0, 1].
pub fn score(a: &FaceCrop, b: &FaceCrop) -> f32 {
    Signature::of(a).score(&Signature::of(b))
}
