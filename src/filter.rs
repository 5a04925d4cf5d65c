use crate::{
    error::Error,
    pose::{PersonDetection, NUM_KEYPOINTS},
};
use ndarray::{s, Array1, Array2, ArrayView2};

pub(crate) const DEFAULT_DETECTION_THRESHOLD: &str = "0.7";
pub(crate) const DEFAULT_JOINT_THRESHOLD: &str = "0.5";

/// Placeholder written for both coordinates of a rejected joint.
pub(crate) const SENTINEL: f32 = -1.0;

/// Width of a flattened feature vector: one x and one y per joint.
pub(crate) const FEATURE_WIDTH: usize = 2 * NUM_KEYPOINTS;

/// The per-person feature: x coordinates followed by y coordinates, in joint order.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct FeatureVector {
    pub(crate) xs: [f32; NUM_KEYPOINTS],
    pub(crate) ys: [f32; NUM_KEYPOINTS],
}

impl FeatureVector {
    /// The on-disk layout: a 2 x 17 array with the x row first.
    pub(crate) fn to_record(&self) -> Array2<f64> {
        let mut record = Array2::zeros((2, NUM_KEYPOINTS));
        for (j, (&x, &y)) in self.xs.iter().zip(&self.ys).enumerate() {
            record[(0, j)] = f64::from(x);
            record[(1, j)] = f64::from(y);
        }
        record
    }

    pub(crate) fn from_record(record: ArrayView2<f64>) -> Result<Self, Error> {
        if record.dim() != (2, NUM_KEYPOINTS) {
            return Err(Error::RecordShape(record.shape().to_vec()));
        }
        let mut xs = [0.0; NUM_KEYPOINTS];
        let mut ys = [0.0; NUM_KEYPOINTS];
        for (dst, &src) in xs.iter_mut().zip(record.slice(s![0, ..])) {
            *dst = src as f32;
        }
        for (dst, &src) in ys.iter_mut().zip(record.slice(s![1, ..])) {
            *dst = src as f32;
        }
        Ok(Self { xs, ys })
    }

    /// Row-major flattening of the record, i.e. all xs then all ys.
    pub(crate) fn flatten(&self) -> Array1<f32> {
        self.xs.iter().chain(&self.ys).copied().collect()
    }

    pub(crate) fn sentinel_count(&self) -> usize {
        self.xs
            .iter()
            .zip(&self.ys)
            .filter(|&(&x, &y)| x == SENTINEL && y == SENTINEL)
            .count()
    }
}

/// Confidence gate between the pose detector and everything downstream.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct KeypointFilter {
    pub(crate) detection_threshold: f32,
    pub(crate) joint_threshold: f32,
}

impl Default for KeypointFilter {
    fn default() -> Self {
        Self {
            detection_threshold: DEFAULT_DETECTION_THRESHOLD.parse().unwrap(),
            joint_threshold: DEFAULT_JOINT_THRESHOLD.parse().unwrap(),
        }
    }
}

impl KeypointFilter {
    pub(crate) fn new(detection_threshold: f32, joint_threshold: f32) -> Self {
        Self {
            detection_threshold,
            joint_threshold,
        }
    }

    /// Emit one feature vector per person whose detection score clears the
    /// detection threshold, keeping input order.
    pub(crate) fn filter(&self, detections: &[PersonDetection]) -> Vec<FeatureVector> {
        detections
            .iter()
            .filter(|person| person.score >= self.detection_threshold)
            .map(|person| self.gate(person))
            .collect()
    }

    fn gate(&self, person: &PersonDetection) -> FeatureVector {
        let mut xs = [SENTINEL; NUM_KEYPOINTS];
        let mut ys = [SENTINEL; NUM_KEYPOINTS];
        for (j, keypoint) in person.keypoints.iter().enumerate() {
            if keypoint.score >= self.joint_threshold {
                xs[j] = keypoint.x;
                ys[j] = keypoint.y;
            }
        }
        FeatureVector { xs, ys }
    }
}
