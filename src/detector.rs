use crate::{
    error::Error,
    pose::{PersonDetection, RawPerson},
    video::Frame,
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    convert::TryFrom,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use tracing::debug;

/// A pose model: given a frame, return every person it sees.
///
/// Finding nobody is not an error; implementations return an empty `Vec`.
pub(crate) trait PoseDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<PersonDetection>, Error>;
}

#[derive(Debug, Deserialize)]
struct FrameRecord {
    frame: usize,
    #[serde(default)]
    people: Vec<RawPerson>,
}

/// Detections exported ahead of time by an external pose model, one JSON
/// object per line, keyed by frame index.
#[derive(Debug, Default)]
pub(crate) struct RecordedDetections {
    frames: HashMap<usize, Vec<PersonDetection>>,
}

impl RecordedDetections {
    pub(crate) fn open<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::OpenDetections(e, path.to_path_buf()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub(crate) fn from_reader<R>(reader: R) -> Result<Self, Error>
    where
        R: BufRead,
    {
        let mut frames = HashMap::new();

        for (i, line) in reader.lines().enumerate() {
            let line_number = i + 1;
            let line = line.map_err(|e| Error::ReadDetectionLine(e, line_number))?;
            if line.trim().is_empty() {
                continue;
            }

            let record: FrameRecord = serde_json::from_str(&line)
                .map_err(|e| Error::ParseDetectionLine(e, line_number))?;
            let people = record
                .people
                .into_iter()
                .map(PersonDetection::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| Error::InvalidPerson(Box::new(e), line_number))?;

            frames
                .entry(record.frame)
                .or_insert_with(Vec::new)
                .extend(people);
        }

        debug!(message = "loaded recorded detections", frames = frames.len());
        Ok(Self { frames })
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    /// Frame indices with recorded people, ascending.
    pub(crate) fn frame_indices(&self) -> Vec<usize> {
        let mut indices = self.frames.keys().copied().collect::<Vec<_>>();
        indices.sort_unstable();
        indices
    }

    pub(crate) fn people(&self, frame_index: usize) -> &[PersonDetection] {
        self.frames
            .get(&frame_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl PoseDetector for RecordedDetections {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<PersonDetection>, Error> {
        Ok(self.people(frame.index).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(frame: usize, score: f32) -> String {
        let keypoints = vec![[0.5, 0.5, 0.9]; crate::pose::NUM_KEYPOINTS];
        serde_json::json!({
            "frame": frame,
            "people": [{"score": score, "keypoints": keypoints}],
        })
        .to_string()
    }

    #[test]
    fn missing_frames_have_no_people() {
        let text = format!("{}\n\n{}\n", line(0, 0.9), line(3, 0.8));
        let mut detections = RecordedDetections::from_reader(text.as_bytes()).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections.frame_indices(), vec![0, 3]);

        let frame = Frame::empty(1);
        assert!(detections.detect(&frame).unwrap().is_empty());

        let frame = Frame::empty(3);
        let people = detections.detect(&frame).unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].score, 0.8);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let text = format!("{}\nnot json\n", line(0, 0.9));
        let err = RecordedDetections::from_reader(text.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::ParseDetectionLine(_, 2)));
    }

    #[test]
    fn short_person_is_rejected() {
        let text = r#"{"frame": 0, "people": [{"score": 0.9, "keypoints": [[0.1, 0.2, 0.9]]}]}"#;
        let err = RecordedDetections::from_reader(text.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidPerson(ref e, 1) if matches!(**e, Error::KeypointCount(1))));
    }

    #[test]
    fn off_frame_joint_reports_line_number() {
        let mut keypoints = vec![[0.5, 0.5, 0.9]; crate::pose::NUM_KEYPOINTS];
        keypoints[4] = [-1.0, -1.0, 0.99];
        keypoints[5] = [-0.3, 1.7, 0.99];
        let bad = serde_json::json!({
            "frame": 1,
            "people": [{"score": 0.95, "keypoints": keypoints}],
        });
        let text = format!("{}\n{}\n", line(0, 0.9), bad);
        let err = RecordedDetections::from_reader(text.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPerson(ref e, 2) if matches!(**e, Error::KeypointRange(..))
        ));
    }
}
