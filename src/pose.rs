use crate::error::Error;
use num_traits::FromPrimitive;
use serde::Deserialize;
use std::convert::TryFrom;

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub(crate) enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointKind {
    #[cfg(any(feature = "gui", test))]
    pub(crate) fn idx(self) -> Result<usize, Error> {
        num_traits::ToPrimitive::to_usize(&self).ok_or(Error::KeypointVariantToUSize(self))
    }

    pub(crate) fn from_idx(index: usize) -> Result<Self, Error> {
        Self::from_usize(index).ok_or(Error::ConvertUSizeToKeypointKind(index))
    }
}

pub(crate) const NUM_KEYPOINTS: usize = 17;

/// One joint of a detected person, in coordinates normalized to the frame size.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct Keypoint {
    pub(crate) kind: KeypointKind,
    pub(crate) x: f32,
    pub(crate) y: f32,
    pub(crate) score: f32,
}

pub(crate) type Keypoints = [Keypoint; NUM_KEYPOINTS];

/// A single person as reported by the pose detector.
///
/// The keypoints are always stored in [`KeypointKind`] order.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct PersonDetection {
    pub(crate) keypoints: Keypoints,
    pub(crate) score: f32,
}

/// The detector's wire representation of a person: a box score plus one
/// `[x, y, confidence]` triple per joint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawPerson {
    pub(crate) score: f32,
    pub(crate) keypoints: Vec<[f32; 3]>,
}

impl TryFrom<RawPerson> for PersonDetection {
    type Error = Error;

    fn try_from(raw: RawPerson) -> Result<Self, Self::Error> {
        if raw.keypoints.len() != NUM_KEYPOINTS {
            return Err(Error::KeypointCount(raw.keypoints.len()));
        }

        let mut keypoints = [Keypoint {
            kind: KeypointKind::Nose,
            x: 0.0,
            y: 0.0,
            score: 0.0,
        }; NUM_KEYPOINTS];

        for (i, (slot, &[x, y, score])) in keypoints.iter_mut().zip(&raw.keypoints).enumerate() {
            let kind = KeypointKind::from_idx(i)?;
            // the sentinel must stay the only way a coordinate leaves [0, 1]
            if !(in_frame(x) && in_frame(y)) {
                return Err(Error::KeypointRange(kind, x, y));
            }
            *slot = Keypoint {
                kind,
                x,
                y,
                score,
            };
        }

        Ok(Self {
            keypoints,
            score: raw.score,
        })
    }
}

fn in_frame(coordinate: f32) -> bool {
    (0.0..=1.0).contains(&coordinate)
}

#[cfg(feature = "gui")]
pub(crate) mod constants {
    use crate::pose::KeypointKind::{self, *};

    pub(crate) const KEYPOINT_EDGES: [(KeypointKind, KeypointKind); 19] = [
        (Nose, LeftEye),
        (Nose, RightEye),
        (Nose, LeftEar),
        (Nose, RightEar),
        (LeftEar, LeftEye),
        (RightEar, RightEye),
        (LeftEye, RightEye),
        (LeftShoulder, RightShoulder),
        (LeftShoulder, LeftElbow),
        (LeftShoulder, LeftHip),
        (RightShoulder, RightElbow),
        (RightShoulder, RightHip),
        (LeftElbow, LeftWrist),
        (RightElbow, RightWrist),
        (LeftHip, RightHip),
        (LeftHip, LeftKnee),
        (RightHip, RightKnee),
        (LeftKnee, LeftAnkle),
        (RightKnee, RightAnkle),
    ];
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a detection whose every joint sits at `(0.5, 0.25)` with `joint_score`.
    pub(crate) fn uniform_person(score: f32, joint_score: f32) -> PersonDetection {
        PersonDetection::try_from(RawPerson {
            score,
            keypoints: vec![[0.5, 0.25, joint_score]; NUM_KEYPOINTS],
        })
        .unwrap()
    }

    mod keypoint_kind_tests {
        use super::*;

        #[test]
        fn indices_cover_all_joints() {
            assert_eq!(KeypointKind::from_idx(0).unwrap(), KeypointKind::Nose);
            assert_eq!(
                KeypointKind::from_idx(NUM_KEYPOINTS - 1).unwrap(),
                KeypointKind::RightAnkle
            );
            assert!(KeypointKind::from_idx(NUM_KEYPOINTS).is_err());
        }

        #[test]
        fn round_trips_through_index() {
            for i in 0..NUM_KEYPOINTS {
                assert_eq!(KeypointKind::from_idx(i).unwrap().idx().unwrap(), i);
            }
        }
    }

    mod raw_person_tests {
        use super::*;

        #[test]
        fn keeps_joint_order() {
            let keypoints = (0..NUM_KEYPOINTS)
                .map(|i| [i as f32 / 100.0, 0.5, 0.9])
                .collect();
            let person = PersonDetection::try_from(RawPerson {
                score: 0.8,
                keypoints,
            })
            .unwrap();
            assert_eq!(person.keypoints[3].kind, KeypointKind::LeftEar);
            assert_eq!(person.keypoints[3].x, 0.03);
            assert_eq!(person.score, 0.8);
        }

        #[test]
        fn rejects_wrong_joint_count() {
            let err = PersonDetection::try_from(RawPerson {
                score: 0.8,
                keypoints: vec![[0.0, 0.0, 1.0]; 16],
            })
            .unwrap_err();
            assert!(matches!(err, Error::KeypointCount(16)));
        }

        #[test]
        fn rejects_coordinates_outside_the_frame() {
            let mut keypoints = vec![[0.5, 0.5, 0.9]; NUM_KEYPOINTS];
            keypoints[4] = [-1.0, -1.0, 0.99];
            let err = PersonDetection::try_from(RawPerson {
                score: 0.95,
                keypoints: keypoints.clone(),
            })
            .unwrap_err();
            assert!(matches!(
                err,
                Error::KeypointRange(KeypointKind::RightEar, x, y) if x == -1.0 && y == -1.0
            ));

            keypoints[4] = [0.5, 0.5, 0.99];
            keypoints[5] = [-0.3, 1.7, 0.99];
            let err = PersonDetection::try_from(RawPerson {
                score: 0.95,
                keypoints: keypoints.clone(),
            })
            .unwrap_err();
            assert!(matches!(err, Error::KeypointRange(KeypointKind::LeftShoulder, _, _)));

            keypoints[5] = [f32::NAN, 0.5, 0.99];
            let err = PersonDetection::try_from(RawPerson {
                score: 0.95,
                keypoints,
            })
            .unwrap_err();
            assert!(matches!(err, Error::KeypointRange(KeypointKind::LeftShoulder, _, _)));
        }

        #[test]
        fn frame_edges_are_inside() {
            let mut keypoints = vec![[0.0, 1.0, 0.9]; NUM_KEYPOINTS];
            keypoints[0] = [1.0, 0.0, 0.1];
            assert!(PersonDetection::try_from(RawPerson {
                score: 0.8,
                keypoints,
            })
            .is_ok());
        }
    }
}
