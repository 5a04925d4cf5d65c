use std::{path::PathBuf, process::ExitStatus};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("failed to convert usize value to keypoint kind: {0}")]
    ConvertUSizeToKeypointKind(usize),

    #[cfg(any(feature = "gui", test))]
    #[error("failed to convert keypoint variant to usize: {0:?}")]
    KeypointVariantToUSize(crate::pose::KeypointKind),

    #[error("expected {} keypoints per person, got {0}", crate::pose::NUM_KEYPOINTS)]
    KeypointCount(usize),

    #[error("{0:?} at ({1}, {2}) is outside the frame")]
    KeypointRange(crate::pose::KeypointKind, f32, f32),

    #[error("failed to convert value to f32")]
    ConvertToF32,

    #[error("failed to convert value to f64")]
    ConvertToF64,

    #[error("failed to convert value to usize")]
    ConvertToUSize,

    #[error("failed to construct NotNan from f32: {1}")]
    ConstructNotNan(#[source] ordered_float::FloatIsNan, f32),

    #[error("cannot take the arg-max of zero scores")]
    EmptyScores,

    #[error("failed to open detections file: {1:?}")]
    OpenDetections(#[source] std::io::Error, PathBuf),

    #[error("failed to read detections line {1}")]
    ReadDetectionLine(#[source] std::io::Error, usize),

    #[error("failed to parse detections line {1}")]
    ParseDetectionLine(#[source] serde_json::Error, usize),

    #[error("invalid person on detections line {1}")]
    InvalidPerson(#[source] Box<Error>, usize),

    #[error("invalid label directory name: {0:?}")]
    InvalidLabel(String),

    #[error("label directory name is not valid unicode: {0:?}")]
    LabelDirName(PathBuf),

    #[error("failed to create corpus directory: {1:?}")]
    CreateCorpusDir(#[source] std::io::Error, PathBuf),

    #[error("failed to read corpus directory: {1:?}")]
    ReadCorpusDir(#[source] std::io::Error, PathBuf),

    #[error("failed to write sample: {1:?}")]
    WriteSample(#[source] std::io::Error, PathBuf),

    #[error("failed to encode sample: {1:?}")]
    EncodeSample(#[source] ndarray_npy::WriteNpyError, PathBuf),

    #[error("failed to read sample: {1:?}")]
    ReadSample(#[source] ndarray_npy::ReadNpyError, PathBuf),

    #[error("expected a 2x{} record, got shape {0:?}", crate::pose::NUM_KEYPOINTS)]
    RecordShape(Vec<usize>),

    #[error("failed to reshape record")]
    ReshapeRecord(#[source] ndarray::ShapeError),

    #[error("label {0} is not known to the encoder")]
    UnknownLabel(crate::store::Label),

    #[error("feature scale must be finite and non-zero, got {0}")]
    FeatureScale(f32),

    #[error("test fraction must be strictly between 0 and 1, got {0}")]
    TestFraction(f64),

    #[error("{0} samples cannot be split with test fraction {1}")]
    SplitTooSmall(usize, f64),

    #[error("batch size must be positive")]
    BatchSize,

    #[error("invalid model configuration: {0:?}")]
    ModelConfig(crate::model::ModelConfig),

    #[error("parameter shapes are inconsistent with each other or the stored configuration")]
    ParameterShapes,

    #[error("expected inputs with {0} features, got {1}")]
    InputWidth(usize, usize),

    #[error("inputs must have at least one sample and one step, got {0} x {1}")]
    EmptyInput(usize, usize),

    #[error("batch has {0} rows but {1} labels")]
    LabelCount(usize, usize),

    #[error("label {0} is out of range for {1} classes")]
    LabelOutOfRange(usize, usize),

    #[error("{0} partition is empty")]
    EmptyPartition(&'static str),

    #[error("loss diverged in epoch {0}: {1}")]
    TrainingDivergence(usize, f32),

    #[error("failed to write training history: {1:?}")]
    WriteHistory(#[source] std::io::Error, PathBuf),

    #[error("failed to encode training history: {1:?}")]
    EncodeHistory(#[source] serde_json::Error, PathBuf),

    #[error("device {0:?} is recognised but only the cpu is supported")]
    UnsupportedDevice(String),

    #[error("unknown device: {0:?}")]
    UnknownDevice(String),

    #[error("failed to write checkpoint: {1:?}")]
    WriteCheckpoint(#[source] std::io::Error, PathBuf),

    #[error("failed to encode checkpoint: {1:?}")]
    EncodeCheckpoint(#[source] bincode::Error, PathBuf),

    #[error("failed to read checkpoint: {1:?}")]
    ReadCheckpoint(#[source] std::io::Error, PathBuf),

    #[error("failed to decode checkpoint: {1:?}")]
    DecodeCheckpoint(#[source] bincode::Error, PathBuf),

    #[error("failed to run ffprobe on {1:?}")]
    SpawnProbe(#[source] std::io::Error, PathBuf),

    #[error("ffprobe failed on {0:?} with {1}: {2}")]
    ProbeFailed(PathBuf, ExitStatus, String),

    #[error("failed to parse ffprobe output for {1:?}")]
    ParseProbe(#[source] serde_json::Error, PathBuf),

    #[error("no video stream in {0:?}")]
    NoVideoStream(PathBuf),

    #[error("video stream in {1:?} has no {0}")]
    ProbeField(&'static str, PathBuf),

    #[error("failed to start decoder for {1:?}")]
    SpawnDecoder(#[source] std::io::Error, PathBuf),

    #[error("decoder for {0:?} has no stdout")]
    DecoderStdout(PathBuf),

    #[error("failed to read frame {1}")]
    ReadFrame(#[source] std::io::Error, usize),

    #[error("frame {0} ended after {1} of {2} bytes")]
    TruncatedFrame(usize, usize, usize),

    #[error("failed to wait for decoder")]
    WaitDecoder(#[source] std::io::Error),

    #[error("decoder exited with {0}")]
    DecoderExited(ExitStatus),

    #[error("failed to remove existing output: {1:?}")]
    RemoveOutput(#[source] std::io::Error, PathBuf),

    #[error("failed to start encoder for {1:?}")]
    SpawnEncoder(#[source] std::io::Error, PathBuf),

    #[error("encoder for {0:?} has no stdin")]
    EncoderStdin(PathBuf),

    #[error("frame {0} has {1} bytes, encoder expects {2}")]
    FrameSize(usize, usize, usize),

    #[error("encoder input pipe closed")]
    EncoderPipe(#[source] std::io::Error),

    #[error("failed to wait for encoder")]
    WaitEncoder(#[source] std::io::Error),

    #[error("encoder exited with {0}")]
    EncoderExited(ExitStatus),

    #[cfg(feature = "gui")]
    #[error("failed to convert value to i32")]
    ConvertToI32,

    #[cfg(feature = "gui")]
    #[error("failed to convert frame dimension to i32")]
    ConvertDimToI32(#[source] std::num::TryFromIntError),

    #[cfg(feature = "gui")]
    #[error("failed to wrap frame bytes in a Mat")]
    WrapFrame(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed to draw line")]
    DrawLine(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed to draw circle")]
    DrawCircle(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed to draw text")]
    PutText(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed to show image")]
    ImShow(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed waiting for key press")]
    WaitKey(#[source] opencv::Error),
}
