use crate::{
    error::Error,
    model::{LstmClassifier, ModelConfig, Parameters},
    store::Label,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

pub(crate) const DEFAULT_CHECKPOINT: &str = "LSTM_Model.ckpt";

/// Everything needed to rebuild a trained classifier and feed it the same way
/// it was trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub(crate) config: ModelConfig,
    pub(crate) feature_scale: f32,
    pub(crate) labels: Vec<Label>,
    pub(crate) parameters: Parameters,
}

impl Checkpoint {
    /// Write to a sibling temporary file, then rename over `path`, so readers
    /// never see a partial checkpoint.
    pub(crate) fn save<P>(&self, path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let file = File::create(&tmp).map_err(|e| Error::WriteCheckpoint(e, tmp.clone()))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .map_err(|e| Error::EncodeCheckpoint(e, path.to_path_buf()))?;
        writer
            .flush()
            .map_err(|e| Error::WriteCheckpoint(e, tmp.clone()))?;
        drop(writer);

        fs::rename(&tmp, path).map_err(|e| Error::WriteCheckpoint(e, path.to_path_buf()))
    }

    pub(crate) fn load<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::ReadCheckpoint(e, path.to_path_buf()))?;
        let checkpoint: Self = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| Error::DecodeCheckpoint(e, path.to_path_buf()))?;

        if checkpoint.parameters.config()? != checkpoint.config {
            return Err(Error::ParameterShapes);
        }
        Ok(checkpoint)
    }

    pub(crate) fn into_model(self) -> Result<LstmClassifier, Error> {
        LstmClassifier::from_parameters(self.parameters)
    }
}

/// Receives the model whenever the training loop decides to keep it.
pub(crate) trait CheckpointSink {
    fn save(&mut self, model: &LstmClassifier, epoch: usize, accuracy: f64) -> Result<(), Error>;
}

/// Keeps the best model in a single file at a fixed path.
#[derive(Debug, Clone)]
pub(crate) struct FileCheckpoint {
    path: PathBuf,
    feature_scale: f32,
    labels: Vec<Label>,
}

impl FileCheckpoint {
    pub(crate) fn new<P>(path: P, feature_scale: f32, labels: &[Label]) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
            feature_scale,
            labels: labels.to_vec(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointSink for FileCheckpoint {
    fn save(&mut self, model: &LstmClassifier, epoch: usize, accuracy: f64) -> Result<(), Error> {
        Checkpoint {
            config: *model.config(),
            feature_scale: self.feature_scale,
            labels: self.labels.clone(),
            parameters: model.parameters().clone(),
        }
        .save(&self.path)?;
        info!(
            message = "saved checkpoint",
            path = %self.path.display(),
            epoch,
            accuracy
        );
        Ok(())
    }
}
