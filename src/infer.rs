use crate::{
    checkpoint::Checkpoint,
    dataset::LabelEncoder,
    error::Error,
    filter::{FeatureVector, FEATURE_WIDTH},
    loss::{argmax, predictions},
    model::LstmClassifier,
    store::Label,
};
use ndarray::{Array3, Axis};
use std::path::Path;
use tracing::info;

/// A frozen classifier plus what it needs to read new samples the way it was
/// trained on them.
#[derive(Debug, Clone)]
pub(crate) struct InferenceRunner {
    model: LstmClassifier,
    feature_scale: f32,
    encoder: LabelEncoder,
}

impl InferenceRunner {
    pub(crate) fn load<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let runner = Self::from_checkpoint(Checkpoint::load(path)?)?;
        info!(
            message = "loaded checkpoint",
            path = %path.display(),
            num_classes = runner.num_classes(),
            feature_scale = runner.feature_scale
        );
        Ok(runner)
    }

    pub(crate) fn from_checkpoint(checkpoint: Checkpoint) -> Result<Self, Error> {
        let feature_scale = checkpoint.feature_scale;
        if !(feature_scale.is_finite() && feature_scale != 0.0) {
            return Err(Error::FeatureScale(feature_scale));
        }
        // checkpoints hold the training encoder's labels in index order
        let encoder = LabelEncoder::from_labels(checkpoint.labels.clone());
        Ok(Self {
            model: checkpoint.into_model()?,
            feature_scale,
            encoder,
        })
    }

    pub(crate) fn num_classes(&self) -> usize {
        self.model.config().num_classes
    }

    /// One-step sequences of scaled features, `samples x 1 x FEATURE_WIDTH`.
    fn inputs(&self, features: &[FeatureVector]) -> Array3<f32> {
        let mut inputs = Array3::zeros((features.len(), 1, FEATURE_WIDTH));
        for (mut row, feature) in inputs.axis_iter_mut(Axis(0)).zip(features) {
            row.index_axis_mut(Axis(0), 0)
                .assign(&(feature.flatten() / self.feature_scale));
        }
        inputs
    }

    /// Class index in `0..num_classes` for a single sample.
    pub(crate) fn predict(&self, feature: &FeatureVector) -> Result<usize, Error> {
        let logits = self.model.forward(self.inputs(std::slice::from_ref(feature)).view())?;
        argmax(logits.index_axis(Axis(0), 0))
    }

    pub(crate) fn predict_batch(&self, features: &[FeatureVector]) -> Result<Vec<usize>, Error> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let logits = self.model.forward(self.inputs(features).view())?;
        predictions(logits.view())
    }

    /// The corpus label a class index was trained from, when the checkpoint
    /// recorded one.
    pub(crate) fn label_of(&self, index: usize) -> Option<&Label> {
        self.encoder.decode(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::KeypointFilter,
        model::{ModelConfig, Parameters},
        pose::tests::uniform_person,
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn checkpoint(seed: u64) -> Checkpoint {
        let config = ModelConfig::default();
        Checkpoint {
            config,
            feature_scale: 255.0,
            labels: vec![
                Label::Index(0),
                Label::Index(1),
                Label::Name("fall".to_owned()),
            ],
            parameters: Parameters::uniform(&config, &mut StdRng::seed_from_u64(seed)).unwrap(),
        }
    }

    fn feature() -> FeatureVector {
        KeypointFilter::default().filter(&[uniform_person(0.9, 0.9)])[0]
    }

    mod predict_tests {
        use super::*;

        #[test]
        fn index_is_in_range() {
            for seed in 0..8 {
                let runner = InferenceRunner::from_checkpoint(checkpoint(seed)).unwrap();
                let index = runner.predict(&feature()).unwrap();
                assert!(index < runner.num_classes());
                assert!(runner.label_of(index).is_some());
            }
        }

        #[test]
        fn sentinel_only_input_is_well_formed() {
            let runner = InferenceRunner::from_checkpoint(checkpoint(1)).unwrap();
            let rejected = KeypointFilter::default().filter(&[uniform_person(0.9, 0.1)])[0];
            assert_eq!(rejected.sentinel_count(), crate::pose::NUM_KEYPOINTS);
            assert!(runner.predict(&rejected).unwrap() < 3);
        }

        #[test]
        fn bias_decides_when_weights_are_zero() {
            let mut checkpoint = checkpoint(2);
            checkpoint.parameters = Parameters::zeros(&checkpoint.config);
            checkpoint.parameters.bias_fc[2] = 1.0;
            let runner = InferenceRunner::from_checkpoint(checkpoint).unwrap();
            assert_eq!(runner.predict(&feature()).unwrap(), 2);
            assert_eq!(runner.label_of(2), Some(&Label::Name("fall".to_owned())));
        }

        #[test]
        fn batch_matches_single() {
            let runner = InferenceRunner::from_checkpoint(checkpoint(3)).unwrap();
            let mut other = feature();
            other.xs[3] = -1.0;
            other.ys[3] = -1.0;
            let features = vec![feature(), other];

            let batch = runner.predict_batch(&features).unwrap();
            let single = features
                .iter()
                .map(|f| runner.predict(f).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(batch, single);
            assert!(runner.predict_batch(&[]).unwrap().is_empty());
        }
    }

    #[test]
    fn load_reads_a_saved_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        checkpoint(4).save(&path).unwrap();

        let runner = InferenceRunner::load(&path).unwrap();
        assert_eq!(runner.num_classes(), 3);
        assert!(runner.predict(&feature()).unwrap() < 3);
    }

    #[test]
    fn zero_scale_is_rejected() {
        let mut checkpoint = checkpoint(5);
        checkpoint.feature_scale = 0.0;
        assert!(matches!(
            InferenceRunner::from_checkpoint(checkpoint),
            Err(Error::FeatureScale(_))
        ));
    }
}
