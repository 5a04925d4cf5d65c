use crate::{
    checkpoint::CheckpointSink,
    dataset::{Batch, DataLoader},
    error::Error,
    loss::{argmax, Loss},
    model::LstmClassifier,
    optim::Optimizer,
};
use indicatif::ProgressBar;
use ndarray::{ArrayView2, Axis};
use num_traits::ToPrimitive;
use rand::rngs::StdRng;
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{info, trace, warn};

pub(crate) const DEFAULT_EPOCHS: &str = "20";

/// Per-epoch metrics, one entry per completed epoch in every series.
///
/// Losses are those of the last batch in the epoch; accuracies are percentages
/// over the whole partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct History {
    pub(crate) train_loss: Vec<f32>,
    pub(crate) train_accuracy: Vec<f64>,
    pub(crate) val_loss: Vec<f32>,
    pub(crate) val_accuracy: Vec<f64>,
}

impl History {
    pub(crate) fn len(&self) -> usize {
        self.train_loss.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.train_loss.is_empty()
    }

    fn push(&mut self, train: EpochMetrics, val: EpochMetrics) {
        self.train_loss.push(train.loss);
        self.train_accuracy.push(train.accuracy);
        self.val_loss.push(val.loss);
        self.val_accuracy.push(val.accuracy);
    }

    pub(crate) fn write_json<P>(&self, path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::WriteHistory(e, path.to_path_buf()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| Error::EncodeHistory(e, path.to_path_buf()))?;
        writer
            .flush()
            .map_err(|e| Error::WriteHistory(e, path.to_path_buf()))
    }
}

/// Best validation accuracy seen so far in a run.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub(crate) struct BestAccuracy(f64);

impl BestAccuracy {
    pub(crate) fn get(self) -> f64 {
        self.0
    }

    /// Record `accuracy`, returning whether it should replace the kept model.
    /// Ties replace it.
    pub(crate) fn observe(&mut self, accuracy: f64) -> bool {
        if accuracy >= self.0 {
            self.0 = accuracy;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct EpochMetrics {
    loss: f32,
    accuracy: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pass {
    Train,
    Validate,
}

impl Pass {
    fn name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validate => "validate",
        }
    }
}

/// Rows whose arg-max matches the label. Rows with NaN scores never match.
fn count_correct(logits: ArrayView2<f32>, labels: &[usize]) -> usize {
    logits
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, label)| argmax(row.view()).map_or(false, |p| p == **label))
        .count()
}

fn percent(correct: usize, total: usize) -> Result<f64, Error> {
    let correct = correct.to_f64().ok_or(Error::ConvertToF64)?;
    let total = total.to_f64().ok_or(Error::ConvertToF64)?;
    Ok(100.0 * correct / total)
}

/// Owns a classifier for the length of a run and is the only thing that
/// mutates its parameters.
pub(crate) struct TrainingLoop<L, O> {
    model: LstmClassifier,
    loss: L,
    optimizer: O,
    best: BestAccuracy,
    halt_on_divergence: bool,
}

impl<L, O> TrainingLoop<L, O>
where
    L: Loss,
    O: Optimizer,
{
    pub(crate) fn new(model: LstmClassifier, loss: L, optimizer: O) -> Self {
        Self {
            model,
            loss,
            optimizer,
            best: BestAccuracy::default(),
            halt_on_divergence: false,
        }
    }

    /// Abort with an error on the first non-finite batch loss instead of
    /// logging it and carrying on.
    pub(crate) fn halt_on_divergence(mut self, halt: bool) -> Self {
        self.halt_on_divergence = halt;
        self
    }

    pub(crate) fn best_accuracy(&self) -> BestAccuracy {
        self.best
    }

    fn check_loss(&self, epoch: usize, pass: Pass, loss: f32) -> Result<(), Error> {
        if loss.is_finite() {
            return Ok(());
        }
        warn!(message = "non-finite loss", epoch, pass = pass.name(), loss);
        if self.halt_on_divergence {
            Err(Error::TrainingDivergence(epoch, loss))
        } else {
            Ok(())
        }
    }

    fn train_batch(&mut self, epoch: usize, batch: &Batch) -> Result<(f32, usize), Error> {
        let (logits, cache) = self.model.forward_train(batch.inputs.view())?;
        let (loss, d_logits) = self.loss.forward(logits.view(), &batch.labels)?;
        self.check_loss(epoch, Pass::Train, loss)?;

        let grads = self.model.backward(&cache, d_logits.view());
        self.optimizer.step(self.model.parameters_mut(), &grads);

        Ok((loss, count_correct(logits.view(), &batch.labels)))
    }

    fn validate_batch(&self, epoch: usize, batch: &Batch) -> Result<(f32, usize), Error> {
        let logits = self.model.forward(batch.inputs.view())?;
        let (loss, _) = self.loss.forward(logits.view(), &batch.labels)?;
        self.check_loss(epoch, Pass::Validate, loss)?;
        Ok((loss, count_correct(logits.view(), &batch.labels)))
    }

    fn epoch_pass(
        &mut self,
        epoch: usize,
        pass: Pass,
        loader: &DataLoader,
        rng: &mut StdRng,
    ) -> Result<EpochMetrics, Error> {
        let mut last_loss = 0.0;
        let mut correct = 0;
        let mut total = 0;

        for (index, batch) in loader.batches(rng).iter().enumerate() {
            let (loss, batch_correct) = match pass {
                Pass::Train => self.train_batch(epoch, batch)?,
                Pass::Validate => self.validate_batch(epoch, batch)?,
            };
            trace!(
                message = "batch",
                epoch,
                pass = pass.name(),
                index,
                loss,
                correct = batch_correct
            );
            last_loss = loss;
            correct += batch_correct;
            total += batch.len();
        }

        Ok(EpochMetrics {
            loss: last_loss,
            accuracy: percent(correct, total)?,
        })
    }

    /// Run `epochs` rounds of train, validate, and keep-if-not-worse.
    ///
    /// `running` is checked before each epoch; clearing it stops the run with
    /// the epochs completed so far.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run<S>(
        &mut self,
        epochs: usize,
        train: &DataLoader,
        test: &DataLoader,
        sink: &mut S,
        rng: &mut StdRng,
        running: &AtomicBool,
        progress: Option<&ProgressBar>,
    ) -> Result<History, Error>
    where
        S: CheckpointSink,
    {
        if train.is_empty() {
            return Err(Error::EmptyPartition("train"));
        }
        if test.is_empty() {
            return Err(Error::EmptyPartition("test"));
        }

        info!(
            message = "starting training",
            epochs,
            train_batches = train.num_batches(),
            test_batches = test.num_batches(),
            learning_rate = self.optimizer.learning_rate()
        );

        let mut history = History::default();

        for epoch in 0..epochs {
            if !running.load(Ordering::SeqCst) {
                warn!(message = "training cancelled", completed_epochs = epoch);
                break;
            }

            let train_metrics = self.epoch_pass(epoch, Pass::Train, train, rng)?;
            let val_metrics = self.epoch_pass(epoch, Pass::Validate, test, rng)?;
            history.push(train_metrics, val_metrics);

            let improved = self.best.observe(val_metrics.accuracy);
            if improved {
                sink.save(&self.model, epoch, val_metrics.accuracy)?;
            }

            info!(
                message = "epoch complete",
                epoch,
                train_loss = train_metrics.loss,
                train_accuracy = train_metrics.accuracy,
                val_loss = val_metrics.loss,
                val_accuracy = val_metrics.accuracy,
                best_accuracy = self.best.get(),
                saved = improved
            );

            if let Some(progress) = progress {
                progress.set_message(format!(
                    "loss {:.4} acc {:.1}% val_loss {:.4} val_acc {:.1}%",
                    train_metrics.loss,
                    train_metrics.accuracy,
                    val_metrics.loss,
                    val_metrics.accuracy
                ));
                progress.inc(1);
            }
        }

        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{tests::corpus, Dataset, LabelEncoder},
        loss::CrossEntropyLoss,
        model::ModelConfig,
        optim::Adam,
    };
    use ndarray::Array2;
    use rand::SeedableRng;

    /// Remembers every save instead of writing files.
    #[derive(Default)]
    struct RecordingSink {
        saves: Vec<(usize, f64)>,
    }

    impl CheckpointSink for RecordingSink {
        fn save(
            &mut self,
            _model: &LstmClassifier,
            epoch: usize,
            accuracy: f64,
        ) -> Result<(), Error> {
            self.saves.push((epoch, accuracy));
            Ok(())
        }
    }

    fn config(num_classes: usize) -> ModelConfig {
        ModelConfig {
            hidden_size: 8,
            num_classes,
            ..ModelConfig::default()
        }
    }

    fn training_loop(num_classes: usize, lr: f32) -> TrainingLoop<CrossEntropyLoss, Adam> {
        let model = LstmClassifier::new(config(num_classes), &mut StdRng::seed_from_u64(0)).unwrap();
        TrainingLoop::new(model, CrossEntropyLoss, Adam::new(lr))
    }

    fn loader(dataset: Dataset) -> DataLoader {
        DataLoader::new(dataset, 4, true).unwrap()
    }

    /// Two classes told apart by the sign of every feature.
    fn separable(per_class: usize) -> Dataset {
        let n = 2 * per_class;
        let features = Array2::from_shape_fn((n, crate::filter::FEATURE_WIDTH), |(row, _)| {
            if row % 2 == 0 {
                0.5
            } else {
                -0.5
            }
        });
        Dataset {
            features,
            labels: (0..n).map(|row| row % 2).collect(),
        }
    }

    mod best_accuracy_tests {
        use super::*;

        #[test]
        fn ties_replace_and_drops_do_not() {
            let mut best = BestAccuracy::default();
            assert!(best.observe(0.0));
            assert!(best.observe(50.0));
            assert!(!best.observe(49.9));
            assert!(best.observe(50.0));
            assert!(best.observe(75.0));
            assert_eq!(best.get(), 75.0);
        }
    }

    mod run_tests {
        use super::*;

        #[test]
        fn one_epoch_gives_one_entry_per_series() {
            let corpus = corpus(3, 4);
            let dataset =
                Dataset::from_corpus(&corpus, &LabelEncoder::fit(&corpus), 3000.0).unwrap();
            assert_eq!(dataset.len(), 12);

            let mut sink = RecordingSink::default();
            let history = training_loop(3, 0.001)
                .run(
                    1,
                    &loader(dataset.clone()),
                    &loader(dataset),
                    &mut sink,
                    &mut StdRng::seed_from_u64(1),
                    &AtomicBool::new(true),
                    None,
                )
                .unwrap();

            assert_eq!(history.len(), 1);
            assert_eq!(history.train_accuracy.len(), 1);
            assert_eq!(history.val_loss.len(), 1);
            assert_eq!(history.val_accuracy.len(), 1);
            // the first epoch always beats the initial best of zero
            assert_eq!(sink.saves.len(), 1);
        }

        #[test]
        fn saves_exactly_when_accuracy_does_not_drop() {
            let mut sink = RecordingSink::default();
            let history = training_loop(2, 0.01)
                .run(
                    15,
                    &loader(separable(6)),
                    &loader(separable(3)),
                    &mut sink,
                    &mut StdRng::seed_from_u64(2),
                    &AtomicBool::new(true),
                    None,
                )
                .unwrap();

            let mut best = 0.0;
            let mut expected = Vec::new();
            for (epoch, &accuracy) in history.val_accuracy.iter().enumerate() {
                if accuracy >= best {
                    best = accuracy;
                    expected.push((epoch, accuracy));
                }
            }
            assert_eq!(sink.saves, expected);
        }

        #[test]
        fn learns_a_separable_problem() {
            let mut training = training_loop(2, 0.05);
            let history = training
                .run(
                    40,
                    &loader(separable(4)),
                    &loader(separable(2)),
                    &mut RecordingSink::default(),
                    &mut StdRng::seed_from_u64(3),
                    &AtomicBool::new(true),
                    None,
                )
                .unwrap();

            assert_eq!(history.len(), 40);
            assert!(history.val_loss[39] < history.val_loss[0]);
            assert_eq!(history.val_accuracy[39], 100.0);
            assert_eq!(training.best_accuracy().get(), 100.0);
        }

        #[test]
        fn cancelled_before_start_runs_nothing() {
            let mut sink = RecordingSink::default();
            let history = training_loop(2, 0.01)
                .run(
                    5,
                    &loader(separable(4)),
                    &loader(separable(2)),
                    &mut sink,
                    &mut StdRng::seed_from_u64(4),
                    &AtomicBool::new(false),
                    None,
                )
                .unwrap();
            assert!(history.is_empty());
            assert!(sink.saves.is_empty());
        }

        #[test]
        fn empty_partitions_are_rejected() {
            let empty = Dataset {
                features: Array2::zeros((0, crate::filter::FEATURE_WIDTH)),
                labels: Vec::new(),
            };
            let result = training_loop(2, 0.01).run(
                1,
                &loader(separable(2)),
                &loader(empty),
                &mut RecordingSink::default(),
                &mut StdRng::seed_from_u64(5),
                &AtomicBool::new(true),
                None,
            );
            assert!(matches!(result, Err(Error::EmptyPartition("test"))));
        }

        fn poisoned(halt: bool) -> TrainingLoop<CrossEntropyLoss, Adam> {
            let mut model =
                LstmClassifier::new(config(2), &mut StdRng::seed_from_u64(6)).unwrap();
            model.parameters_mut().bias_fc.fill(f32::NAN);
            TrainingLoop::new(model, CrossEntropyLoss, Adam::new(0.01)).halt_on_divergence(halt)
        }

        #[test]
        fn divergence_halts_when_asked() {
            let result = poisoned(true).run(
                2,
                &loader(separable(2)),
                &loader(separable(2)),
                &mut RecordingSink::default(),
                &mut StdRng::seed_from_u64(7),
                &AtomicBool::new(true),
                None,
            );
            assert!(matches!(result, Err(Error::TrainingDivergence(0, _))));
        }

        #[test]
        fn divergence_is_recorded_otherwise() {
            let history = poisoned(false)
                .run(
                    2,
                    &loader(separable(2)),
                    &loader(separable(2)),
                    &mut RecordingSink::default(),
                    &mut StdRng::seed_from_u64(8),
                    &AtomicBool::new(true),
                    None,
                )
                .unwrap();
            assert_eq!(history.len(), 2);
            assert!(history.train_loss.iter().all(|loss| loss.is_nan()));
            assert!(history.val_accuracy.iter().all(|&acc| acc == 0.0));
        }
    }

    mod history_tests {
        use super::*;

        #[test]
        fn writes_json_series() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("history.json");
            let history = History {
                train_loss: vec![0.5],
                train_accuracy: vec![75.0],
                val_loss: vec![0.25],
                val_accuracy: vec![100.0],
            };
            history.write_json(&path).unwrap();

            let value: serde_json::Value =
                serde_json::from_reader(File::open(&path).unwrap()).unwrap();
            assert_eq!(value["train_accuracy"][0], 75.0);
            assert_eq!(value["val_loss"][0], 0.25);
        }
    }
}
