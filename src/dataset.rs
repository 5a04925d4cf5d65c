use crate::{
    error::Error,
    filter::FEATURE_WIDTH,
    store::{Corpus, Label},
};
use ndarray::{s, Array2, Array3, Axis};
use num_traits::ToPrimitive;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::BTreeMap;

pub(crate) const DEFAULT_TEST_FRACTION: &str = "0.2";
pub(crate) const DEFAULT_SEED: &str = "42";
pub(crate) const DEFAULT_BATCH_SIZE: &str = "4";
pub(crate) const DEFAULT_FEATURE_SCALE: &str = "255";
pub(crate) const DEFAULT_TRIM_TRAIN: &str = "4";
pub(crate) const DEFAULT_TRIM_TEST: &str = "6";

/// Maps corpus labels onto contiguous class indices `0..K`, in label order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LabelEncoder {
    labels: Vec<Label>,
    indices: BTreeMap<Label, usize>,
}

impl LabelEncoder {
    pub(crate) fn fit(corpus: &Corpus) -> Self {
        Self::from_labels(corpus.labels().cloned().collect())
    }

    pub(crate) fn from_labels(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup();
        let indices = labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), i))
            .collect();
        Self { labels, indices }
    }

    pub(crate) fn encode(&self, label: &Label) -> Result<usize, Error> {
        self.indices
            .get(label)
            .copied()
            .ok_or_else(|| Error::UnknownLabel(label.clone()))
    }

    pub(crate) fn decode(&self, index: usize) -> Option<&Label> {
        self.labels.get(index)
    }

    pub(crate) fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }
}

/// How many leading samples to discard from each partition after the split.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Trim {
    /// Drop fixed counts from the front of the train and test partitions.
    Fixed { train: usize, test: usize },
    /// Drop just enough from the front that each partition is a multiple of
    /// the batch size.
    AlignTo(usize),
}

impl Default for Trim {
    fn default() -> Self {
        Self::Fixed {
            train: DEFAULT_TRIM_TRAIN.parse().unwrap(),
            test: DEFAULT_TRIM_TEST.parse().unwrap(),
        }
    }
}

impl Trim {
    fn counts(self, train_len: usize, test_len: usize) -> (usize, usize) {
        match self {
            Self::Fixed { train, test } => (train.min(train_len), test.min(test_len)),
            Self::AlignTo(0) => (0, 0),
            Self::AlignTo(batch_size) => (train_len % batch_size, test_len % batch_size),
        }
    }
}

/// Flattened samples: one row of `FEATURE_WIDTH` scaled values per sample.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dataset {
    pub(crate) features: Array2<f32>,
    pub(crate) labels: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Split {
    pub(crate) train: Dataset,
    pub(crate) test: Dataset,
    /// Samples discarded by the trim policy, train then test.
    pub(crate) trimmed: (usize, usize),
}

impl Dataset {
    /// Flatten `corpus` in label then record order, dividing every value by
    /// `feature_scale`.
    pub(crate) fn from_corpus(
        corpus: &Corpus,
        encoder: &LabelEncoder,
        feature_scale: f32,
    ) -> Result<Self, Error> {
        if !(feature_scale.is_finite() && feature_scale != 0.0) {
            return Err(Error::FeatureScale(feature_scale));
        }

        let mut features = Array2::zeros((corpus.len(), FEATURE_WIDTH));
        let mut labels = Vec::with_capacity(corpus.len());

        for (mut row, (label, feature)) in features.axis_iter_mut(Axis(0)).zip(corpus.samples()) {
            row.assign(&(feature.flatten() / feature_scale));
            labels.push(encoder.encode(label)?);
        }

        Ok(Self { features, labels })
    }

    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Uniform, seeded train/test partition.
    ///
    /// The test partition takes `ceil(len * test_fraction)` samples from the
    /// front of a seeded permutation and train takes the rest; `trim` then
    /// removes leading samples from each.
    pub(crate) fn split(&self, test_fraction: f64, seed: u64, trim: Trim) -> Result<Split, Error> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(Error::TestFraction(test_fraction));
        }

        let n = self.len();
        let test_len = (n.to_f64().ok_or(Error::ConvertToF64)? * test_fraction)
            .ceil()
            .to_usize()
            .ok_or(Error::ConvertToUSize)?;
        if test_len == 0 || test_len >= n {
            return Err(Error::SplitTooSmall(n, test_fraction));
        }

        let mut permutation = (0..n).collect::<Vec<_>>();
        permutation.shuffle(&mut StdRng::seed_from_u64(seed));
        let (test_indices, train_indices) = permutation.split_at(test_len);

        let (trim_train, trim_test) = trim.counts(train_indices.len(), test_indices.len());

        Ok(Split {
            train: self.select(&train_indices[trim_train..]),
            test: self.select(&test_indices[trim_test..]),
            trimmed: (trim_train, trim_test),
        })
    }
}

/// One step's worth of samples, shaped `batch x time x features`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Batch {
    pub(crate) inputs: Array3<f32>,
    pub(crate) labels: Vec<usize>,
}

impl Batch {
    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Fixed-size batches over a dataset; each sample is a one-step sequence.
#[derive(Debug, Clone)]
pub(crate) struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub(crate) fn new(dataset: Dataset, batch_size: usize, shuffle: bool) -> Result<Self, Error> {
        if batch_size == 0 {
            return Err(Error::BatchSize);
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.dataset.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of batches per epoch; the last one may be short.
    pub(crate) fn num_batches(&self) -> usize {
        (self.len() + self.batch_size - 1) / self.batch_size
    }

    /// This epoch's batches, reshuffled from `rng` when shuffling is on.
    pub(crate) fn batches(&self, rng: &mut StdRng) -> Vec<Batch> {
        let mut order = (0..self.len()).collect::<Vec<_>>();
        if self.shuffle {
            order.shuffle(rng);
        }

        order
            .chunks(self.batch_size)
            .map(|indices| {
                let rows = self.dataset.features.select(Axis(0), indices);
                let (batch, width) = rows.dim();
                let mut inputs = Array3::zeros((batch, 1, width));
                inputs.slice_mut(s![.., 0, ..]).assign(&rows);
                Batch {
                    inputs,
                    labels: indices.iter().map(|&i| self.dataset.labels[i]).collect(),
                }
            })
            .collect()
    }
}
