use crate::error::Error;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use num_traits::ToPrimitive;
use ordered_float::NotNan;

pub(crate) trait Loss {
    /// Return the scalar loss and its gradient with respect to `logits`.
    fn forward(&self, logits: ArrayView2<f32>, labels: &[usize])
        -> Result<(f32, Array2<f32>), Error>;
}

/// Softmax cross entropy against integer class targets, averaged over the batch.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct CrossEntropyLoss;

impl Loss for CrossEntropyLoss {
    fn forward(
        &self,
        logits: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(f32, Array2<f32>), Error> {
        let (batch, num_classes) = logits.dim();
        if batch != labels.len() {
            return Err(Error::LabelCount(batch, labels.len()));
        }
        if let Some(&label) = labels.iter().find(|&&label| label >= num_classes) {
            return Err(Error::LabelOutOfRange(label, num_classes));
        }
        let scale = batch.to_f32().ok_or(Error::ConvertToF32)?.recip();

        let mut grad = Array2::zeros((batch, num_classes));
        let mut total = 0.0;

        for ((row, mut grad_row), &label) in logits
            .axis_iter(Axis(0))
            .zip(grad.axis_iter_mut(Axis(0)))
            .zip(labels)
        {
            let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            let sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>();
            let log_sum = sum.ln() + max;

            total += log_sum - row[label];

            grad_row.assign(&row.mapv(|v| (v - log_sum).exp() * scale));
            grad_row[label] -= scale;
        }

        Ok((total * scale, grad))
    }
}

/// Index of the largest score. NaN scores are an error rather than being
/// silently ordered.
pub(crate) fn argmax(scores: ArrayView1<f32>) -> Result<usize, Error> {
    let mut best: Option<(usize, NotNan<f32>)> = None;
    for (i, &score) in scores.iter().enumerate() {
        let score = NotNan::new(score).map_err(|e| Error::ConstructNotNan(e, score))?;
        if best.map_or(true, |(_, current)| score > current) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i).ok_or(Error::EmptyScores)
}

/// Row-wise [`argmax`].
pub(crate) fn predictions(logits: ArrayView2<f32>) -> Result<Vec<usize>, Error> {
    logits.axis_iter(Axis(0)).map(argmax).collect()
}
