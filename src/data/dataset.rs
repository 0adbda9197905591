//! The `Dataset` trait and an in-memory implementation.

use ndarray::{ArrayD, Axis, IxDyn};
use std::sync::Arc;

/// A finite, indexable source of (features, label) examples.
pub trait Dataset: Send + Sync {
    type Item;
    type Label;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Example and label at `index`, or `None` past the end.
    fn get(&self, index: usize) -> Option<(Self::Item, Self::Label)>;
}

/// Dataset held entirely in memory. Axis 0 of both arrays is the example
/// axis. Cloning shares the underlying arrays.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    features: Arc<ArrayD<f32>>,
    labels: Arc<ArrayD<f32>>,
    num_samples: usize,
}

impl InMemoryDataset {
    /// Returns `None` when the two arrays disagree on the number of examples.
    pub fn new(features: ArrayD<f32>, labels: ArrayD<f32>) -> Option<Self> {
        let num_samples = features.shape().first().copied().unwrap_or(0);
        if labels.shape().first().copied().unwrap_or(0) != num_samples {
            return None;
        }
        Some(Self { features: Arc::new(features), labels: Arc::new(labels), num_samples })
    }

    /// Unlabelled dataset; every label is zero.
    pub fn from_features(features: ArrayD<f32>) -> Self {
        let num_samples = features.shape().first().copied().unwrap_or(0);
        let labels = ArrayD::zeros(IxDyn(&[num_samples]));
        Self { features: Arc::new(features), labels: Arc::new(labels), num_samples }
    }

    /// Shape of one example.
    pub fn feature_shape(&self) -> Vec<usize> {
        self.features.shape().get(1..).map(<[usize]>::to_vec).unwrap_or_default()
    }

    /// Stacks the examples at `indices` along a new batch axis.
    pub fn get_features_batch(&self, indices: &[usize]) -> ArrayD<f32> {
        let mut batch_shape = vec![indices.len()];
        batch_shape.extend(self.feature_shape());
        let mut batch = ArrayD::zeros(IxDyn(&batch_shape));
        for (i, &idx) in indices.iter().enumerate() {
            let sample = self.features.index_axis(Axis(0), idx);
            batch.index_axis_mut(Axis(0), i).assign(&sample);
        }
        batch
    }
}

impl Dataset for InMemoryDataset {
    type Item = ArrayD<f32>;
    type Label = ArrayD<f32>;

    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, index: usize) -> Option<(Self::Item, Self::Label)> {
        if index >= self.num_samples {
            return None;
        }
        let feature = self.features.index_axis(Axis(0), index).to_owned();
        let label = self.labels.index_axis(Axis(0), index).to_owned();
        Some((feature, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_stack_selected_examples() {
        let features = ArrayD::from_shape_fn(IxDyn(&[4, 2, 2, 1]), |ix| ix[0] as f32);
        let dataset = InMemoryDataset::from_features(features);
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.feature_shape(), vec![2, 2, 1]);

        let batch = dataset.get_features_batch(&[3, 1]);
        assert_eq!(batch.shape(), &[2, 2, 2, 1]);
        assert!(batch.index_axis(Axis(0), 0).iter().all(|&v| v == 3.0));
        assert!(batch.index_axis(Axis(0), 1).iter().all(|&v| v == 1.0));
        assert!(dataset.get(4).is_none());
    }

    #[test]
    fn mismatched_label_count_is_rejected() {
        let features = ArrayD::zeros(IxDyn(&[3, 784]));
        let labels = ArrayD::zeros(IxDyn(&[2]));
        assert!(InMemoryDataset::new(features, labels).is_none());
    }
}
