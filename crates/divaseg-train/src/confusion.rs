//! Pixel-level confusion matrix with per-class precision, recall and F1.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use burn::prelude::*;
use derive_new::new;
use divaseg_data::Split;

use crate::error::{TrainError, TrainResult};

/// Folder confusion matrices are written to, below the run directory.
pub const CONF_MAT_DIR: &str = "conf_mats";

/// A batch of logits `[batch, num_classes, h, w]` and targets `[batch, h, w]`.
#[derive(new, Debug, Clone)]
pub struct ConfusionInput<B: Backend> {
    pub logits: Tensor<B, 4>,
    pub targets: Tensor<B, 3, Int>,
}

/// Precision, recall and F1 of one class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Confusion matrix over `num_classes` classes; rows are targets, columns
/// predictions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Number of pixels of class `target` predicted as `predicted`.
    pub fn count(&self, target: usize, predicted: usize) -> u64 {
        self.counts[target * self.num_classes + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Adds pairs of class indices.
    ///
    /// # Errors
    ///
    /// Fails on slices of different length or on a class index outside
    /// `0..num_classes`.
    pub fn update_indices(&mut self, predicted: &[i64], target: &[i64]) -> TrainResult<()> {
        if predicted.len() != target.len() {
            return Err(TrainError::Configuration {
                reason: format!(
                    "{} predictions but {} targets",
                    predicted.len(),
                    target.len()
                ),
            });
        }
        for (&p, &t) in predicted.iter().zip(target) {
            let p = self.class_index(p)?;
            let t = self.class_index(t)?;
            self.counts[t * self.num_classes + p] += 1;
        }
        Ok(())
    }

    fn class_index(&self, class: i64) -> TrainResult<usize> {
        usize::try_from(class)
            .ok()
            .filter(|&class| class < self.num_classes)
            .ok_or_else(|| TrainError::Configuration {
                reason: format!(
                    "class index {class} outside 0..{}",
                    self.num_classes
                ),
            })
    }

    /// Adds a batch, predicting the class with the highest logit.
    pub fn update<B: Backend>(&mut self, input: &ConfusionInput<B>) -> TrainResult<()> {
        let predicted = input.logits.clone().argmax(1).squeeze::<3>(1);
        let predicted = int_values(predicted)?;
        let targets = int_values(input.targets.clone())?;
        self.update_indices(&predicted, &targets)
    }

    /// Per-class scores; a score whose denominator is zero is reported as 0.
    pub fn class_scores(&self) -> Vec<ClassScores> {
        (0..self.num_classes)
            .map(|class| {
                let true_positives = self.count(class, class) as f64;
                let predicted: u64 = (0..self.num_classes).map(|t| self.count(t, class)).sum();
                let actual: u64 = (0..self.num_classes).map(|p| self.count(class, p)).sum();
                let precision = ratio(true_positives, predicted as f64);
                let recall = ratio(true_positives, actual as f64);
                ClassScores {
                    precision,
                    recall,
                    f1: ratio(2.0 * precision * recall, precision + recall),
                }
            })
            .collect()
    }

    /// Fraction of correctly classified pixels.
    pub fn accuracy(&self) -> f64 {
        let correct: u64 = (0..self.num_classes).map(|c| self.count(c, c)).sum();
        ratio(correct as f64, self.total() as f64)
    }

    /// Tab-separated matrix with class indices as header row and first
    /// column.
    pub fn to_tsv(&self) -> String {
        let mut tsv = String::new();
        for class in 0..self.num_classes {
            let _ = write!(tsv, "\t{class}");
        }
        tsv.push('\n');
        for target in 0..self.num_classes {
            let _ = write!(tsv, "{target}");
            for predicted in 0..self.num_classes {
                let _ = write!(tsv, "\t{}", self.count(target, predicted));
            }
            tsv.push('\n');
        }
        tsv
    }

    /// Writes the matrix to `{run_dir}/conf_mats/{split}/CM_epoch_{epoch}.txt`.
    pub fn save(&self, run_dir: &Path, split: Split, epoch: usize) -> TrainResult<PathBuf> {
        let dir = run_dir.join(CONF_MAT_DIR).join(split.dir_name());
        fs::create_dir_all(&dir).map_err(|source| TrainError::io(&dir, source))?;
        let path = dir.join(format!("CM_epoch_{epoch}.txt"));
        fs::write(&path, self.to_tsv()).map_err(|source| TrainError::io(&path, source))?;
        tracing::info!(
            %split,
            epoch,
            accuracy = self.accuracy(),
            path = %path.display(),
            "confusion matrix saved"
        );
        Ok(path)
    }

    pub fn reset(&mut self) {
        self.counts.fill(0);
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> TrainResult<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| TrainError::TensorData {
            reason: format!("{e:?}"),
        })
}
