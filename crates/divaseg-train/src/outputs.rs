//! Step outputs and prediction dumps.

use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
};
use divaseg_data::DataModule;

use crate::error::{TrainError, TrainResult};

/// Keys of the map a training, validation or test step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputKey {
    Prediction,
    Target,
    Log,
    Loss,
}

impl OutputKey {
    pub const ALL: [Self; 4] = [Self::Prediction, Self::Target, Self::Log, Self::Loss];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prediction => "pred",
            Self::Target => "target",
            Self::Log => "logs",
            Self::Loss => "loss",
        }
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKey {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| TrainError::Configuration {
                reason: format!("unknown output key \"{s}\""),
            })
    }
}

/// Keeps the entries of `outputs` whose key is in `keys`; absent keys are
/// skipped.
pub fn reduce_outputs<V>(
    mut outputs: HashMap<OutputKey, V>,
    keys: &[OutputKey],
) -> HashMap<OutputKey, V> {
    outputs.retain(|key, _| keys.contains(key));
    outputs
}

/// Writes every crop prediction of a test batch to
/// `{root}/patches/{image_name}/{patch_name}.mpk`.
///
/// `predictions` is `[batch, num_classes, size, size]`, `indices` holds the
/// linear crop index of each batch entry. Returns the written files.
///
/// # Errors
///
/// Fails with [`divaseg_data::DataError::State`] if the test split has not
/// been set up, and on mismatched batch sizes or I/O failures.
pub fn save_prediction_patches<B: Backend>(
    datamodule: &DataModule,
    root: &Path,
    predictions: Tensor<B, 4>,
    indices: Tensor<B, 1, Int>,
) -> TrainResult<Vec<PathBuf>> {
    let indices = indices
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| TrainError::TensorData {
            reason: format!("{e:?}"),
        })?;
    let [batch_size, ..] = predictions.dims();
    if batch_size != indices.len() {
        return Err(TrainError::Configuration {
            reason: format!(
                "{batch_size} predictions but {} crop indices",
                indices.len()
            ),
        });
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let mut written = Vec::with_capacity(batch_size);
    for (position, index) in indices.into_iter().enumerate() {
        let index = usize::try_from(index).map_err(|_| TrainError::Configuration {
            reason: format!("negative crop index {index}"),
        })?;
        let record = datamodule.test_record(index)?;
        let folder = root.join("patches").join(&record.image_name);
        fs::create_dir_all(&folder).map_err(|source| TrainError::io(&folder, source))?;
        let path = folder.join(format!("{}.mpk", record.patch_name()));

        let patch = predictions
            .clone()
            .narrow(0, position, 1)
            .squeeze::<3>(0);
        Recorder::<B>::record(&recorder, patch, path.clone()).map_err(|source| {
            TrainError::Record {
                path: path.clone(),
                source,
            }
        })?;
        tracing::debug!(index, path = %path.display(), "prediction patch saved");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArray;
    use divaseg_data::{DataModuleConfig, ProcessRole, Stage};
    use image::{Rgb, RgbImage};

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn output_keys_use_their_short_names() {
        let names: Vec<_> = OutputKey::ALL.iter().map(ToString::to_string).collect();

        assert_eq!(names, vec!["pred", "target", "logs", "loss"]);
        assert_eq!("loss".parse::<OutputKey>().unwrap(), OutputKey::Loss);
        assert!("prediction".parse::<OutputKey>().is_err());
    }

    #[test]
    fn reduce_keeps_requested_present_keys() {
        let outputs = HashMap::from([
            (OutputKey::Prediction, 1),
            (OutputKey::Target, 2),
            (OutputKey::Loss, 3),
        ]);

        let reduced = reduce_outputs(outputs, &[OutputKey::Prediction, OutputKey::Log]);

        assert_eq!(reduced, HashMap::from([(OutputKey::Prediction, 1)]));
    }

    fn datamodule(root: &Path) -> DataModule {
        for split in ["train", "val", "test"] {
            let dir = root.join(split);
            std::fs::create_dir_all(dir.join("data")).unwrap();
            std::fs::create_dir_all(dir.join("gt")).unwrap();
            RgbImage::from_pixel(8, 4, Rgb([90, 90, 90]))
                .save(dir.join("data/page.png"))
                .unwrap();
            RgbImage::from_fn(8, 4, |x, _| Rgb([0, 0, if x < 4 { 1 } else { 2 }]))
                .save(dir.join("gt/page.png"))
                .unwrap();
        }
        let config = DataModuleConfig::new(root.display().to_string())
            .with_crop_size(4)
            .with_batch_size(1)
            .with_num_workers(0);
        DataModule::new(config, ProcessRole::Coordinator).unwrap()
    }

    #[test]
    fn predictions_are_written_per_crop() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut module = datamodule(data.path());
        module.setup(Stage::Test).unwrap();
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::ones([2, 2, 4, 4], &device);
        let indices = Tensor::<TestBackend, 1, Int>::from_data([1, 0], &device);

        let written = save_prediction_patches(&module, out.path(), predictions, indices).unwrap();

        let folder = out.path().join("patches").join("page.png");
        assert_eq!(
            written,
            vec![
                folder.join("page_x0004_y0000.mpk"),
                folder.join("page_x0000_y0000.mpk"),
            ]
        );
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let patch: Tensor<TestBackend, 3> =
            Recorder::<TestBackend>::load(&recorder, written[0].clone(), &device).unwrap();
        assert_eq!(patch.dims(), [2, 4, 4]);
    }

    #[test]
    fn prediction_dump_needs_the_test_split() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut module = datamodule(data.path());
        module.setup(Stage::Fit).unwrap();
        let device = Default::default();
        let predictions = Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device);
        let indices = Tensor::<TestBackend, 1, Int>::from_data([0], &device);

        let result = save_prediction_patches(&module, out.path(), predictions, indices);

        assert!(matches!(result, Err(TrainError::Data(_))));
    }
}
