//! Configuration structures for the data pipeline.
//!
//! Every knob the data module reads is an explicit field here; nothing is
//! resolved by name at runtime.

use burn::prelude::*;

/// Which images of a split get indexed.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Every image in the split.
    All,
    /// The first `n` images in sorted filename order.
    First(usize),
    /// Exactly the named image files.
    Names(Vec<String>),
}

impl Default for Selection {
    fn default() -> Self {
        Self::All
    }
}

/// One of the three dataset splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    /// Directory name of the split below the dataset root.
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl core::fmt::Display for Split {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Settings of the analytics pass over the training ground truth.
#[derive(Config, Debug)]
pub struct AnalyticsConfig {
    /// Upper bound on the number of distinct ground-truth colors. More colors
    /// than this almost always means the ground truth was resampled with a
    /// smoothing filter.
    #[config(default = 64)]
    pub max_classes: usize,
    /// Fixed class colors. When set, the colors are not discovered from the
    /// ground truth and any other color found there is an error.
    #[config(default = "None")]
    pub class_encodings: Option<Vec<[u8; 3]>>,
    /// Directory for the cache file. Defaults to the dataset root.
    #[config(default = "None")]
    pub cache_dir: Option<String>,
    #[config(default = "\"analytics.json\".to_string()")]
    pub cache_file_name: String,
}

/// Settings of the cropped data module.
#[derive(Config, Debug)]
pub struct DataModuleConfig {
    /// Dataset root containing `train`, `val` and `test`.
    pub data_dir: String,
    #[config(default = "Selection::All")]
    pub selection_train: Selection,
    #[config(default = "Selection::All")]
    pub selection_val: Selection,
    #[config(default = "Selection::All")]
    pub selection_test: Selection,
    /// Edge length of the square crops.
    #[config(default = 256)]
    pub crop_size: u32,
    /// Data loader worker threads per process.
    #[config(default = 4)]
    pub num_workers: usize,
    /// Batch size per process.
    #[config(default = 8)]
    pub batch_size: usize,
    /// Number of training processes sharing the dataset.
    #[config(default = 1)]
    pub num_processes: usize,
    #[config(default = true)]
    pub shuffle: bool,
    #[config(default = true)]
    pub drop_last_batch: bool,
    /// Seed for shuffling and random crops.
    #[config(default = 42)]
    pub seed: u64,
    /// Number of decoded image/ground-truth pairs kept per dataset.
    #[config(default = 8)]
    pub image_cache_size: usize,
    #[config(default = "AnalyticsConfig::new()")]
    pub analytics: AnalyticsConfig,
}

/// Whether this process may mutate shared files (cache files, checkpoints).
///
/// Passed in explicitly by whoever launches the process; in a multi-process
/// run exactly one process should be the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessRole {
    #[default]
    Coordinator,
    Worker,
}

impl ProcessRole {
    pub const fn is_coordinator(self) -> bool {
        matches!(self, Self::Coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_training_setup() {
        let config = DataModuleConfig::new("data/CB55".to_string());

        assert_eq!(config.crop_size, 256);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.num_processes, 1);
        assert!(config.shuffle);
        assert!(config.drop_last_batch);
        assert_eq!(config.selection_train, Selection::All);
        assert_eq!(config.analytics.max_classes, 64);
        assert_eq!(config.analytics.cache_file_name, "analytics.json");
    }

    #[test]
    fn config_survives_json_round_trip() {
        let config = DataModuleConfig::new("data/CB55".to_string())
            .with_selection_train(Selection::First(3))
            .with_selection_test(Selection::Names(vec!["e-codices_001.png".to_string()]))
            .with_crop_size(128);

        let json = serde_json::to_string(&config).unwrap();
        let restored: DataModuleConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.selection_train, Selection::First(3));
        assert_eq!(
            restored.selection_test,
            Selection::Names(vec!["e-codices_001.png".to_string()])
        );
        assert_eq!(restored.crop_size, 128);
    }

    #[test]
    fn split_directories() {
        assert_eq!(Split::Train.dir_name(), "train");
        assert_eq!(Split::Val.to_string(), "val");
        assert_eq!(Split::Test.dir_name(), "test");
    }
}
