//! Data module orchestrating analytics, per-split datasets and data loaders.
//!
//! The lifecycle is an explicit state machine:
//!
//! ```text
//! Unconfigured --prepare_analytics--> AnalyticsReady --setup(stage)--> SplitReady { fit, test }
//! ```
//!
//! `setup` can be called again from `SplitReady` to add the other stage.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{
        dataloader::{
            batcher::Batcher, BatchDataLoader, BatchStrategy, DataLoader, FixBatchStrategy,
            MultiThreadDataLoader,
        },
        dataset::Dataset,
    },
    tensor::backend::Backend,
};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    analytics::{get_analytics, training_pairs, Analytics},
    config::{DataModuleConfig, ProcessRole, Split},
    dataset::{CropBatch, CropBatcher, CropItem, CroppedDataset},
    error::{DataError, DataResult},
    index::{CropCoordinate, CropRecord, CroppedPatchIndex, GT_DIR, IMAGE_DIR},
    transforms::{CropMode, ImageTransform, TargetTransform, TwinRandomCrop},
};

/// Which splits `setup` builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Train and val.
    Fit,
    /// Test only.
    Test,
    /// Train, val and test.
    All,
}

/// Lifecycle state of a [`DataModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataModuleState {
    Unconfigured,
    AnalyticsReady,
    SplitReady { fit: bool, test: bool },
}

/// Recorded when a split has fewer samples than one batch on every process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleCountWarning {
    pub split: Split,
    pub num_samples: usize,
    pub num_processes: usize,
    pub batch_size: usize,
}

/// Shuffle and drop policy of a split's data loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderPolicy {
    pub shuffle: bool,
    pub drop_last: bool,
}

/// Fixed-size batching that discards an incomplete remainder.
///
/// Burn's [`FixBatchStrategy`] flushes the remainder when the iterator is
/// exhausted; this strategy drops it instead. Every worker of a multi-threaded
/// loader batches its own shard, so each worker drops its own remainder.
pub struct DropLastBatchStrategy<I> {
    items: Vec<I>,
    batch_size: usize,
}

impl<I> DropLastBatchStrategy<I> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: Vec::with_capacity(batch_size),
            batch_size,
        }
    }
}

impl<I: Send + 'static> BatchStrategy<I> for DropLastBatchStrategy<I> {
    fn add(&mut self, item: I) {
        self.items.push(item);
    }

    fn batch(&mut self, force: bool) -> Option<Vec<I>> {
        if self.items.len() < self.batch_size {
            if force && !self.items.is_empty() {
                tracing::trace!(dropped = self.items.len(), "dropping incomplete batch");
                self.items.clear();
            }
            return None;
        }
        Some(std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.batch_size),
        ))
    }

    fn clone_dyn(&self) -> Box<dyn BatchStrategy<I>> {
        Box::new(Self::new(self.batch_size))
    }
}

/// Checks that every process can draw at least one batch from a split.
///
/// With `drop_last` a split smaller than `num_processes * batch_size` would
/// leave some process without a single batch, which is an error. Without
/// `drop_last` a distributed sampler repeats samples to fill the batches;
/// that is allowed and reported as a warning. Equality is feasible.
///
/// # Errors
///
/// Returns [`DataError::Configuration`] for the infeasible `drop_last` case.
pub fn check_min_num_samples(
    num_samples: usize,
    split: Split,
    num_processes: usize,
    batch_size: usize,
    drop_last: bool,
) -> DataResult<Option<SampleCountWarning>> {
    let required = num_processes.saturating_mul(batch_size);
    if num_samples >= required {
        return Ok(None);
    }
    if drop_last {
        tracing::error!(
            %split,
            num_samples,
            num_processes,
            batch_size,
            "split has fewer samples than processes times batch size; only possible without drop_last_batch"
        );
        return Err(DataError::configuration(format!(
            "#samples ({num_samples}) in \"{split}\" smaller than #processes ({num_processes}) \
             times batch size ({batch_size}); this only works if drop_last_batch is false"
        )));
    }
    tracing::warn!(
        %split,
        num_samples,
        num_processes,
        batch_size,
        "split has fewer samples than processes times batch size; samples will occur multiple times"
    );
    Ok(Some(SampleCountWarning {
        split,
        num_samples,
        num_processes,
        batch_size,
    }))
}

/// Checks the `{train,val,test}/{data,gt}` layout below `data_dir`.
///
/// # Errors
///
/// Returns [`DataError::DirectoryNotFound`] for the first missing directory.
pub fn validate_path_for_segmentation(data_dir: &Path) -> DataResult<PathBuf> {
    if !data_dir.is_dir() {
        return Err(DataError::DirectoryNotFound {
            path: data_dir.to_path_buf(),
        });
    }
    for split in [Split::Train, Split::Val, Split::Test] {
        for sub in [IMAGE_DIR, GT_DIR] {
            let path = data_dir.join(split.dir_name()).join(sub);
            if !path.is_dir() {
                return Err(DataError::DirectoryNotFound { path });
            }
        }
    }
    Ok(data_dir.to_path_buf())
}

/// Analytics and the transforms derived from them.
#[derive(Debug, Clone)]
struct Prepared {
    analytics: Analytics,
    image_transform: ImageTransform,
    target_transform: TargetTransform,
}

/// Cropped-patch data module.
#[derive(Debug)]
pub struct DataModule {
    config: DataModuleConfig,
    role: ProcessRole,
    data_dir: PathBuf,
    state: DataModuleState,
    prepared: Option<Prepared>,
    train: Option<Arc<CroppedDataset>>,
    val: Option<Arc<CroppedDataset>>,
    test: Option<Arc<CroppedDataset>>,
    warnings: Vec<SampleCountWarning>,
}

impl DataModule {
    /// Validates the dataset layout and computes the analytics.
    ///
    /// # Errors
    ///
    /// Fails on a malformed dataset layout or when the analytics cannot be
    /// computed; see [`get_analytics`].
    pub fn new(config: DataModuleConfig, role: ProcessRole) -> DataResult<Self> {
        let mut module = Self::unconfigured(config, role)?;
        module.prepare_analytics()?;
        Ok(module)
    }

    /// Validates the dataset layout without touching any image.
    pub fn unconfigured(config: DataModuleConfig, role: ProcessRole) -> DataResult<Self> {
        if config.crop_size == 0 || config.batch_size == 0 || config.num_processes == 0 {
            return Err(DataError::configuration(
                "crop_size, batch_size and num_processes must be positive",
            ));
        }
        let data_dir = validate_path_for_segmentation(Path::new(&config.data_dir))?;
        Ok(Self {
            config,
            role,
            data_dir,
            state: DataModuleState::Unconfigured,
            prepared: None,
            train: None,
            val: None,
            test: None,
            warnings: Vec::new(),
        })
    }

    /// `Unconfigured -> AnalyticsReady`. A no-op in later states.
    pub fn prepare_analytics(&mut self) -> DataResult<()> {
        if self.state != DataModuleState::Unconfigured {
            return Ok(());
        }
        let analytics = get_analytics(
            &self.data_dir,
            training_pairs,
            &self.config.analytics,
            self.role,
        )?;
        self.prepared = Some(Prepared {
            image_transform: ImageTransform::from_analytics(&analytics),
            target_transform: TargetTransform::from_analytics(&analytics),
            analytics,
        });
        self.state = DataModuleState::AnalyticsReady;
        Ok(())
    }

    /// Builds the datasets of `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::State`] before the analytics are ready and the
    /// indexing and feasibility errors of the built splits.
    pub fn setup(&mut self, stage: Stage) -> DataResult<()> {
        let (mut fit, mut test) = match self.state {
            DataModuleState::Unconfigured => {
                return Err(DataError::state(
                    "analytics must be computed before setting up splits",
                ))
            }
            DataModuleState::AnalyticsReady => (false, false),
            DataModuleState::SplitReady { fit, test } => (fit, test),
        };

        if matches!(stage, Stage::Fit | Stage::All) {
            let train = self.build_dataset(Split::Train)?;
            let val = self.build_dataset(Split::Val)?;
            self.warnings.retain(|w| w.split == Split::Test);
            for (split, dataset) in [(Split::Train, &train), (Split::Val, &val)] {
                if let Some(warning) = check_min_num_samples(
                    dataset.index().len(),
                    split,
                    self.config.num_processes,
                    self.config.batch_size,
                    self.config.drop_last_batch,
                )? {
                    self.warnings.push(warning);
                }
            }
            self.train = Some(train);
            self.val = Some(val);
            fit = true;
        }

        if matches!(stage, Stage::Test | Stage::All) {
            self.test = Some(self.build_dataset(Split::Test)?);
            test = true;
        }

        self.state = DataModuleState::SplitReady { fit, test };
        Ok(())
    }

    fn build_dataset(&self, split: Split) -> DataResult<Arc<CroppedDataset>> {
        let prepared = self.prepared()?;
        let selection = match split {
            Split::Train => &self.config.selection_train,
            Split::Val => &self.config.selection_val,
            Split::Test => &self.config.selection_test,
        };
        let index = CroppedPatchIndex::build(
            &self.data_dir.join(split.dir_name()),
            selection,
            self.config.crop_size,
        )?;
        tracing::info!(
            %split,
            images = index.pairs().len(),
            crops = index.len(),
            crop_size = self.config.crop_size,
            "split indexed"
        );

        let is_test = split == Split::Test;
        let mode = if is_test {
            CropMode::Fixed
        } else {
            CropMode::Random {
                seed: self.config.seed,
            }
        };
        Ok(Arc::new(CroppedDataset::new(
            index,
            prepared.image_transform.clone(),
            prepared.target_transform.clone(),
            TwinRandomCrop::new(self.config.crop_size, mode),
            is_test,
            self.config.image_cache_size,
        )))
    }

    fn prepared(&self) -> DataResult<&Prepared> {
        self.prepared
            .as_ref()
            .ok_or_else(|| DataError::state("analytics have not been computed"))
    }

    pub const fn state(&self) -> DataModuleState {
        self.state
    }

    pub const fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub const fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Input dimensions `(channels, crop_size, crop_size)`.
    pub const fn dims(&self) -> (usize, usize, usize) {
        let size = self.config.crop_size as usize;
        (3, size, size)
    }

    pub fn analytics(&self) -> DataResult<&Analytics> {
        self.prepared().map(|prepared| &prepared.analytics)
    }

    pub fn num_classes(&self) -> DataResult<usize> {
        self.analytics().map(Analytics::num_classes)
    }

    pub fn class_weights(&self) -> DataResult<&[f64]> {
        self.analytics().map(|a| a.class_weights.as_slice())
    }

    /// Sample-count warnings raised by the last `setup` of each split.
    pub fn warnings(&self) -> &[SampleCountWarning] {
        &self.warnings
    }

    /// The dataset of `split`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::State`] if the split has not been set up.
    pub fn dataset(&self, split: Split) -> DataResult<&Arc<CroppedDataset>> {
        let dataset = match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        };
        dataset
            .as_ref()
            .ok_or_else(|| DataError::state(format!("split \"{split}\" has not been set up")))
    }

    /// Sets the epoch of the train and val datasets, which reseeds their
    /// random crops. Test crops are fixed and ignore the epoch.
    pub fn set_epoch(&self, epoch: u64) {
        for dataset in [&self.train, &self.val].into_iter().flatten() {
            dataset.set_epoch(epoch);
        }
        tracing::debug!(epoch, "data module epoch set");
    }

    /// Shuffle/drop policy of a split: train follows the configuration, val
    /// mirrors train, test never shuffles and never drops.
    pub const fn loader_policy(&self, split: Split) -> LoaderPolicy {
        match split {
            Split::Train | Split::Val => LoaderPolicy {
                shuffle: self.config.shuffle,
                drop_last: self.config.drop_last_batch,
            },
            Split::Test => LoaderPolicy {
                shuffle: false,
                drop_last: false,
            },
        }
    }

    pub fn train_dataloader<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DataResult<Arc<dyn DataLoader<B, CropBatch<B>>>> {
        self.dataloader(Split::Train, device)
    }

    pub fn val_dataloader<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DataResult<Arc<dyn DataLoader<B, CropBatch<B>>>> {
        self.dataloader(Split::Val, device)
    }

    pub fn test_dataloader<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DataResult<Arc<dyn DataLoader<B, CropBatch<B>>>> {
        self.dataloader(Split::Test, device)
    }

    /// Data loader of `split` following [`Self::loader_policy`].
    ///
    /// Shuffling reseeds every epoch from a generator seeded with the
    /// configured seed, so the dropped remainder changes between epochs.
    pub fn dataloader<B: Backend>(
        &self,
        split: Split,
        device: &B::Device,
    ) -> DataResult<Arc<dyn DataLoader<B, CropBatch<B>>>> {
        let dataset: Arc<dyn Dataset<CropItem>> = self.dataset(split)?.clone();
        let policy = self.loader_policy(split);
        let batch_size = self.config.batch_size;

        let strategy: Box<dyn BatchStrategy<CropItem>> = if policy.drop_last {
            Box::new(DropLastBatchStrategy::new(batch_size))
        } else {
            Box::new(FixBatchStrategy::new(batch_size))
        };
        let batcher: Arc<dyn Batcher<B, CropItem, CropBatch<B>>> =
            Arc::new(CropBatcher::<B>::new());
        let rng = policy
            .shuffle
            .then(|| StdRng::seed_from_u64(self.config.seed));

        tracing::debug!(
            %split,
            batch_size,
            shuffle = policy.shuffle,
            drop_last = policy.drop_last,
            num_workers = self.config.num_workers,
            "building data loader"
        );
        // Zero workers loads on the calling thread.
        let loader: Arc<dyn DataLoader<B, CropBatch<B>>> = if self.config.num_workers > 0 {
            Arc::new(MultiThreadDataLoader::new(
                strategy,
                dataset,
                batcher,
                self.config.num_workers,
                device.clone(),
                rng,
            ))
        } else {
            Arc::new(BatchDataLoader::new(
                strategy,
                dataset,
                batcher,
                device.clone(),
                rng,
            ))
        };
        Ok(loader)
    }

    /// Source page and position of test crop `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::State`] if the test split has not been set up.
    pub fn get_img_name_coordinates(&self, index: usize) -> DataResult<(&str, CropCoordinate)> {
        self.test_split()?.get_img_name_coordinates(index)
    }

    /// Full record of test crop `index`.
    pub fn test_record(&self, index: usize) -> DataResult<&CropRecord> {
        self.test_split()?.test_record(index)
    }

    fn test_split(&self) -> DataResult<&CroppedDataset> {
        self.test.as_deref().ok_or_else(|| {
            DataError::state("crop provenance can only be queried after setting up the test split")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infeasible_split_fails_with_drop_last() {
        let result = check_min_num_samples(10, Split::Train, 4, 4, true);

        assert!(matches!(result, Err(DataError::Configuration { .. })));
    }

    #[test]
    fn infeasible_split_warns_without_drop_last() {
        let warning = check_min_num_samples(10, Split::Val, 4, 4, false).unwrap();

        assert_eq!(
            warning,
            Some(SampleCountWarning {
                split: Split::Val,
                num_samples: 10,
                num_processes: 4,
                batch_size: 4,
            })
        );
    }

    #[test]
    fn exactly_one_batch_per_process_is_feasible() {
        assert_eq!(check_min_num_samples(16, Split::Train, 4, 4, true).unwrap(), None);
        assert_eq!(check_min_num_samples(17, Split::Train, 4, 4, false).unwrap(), None);
    }

    fn drain(mut strategy: Box<dyn BatchStrategy<usize>>, items: usize) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();
        for item in 0..items {
            strategy.add(item);
            if let Some(batch) = strategy.batch(false) {
                batches.push(batch);
            }
        }
        batches.extend(strategy.batch(true));
        batches
    }

    #[test]
    fn drop_last_strategy_discards_the_remainder() {
        let batches = drain(Box::new(DropLastBatchStrategy::new(3)), 7);

        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn drop_last_strategy_keeps_exact_multiples() {
        let strategy = DropLastBatchStrategy::<usize>::new(2).clone_dyn();

        assert_eq!(drain(strategy, 4), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(
            drain(Box::new(FixBatchStrategy::new(3)), 4),
            vec![vec![0, 1, 2], vec![3]]
        );
    }

    #[test]
    fn missing_split_layout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("train/data")).unwrap();

        let result = validate_path_for_segmentation(dir.path());

        assert!(matches!(result, Err(DataError::DirectoryNotFound { .. })));
    }
}
