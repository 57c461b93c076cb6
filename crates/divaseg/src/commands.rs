//! Implementations of the `divaseg` subcommands.
//!
//! Each command returns its report as a string; the binary prints it.

use std::{fmt::Write as _, path::Path};

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use divaseg_data::{
    analytics::{get_analytics, training_pairs},
    datamodule::validate_path_for_segmentation,
    AnalyticsConfig, CroppedPatchIndex, DataModule, DataModuleConfig, ProcessRole, Selection,
    Split, Stage,
};

use crate::backend::{create_device, BACKEND_NAME};

/// Computes (or loads from cache) the analytics of a dataset and renders them
/// as pretty JSON.
///
/// # Errors
///
/// Returns an error if the dataset layout is invalid or the analytics cannot
/// be computed.
pub fn analytics_report(
    data_dir: &Path,
    config: &AnalyticsConfig,
    role: ProcessRole,
) -> Result<String> {
    let data_dir = validate_path_for_segmentation(data_dir)?;
    let analytics = get_analytics(&data_dir, training_pairs, config, role)
        .with_context(|| format!("failed to get analytics of {}", data_dir.display()))?;
    Ok(serde_json::to_string_pretty(&analytics)?)
}

/// Lists the crops of one split as tab-separated
/// `index, image, row, col, size` lines with a header.
///
/// # Errors
///
/// Returns an error if the split cannot be indexed with `crop_size`.
pub fn index_report(
    data_dir: &Path,
    split: Split,
    crop_size: u32,
    selection: &Selection,
) -> Result<String> {
    let split_dir = data_dir.join(split.dir_name());
    let index = CroppedPatchIndex::build(&split_dir, selection, crop_size)
        .with_context(|| format!("failed to index {}", split_dir.display()))?;

    let mut report = String::from("index\timage\trow\tcol\tsize\n");
    for record in index.records() {
        let coordinate = record.coordinate;
        writeln!(
            report,
            "{}\t{}\t{}\t{}\t{}",
            record.index, record.image_name, coordinate.row, coordinate.col, coordinate.size
        )?;
    }
    tracing::info!(
        %split,
        images = index.pairs().len(),
        crops = index.len(),
        "split indexed"
    );
    Ok(report)
}

/// Sets up every split of a data module and drains each data loader once on
/// `device`, reporting crops, batches and the size of the last batch per
/// split as tab-separated lines with a header.
///
/// # Errors
///
/// Returns an error if the data module cannot be set up, for instance when a
/// split is too small for the batch size with `drop_last_batch`.
pub fn loader_report<B: Backend>(
    config: DataModuleConfig,
    role: ProcessRole,
    device: &B::Device,
) -> Result<String> {
    let data_dir = config.data_dir.clone();
    let mut module = DataModule::new(config, role)
        .with_context(|| format!("failed to prepare the data module of {data_dir}"))?;
    module.setup(Stage::All)?;

    let mut report = String::from("split\tcrops\tbatches\tloaded\tlast_batch\n");
    for split in [Split::Train, Split::Val, Split::Test] {
        let crops = module.dataset(split)?.index().len();
        let loader = module.dataloader::<B>(split, device)?;
        let sizes: Vec<usize> = loader.iter().map(|batch| batch.images.dims()[0]).collect();
        let loaded: usize = sizes.iter().sum();
        let last = sizes.last().copied().unwrap_or(0);
        writeln!(report, "{split}\t{crops}\t{}\t{loaded}\t{last}", sizes.len())?;
    }
    for warning in module.warnings() {
        tracing::warn!(
            split = %warning.split,
            num_samples = warning.num_samples,
            "split repeats samples to fill the batches of every process"
        );
    }
    Ok(report)
}

/// Backend, device and version information.
pub fn info_report() -> String {
    format!(
        "divaseg {}\n  Backend: {}\n  Device: {:?}\n",
        env!("CARGO_PKG_VERSION"),
        BACKEND_NAME,
        create_device()
    )
}
