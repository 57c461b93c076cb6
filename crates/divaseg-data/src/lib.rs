//! # divaseg-data
//!
//! Cropped-patch data pipeline for document image segmentation with Burn.
//!
//! ## Modules
//!
//! - `analytics`: per-channel normalization statistics, class encodings and
//!   class weights of a dataset, cached on disk.
//! - `index`: tiling of full pages into crops with stable linear indices.
//! - `dataset`: the cropped dataset and its batcher.
//! - `transforms`: image, target and twin (paired) transforms.
//! - `datamodule`: split setup, feasibility checks and data loaders.
//!
//! Datasets are expected in `{data_dir}/{train,val,test}/{data,gt}/`, with
//! images and ground truth paired by filename.

pub mod analytics;
pub mod cache;
pub mod config;
pub mod datamodule;
pub mod dataset;
pub mod error;
pub mod index;
pub mod transforms;

#[doc(inline)]
pub use analytics::{get_analytics, Analytics};
#[doc(inline)]
pub use config::{AnalyticsConfig, DataModuleConfig, ProcessRole, Selection, Split};
#[doc(inline)]
pub use datamodule::{
    DataModule, DataModuleState, DropLastBatchStrategy, LoaderPolicy, SampleCountWarning, Stage,
};
#[doc(inline)]
pub use dataset::{CropBatch, CropBatcher, CropItem, CroppedDataset};
#[doc(inline)]
pub use error::{DataError, DataResult};
#[doc(inline)]
pub use index::{CropCoordinate, CropRecord, CroppedPatchIndex};
