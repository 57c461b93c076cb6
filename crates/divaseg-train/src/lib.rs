//! # divaseg-train
//!
//! Training-loop instrumentation for cropped-patch segmentation models:
//!
//! - [`CheckpointWriter`]: separate backbone and header weight files per epoch.
//! - [`CompatibilityCheck`]: verifies once that backbone, header and input
//!   dimensions fit together.
//! - [`ConfusionMatrix`]: pixel-level confusion matrix with per-class scores,
//!   saved as TSV.
//! - [`save_prediction_patches`]: dumps test predictions per crop so they can
//!   be stitched back into full pages.
//!
//! All of it works on any model implementing [`BackboneHeaderModel`].

pub mod checkpoint;
pub mod compatibility;
pub mod confusion;
pub mod error;
pub mod model;
pub mod outputs;

#[doc(inline)]
pub use checkpoint::{CheckpointConfig, CheckpointKind, CheckpointWriter, SavedCheckpoint};
#[doc(inline)]
pub use compatibility::CompatibilityCheck;
#[doc(inline)]
pub use confusion::{ClassScores, ConfusionInput, ConfusionMatrix};
#[doc(inline)]
pub use error::{TrainError, TrainResult};
#[doc(inline)]
pub use model::BackboneHeaderModel;
#[doc(inline)]
pub use outputs::{reduce_outputs, save_prediction_patches, OutputKey};
