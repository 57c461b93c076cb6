//! `divaseg`: cropped-patch semantic segmentation of document images with Burn.
//!
//! This crate ties the data pipeline and the training instrumentation
//! together and hosts the `divaseg` command-line tool.

pub mod backend;
pub mod commands;

#[doc(inline)]
pub use divaseg_data as data;
#[doc(inline)]
pub use divaseg_train as train;
