//! One-time sanity check that backbone and header fit the data.
//!
//! Runs the backbone and then the full model on a random batch with the data
//! module's input dimensions before any training compute is spent, so a
//! mismatched header fails immediately instead of mid-epoch.

use std::panic::{catch_unwind, AssertUnwindSafe};

use burn::{prelude::*, tensor::Distribution};

use crate::{
    error::{TrainError, TrainResult},
    model::BackboneHeaderModel,
};

/// Backbone/header compatibility check; passes at most once.
#[derive(Debug, Default)]
pub struct CompatibilityCheck {
    checked: bool,
}

impl CompatibilityCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_checked(&self) -> bool {
        self.checked
    }

    /// Runs the check unless it already passed.
    ///
    /// `dims` is `(channels, height, width)` of one input. The model output
    /// must be `[batch_size, num_classes, height, width]`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::ShapeMismatch`] if the backbone or the full model
    /// panics, or the output has the wrong shape.
    pub fn run<B, M>(
        &mut self,
        model: &M,
        batch_size: usize,
        dims: (usize, usize, usize),
        num_classes: usize,
        device: &B::Device,
    ) -> TrainResult<()>
    where
        B: Backend,
        M: BackboneHeaderModel<B>,
    {
        if self.checked {
            return Ok(());
        }
        let (channels, height, width) = dims;
        let input =
            Tensor::<B, 4>::random([batch_size, channels, height, width], Distribution::Default, device);

        let features = catch_unwind(AssertUnwindSafe(|| model.forward_backbone(input.clone())))
            .map_err(|payload| {
                let reason = panic_message(payload.as_ref());
                tracing::error!(?dims, %reason, "backbone failed on the input dimensions");
                TrainError::ShapeMismatch {
                    part: "backbone",
                    reason: format!("input of {dims:?} is not accepted: {reason}"),
                }
            })?;
        let feature_dims = features.dims();
        tracing::info!(?feature_dims, "backbone output");

        let output = catch_unwind(AssertUnwindSafe(|| model.forward(input))).map_err(|payload| {
            let reason = panic_message(payload.as_ref());
            tracing::error!(
                ?feature_dims,
                %reason,
                "backbone and header do not fit together; perhaps flatten the header input first"
            );
            TrainError::ShapeMismatch {
                part: "header",
                reason: format!("backbone output {feature_dims:?} is not accepted: {reason}"),
            }
        })?;

        let expected = [batch_size, num_classes, height, width];
        let actual = output.dims();
        if actual != expected {
            return Err(TrainError::ShapeMismatch {
                part: "header",
                reason: format!("output {actual:?}, expected {expected:?}"),
            });
        }

        self.checked = true;
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
