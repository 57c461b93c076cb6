//! The model shape the instrumentation works with.

use burn::prelude::*;

/// A segmentation network made of a feature-extracting backbone followed by a
/// classification header.
///
/// Backbone and header are saved separately so a trained backbone can be
/// reused under a different header.
pub trait BackboneHeaderModel<B: Backend>: Module<B> {
    type Backbone: Module<B>;
    type Header: Module<B>;

    fn backbone(&self) -> &Self::Backbone;

    fn header(&self) -> &Self::Header;

    /// Feature maps of the backbone alone.
    fn forward_backbone(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Class logits `[batch, num_classes, height, width]`.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;
}
