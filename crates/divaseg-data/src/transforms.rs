//! Image-only, target-only and twin (paired) transforms.

use image::{imageops, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{analytics::Analytics, index::CropCoordinate};

/// `ToTensor` followed by `Normalize(mean, std)`.
///
/// Produces channel-major (`[C, H, W]`) floats.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageTransform {
    pub fn new(mean: [f64; 3], std: [f64; 3]) -> Self {
        Self {
            mean: mean.map(|m| m as f32),
            // A constant channel has zero spread; leave it unscaled.
            std: std.map(|s| if s > f64::EPSILON { s as f32 } else { 1.0 }),
        }
    }

    pub fn from_analytics(analytics: &Analytics) -> Self {
        Self::new(analytics.mean, analytics.std)
    }

    pub fn apply(&self, image: &RgbImage) -> Vec<f32> {
        let plane = (image.width() * image.height()) as usize;
        let mut data = vec![0.0; plane * 3];
        for (position, pixel) in image.pixels().enumerate() {
            for channel in 0..3 {
                let value = f32::from(pixel.0[channel]) / 255.0;
                data[channel * plane + position] = (value - self.mean[channel]) / self.std[channel];
            }
        }
        data
    }
}

/// Turns a ground-truth color image into a `[num_classes, H, W]` one-hot map.
///
/// Colors that are not in the encoding table get an all-zero column.
#[derive(Debug, Clone)]
pub struct OneHotEncoding {
    class_encodings: Vec<[u8; 3]>,
}

impl OneHotEncoding {
    /// `class_encodings` must be sorted.
    pub fn new(class_encodings: Vec<[u8; 3]>) -> Self {
        debug_assert!(class_encodings.windows(2).all(|w| w[0] < w[1]));
        Self { class_encodings }
    }

    pub fn num_classes(&self) -> usize {
        self.class_encodings.len()
    }

    pub fn apply(&self, gt: &RgbImage) -> Vec<f32> {
        let plane = (gt.width() * gt.height()) as usize;
        let mut one_hot = vec![0.0; plane * self.num_classes()];
        for (position, pixel) in gt.pixels().enumerate() {
            if let Ok(class) = self.class_encodings.binary_search(&pixel.0) {
                one_hot[class * plane + position] = 1.0;
            }
        }
        one_hot
    }
}

/// Argmax over the class axis of a `[num_classes, H, W]` map.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneHotToPixelLabelling;

impl OneHotToPixelLabelling {
    pub fn apply(&self, one_hot: &[f32], num_classes: usize) -> Vec<i64> {
        if num_classes == 0 {
            return Vec::new();
        }
        let plane = one_hot.len() / num_classes;
        (0..plane)
            .map(|position| {
                let mut best = 0;
                for class in 1..num_classes {
                    if one_hot[class * plane + position] > one_hot[best * plane + position] {
                        best = class;
                    }
                }
                best as i64
            })
            .collect()
    }
}

/// One-hot encoding followed by pixel labelling, yielding class ids for a
/// cross-entropy criterion.
#[derive(Debug, Clone)]
pub struct TargetTransform {
    one_hot: OneHotEncoding,
    labelling: OneHotToPixelLabelling,
}

impl TargetTransform {
    pub fn new(class_encodings: Vec<[u8; 3]>) -> Self {
        Self {
            one_hot: OneHotEncoding::new(class_encodings),
            labelling: OneHotToPixelLabelling,
        }
    }

    pub fn from_analytics(analytics: &Analytics) -> Self {
        Self::new(analytics.class_encodings.clone())
    }

    pub fn num_classes(&self) -> usize {
        self.one_hot.num_classes()
    }

    pub fn apply(&self, gt: &RgbImage) -> Vec<i64> {
        self.labelling
            .apply(&self.one_hot.apply(gt), self.one_hot.num_classes())
    }
}

/// How the crop window is placed relative to the indexed tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropMode {
    /// A window drawn uniformly within half a crop of the tile, seeded by the
    /// dataset seed, the epoch and the crop's linear index.
    Random { seed: u64 },
    /// Exactly the indexed tile.
    Fixed,
}

/// Crops an image and its ground truth at the same window.
#[derive(Debug, Clone)]
pub struct TwinRandomCrop {
    crop_size: u32,
    mode: CropMode,
}

impl TwinRandomCrop {
    pub const fn new(crop_size: u32, mode: CropMode) -> Self {
        Self { crop_size, mode }
    }

    pub const fn crop_size(&self) -> u32 {
        self.crop_size
    }

    pub const fn mode(&self) -> CropMode {
        self.mode
    }

    /// Top-left corner `(row, col)` of the window used for `coordinate` on an
    /// image of `width` x `height` in `epoch`. The window never leaves the
    /// image.
    pub fn window(
        &self,
        coordinate: &CropCoordinate,
        index: usize,
        epoch: u64,
        width: u32,
        height: u32,
    ) -> (u32, u32) {
        match self.mode {
            CropMode::Fixed => (coordinate.row, coordinate.col),
            CropMode::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(crop_seed(seed, epoch, index));
                let row = jitter(&mut rng, coordinate.row, self.crop_size, height);
                let col = jitter(&mut rng, coordinate.col, self.crop_size, width);
                (row, col)
            }
        }
    }

    /// Cuts the window out of both images.
    pub fn apply(
        &self,
        image: &RgbImage,
        gt: &RgbImage,
        coordinate: &CropCoordinate,
        index: usize,
        epoch: u64,
    ) -> (RgbImage, RgbImage) {
        let (row, col) = self.window(coordinate, index, epoch, image.width(), image.height());
        let image = imageops::crop_imm(image, col, row, self.crop_size, self.crop_size).to_image();
        let gt = imageops::crop_imm(gt, col, row, self.crop_size, self.crop_size).to_image();
        (image, gt)
    }
}

fn crop_seed(seed: u64, epoch: u64, index: usize) -> u64 {
    // Golden-ratio stride keeps (epoch, index) pairs from colliding for
    // realistic dataset sizes.
    seed.wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(index as u64)
}

fn jitter(rng: &mut StdRng, origin: u32, crop: u32, extent: u32) -> u32 {
    let max_origin = extent.saturating_sub(crop);
    let low = origin.saturating_sub(crop / 2);
    let high = origin.saturating_add(crop / 2).min(max_origin);
    if low >= high {
        return low.min(max_origin);
    }
    rng.random_range(low..=high)
}
