//! Cropped-patch dataset and its batcher.
//!
//! Following Burn's convention the dataset returns raw data; the batcher
//! creates tensors on the target device.

use std::{
    marker::PhantomData,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::TensorData,
};
use image::RgbImage;

use crate::{
    cache::{DecodedPair, ImageCache},
    error::{DataError, DataResult},
    index::{CropCoordinate, CropRecord, CroppedPatchIndex},
    transforms::{CropMode, ImageTransform, TargetTransform, TwinRandomCrop},
};

/// One crop after all transforms.
#[derive(Debug, Clone)]
pub struct CropItem {
    /// Normalized image data, `[3, size, size]` channel-major.
    pub image: Vec<f32>,
    /// Class id per pixel, `[size, size]` row-major.
    pub target: Vec<i64>,
    /// Linear index of the crop; recovers its provenance in test mode.
    pub index: usize,
    /// Edge length of the crop.
    pub size: usize,
}

/// A batch of crops.
#[derive(Debug, Clone)]
pub struct CropBatch<B: Backend> {
    /// `[batch, 3, size, size]`
    pub images: Tensor<B, 4>,
    /// `[batch, size, size]`
    pub targets: Tensor<B, 3, Int>,
    /// `[batch]`
    pub indices: Tensor<B, 1, Int>,
}

/// Stacks [`CropItem`]s into a [`CropBatch`].
#[derive(Clone, Default)]
pub struct CropBatcher<B: Backend> {
    _phantom: PhantomData<B>,
}

impl<B: Backend> CropBatcher<B> {
    pub const fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, CropItem, CropBatch<B>> for CropBatcher<B> {
    fn batch(&self, items: Vec<CropItem>, device: &B::Device) -> CropBatch<B> {
        let batch_size = items.len();
        let mut images = Vec::with_capacity(batch_size);
        let mut targets = Vec::with_capacity(batch_size);
        let mut indices = Vec::with_capacity(batch_size);

        for item in items {
            let size = item.size;
            images.push(Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [3, size, size]),
                device,
            ));
            targets.push(Tensor::<B, 2, Int>::from_data(
                TensorData::new(item.target, [size, size]),
                device,
            ));
            indices.push(item.index as i64);
        }

        CropBatch {
            images: Tensor::stack(images, 0),
            targets: Tensor::stack(targets, 0),
            indices: Tensor::from_data(TensorData::new(indices, [batch_size]), device),
        }
    }
}

/// Crops of one split, loaded lazily from the full pages.
#[derive(Debug)]
pub struct CroppedDataset {
    index: CroppedPatchIndex,
    image_transform: ImageTransform,
    target_transform: TargetTransform,
    twin_transform: TwinRandomCrop,
    is_test: bool,
    cache: ImageCache,
    epoch: AtomicU64,
}

impl CroppedDataset {
    /// Creates the dataset over an index.
    ///
    /// In test mode the twin transform always cuts the exact indexed tile, so
    /// predictions can be put back where they came from.
    pub fn new(
        index: CroppedPatchIndex,
        image_transform: ImageTransform,
        target_transform: TargetTransform,
        twin_transform: TwinRandomCrop,
        is_test: bool,
        cache_size: usize,
    ) -> Self {
        let twin_transform = if is_test {
            TwinRandomCrop::new(twin_transform.crop_size(), CropMode::Fixed)
        } else {
            twin_transform
        };
        Self {
            index,
            image_transform,
            target_transform,
            twin_transform,
            is_test,
            cache: ImageCache::new(cache_size),
            epoch: AtomicU64::new(0),
        }
    }

    /// Sets the epoch mixed into the random crop seed, so the jitter of a
    /// crop changes from one epoch to the next.
    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub const fn is_test(&self) -> bool {
        self.is_test
    }

    pub fn index(&self) -> &CroppedPatchIndex {
        &self.index
    }

    pub fn record(&self, index: usize) -> Option<&CropRecord> {
        self.index.get(index)
    }

    /// Record of crop `index`, including its provenance.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::State`] outside test mode, where crops are jittered
    /// and do not map back to a fixed position.
    pub fn test_record(&self, index: usize) -> DataResult<&CropRecord> {
        if !self.is_test {
            return Err(DataError::state(
                "crop provenance is only available for the test split",
            ));
        }
        self.index.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            len: self.index.len(),
        })
    }

    /// File name of the source page and position of crop `index`.
    ///
    /// # Errors
    ///
    /// See [`Self::test_record`].
    pub fn get_img_name_coordinates(&self, index: usize) -> DataResult<(&str, CropCoordinate)> {
        let record = self.test_record(index)?;
        Ok((record.image_name.as_str(), record.coordinate))
    }

    /// Loads, crops and transforms crop `index`.
    pub fn load(&self, index: usize) -> DataResult<CropItem> {
        let record = self.index.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            len: self.index.len(),
        })?;
        let pair = self
            .index
            .pair(record.coordinate.image_id)
            .ok_or(DataError::IndexOutOfRange {
                index: record.coordinate.image_id,
                len: self.index.pairs().len(),
            })?;

        let decoded = self.cache.get_or_try_insert(&pair.name, || {
            Ok::<_, DataError>(DecodedPair {
                image: open_rgb(&pair.image_path)?,
                gt: open_rgb(&pair.gt_path)?,
            })
        })?;

        let (image, gt) = self.twin_transform.apply(
            &decoded.image,
            &decoded.gt,
            &record.coordinate,
            index,
            self.epoch(),
        );

        Ok(CropItem {
            image: self.image_transform.apply(&image),
            target: self.target_transform.apply(&gt),
            index,
            size: self.twin_transform.crop_size() as usize,
        })
    }
}

fn open_rgb(path: &Path) -> DataResult<RgbImage> {
    image::open(path)
        .map(|image| image.into_rgb8())
        .map_err(|source| DataError::ImageOpenFailed {
            path: path.to_path_buf(),
            source,
        })
}

impl Dataset<CropItem> for CroppedDataset {
    fn get(&self, index: usize) -> Option<CropItem> {
        match self.load(index) {
            Ok(item) => Some(item),
            Err(DataError::IndexOutOfRange { .. }) => None,
            Err(error) => {
                tracing::error!(index, %error, "failed to load crop");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use burn::backend::ndarray::NdArray;
    use image::Rgb;

    use super::*;
    use crate::{
        config::Selection,
        index::{GT_DIR, IMAGE_DIR},
    };

    type TestBackend = NdArray<f32>;

    const CLASSES: [[u8; 3]; 2] = [[0, 0, 1], [0, 0, 8]];

    /// A 12x8 page whose bottom half is text.
    fn write_page(root: &Path, name: &str) {
        fs::create_dir_all(root.join(IMAGE_DIR)).unwrap();
        fs::create_dir_all(root.join(GT_DIR)).unwrap();
        RgbImage::from_fn(12, 8, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 0]))
            .save(root.join(IMAGE_DIR).join(name))
            .unwrap();
        RgbImage::from_fn(12, 8, |_, y| Rgb(if y < 4 { CLASSES[0] } else { CLASSES[1] }))
            .save(root.join(GT_DIR).join(name))
            .unwrap();
    }

    fn dataset(root: &Path, is_test: bool) -> CroppedDataset {
        let index = CroppedPatchIndex::build(root, &Selection::All, 4).unwrap();
        CroppedDataset::new(
            index,
            ImageTransform::new([0.0; 3], [1.0; 3]),
            TargetTransform::new(CLASSES.to_vec()),
            TwinRandomCrop::new(4, CropMode::Random { seed: 3 }),
            is_test,
            2,
        )
    }

    #[test]
    fn test_mode_items_are_the_indexed_tiles() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "page.png");
        let dataset = dataset(dir.path(), true);

        assert_eq!(dataset.len(), 6);
        let item = dataset.get(4).unwrap();

        assert_eq!(item.index, 4);
        assert_eq!(item.image.len(), 3 * 16);
        assert_eq!(item.target, vec![1; 16]);
        // Crop 4 starts at row 4, col 4: red channel of the first pixel is 40.
        assert!((item.image[0] - 40.0 / 255.0).abs() < 1e-6);
        assert!((item.image[16] - 40.0 / 255.0).abs() < 1e-6);
        assert!(dataset.get(6).is_none());
    }

    #[test]
    fn provenance_lookup_inverts_the_index() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "a.png");
        write_page(dir.path(), "b.png");
        let dataset = dataset(dir.path(), true);

        for index in 0..dataset.len() {
            let (name, coordinate) = dataset.get_img_name_coordinates(index).unwrap();
            let record = dataset
                .index()
                .records()
                .iter()
                .find(|r| r.image_name == name && r.coordinate == coordinate)
                .unwrap();
            assert_eq!(record.index, index);
        }
        assert!(matches!(
            dataset.get_img_name_coordinates(dataset.len()),
            Err(DataError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn provenance_lookup_requires_test_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "page.png");
        let dataset = dataset(dir.path(), false);

        assert!(matches!(
            dataset.get_img_name_coordinates(0),
            Err(DataError::State { .. })
        ));
    }

    #[test]
    fn training_items_keep_image_and_target_aligned() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "page.png");
        let dataset = dataset(dir.path(), false);

        for index in 0..dataset.len() {
            let item = dataset.get(index).unwrap();
            for position in 0..16 {
                let row = (item.image[16 + position] * 255.0 / 10.0).round() as u32;
                let expected = if row < 4 { 0 } else { 1 };
                assert_eq!(item.target[position], expected);
            }
        }
    }

    /// `(col, row)` of the first pixel of an item cut from [`write_page`].
    fn origin(item: &CropItem) -> (u32, u32) {
        let col = (item.image[0] * 255.0 / 10.0).round() as u32;
        let row = (item.image[16] * 255.0 / 10.0).round() as u32;
        (col, row)
    }

    #[test]
    fn epoch_changes_training_crops_only() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "page.png");
        let train = dataset(dir.path(), false);
        let test = dataset(dir.path(), true);

        let mut train_origins = std::collections::HashSet::new();
        let mut test_origins = std::collections::HashSet::new();
        for epoch in 0..16 {
            train.set_epoch(epoch);
            test.set_epoch(epoch);
            train_origins.insert(origin(&train.get(0).unwrap()));
            test_origins.insert(origin(&test.get(0).unwrap()));
        }

        assert_eq!(train.epoch(), 15);
        assert!(train_origins.len() > 1);
        assert_eq!(test_origins.into_iter().collect::<Vec<_>>(), vec![(0, 0)]);
    }

    #[test]
    fn batcher_stacks_items() {
        let device = Default::default();
        let batcher = CropBatcher::<TestBackend>::new();
        let items = (0..2)
            .map(|index| CropItem {
                image: vec![0.5; 3 * 8 * 8],
                target: vec![1; 8 * 8],
                index: index + 10,
                size: 8,
            })
            .collect();

        let batch = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [2, 8, 8]);
        let indices: Vec<i64> = batch.indices.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(indices, vec![10, 11]);
    }
}
