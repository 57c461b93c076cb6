//! Crop index of a dataset split.
//!
//! Every full-resolution page is tiled into square crops. The index keeps,
//! for each crop, the page it was cut from and its pixel offsets, and assigns
//! it a linear index that is stable across runs so predictions made on crops
//! can be stitched back together.

use std::path::{Path, PathBuf};

use image::ImageFormat;
use walkdir::WalkDir;

use crate::{
    config::Selection,
    error::{DataError, DataResult},
};

/// Name of the image subfolder of a split.
pub const IMAGE_DIR: &str = "data";
/// Name of the ground-truth subfolder of a split.
pub const GT_DIR: &str = "gt";

/// Position of a crop inside its source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropCoordinate {
    /// Position of the source image in the index' image list.
    pub image_id: usize,
    /// Top edge of the crop in pixels.
    pub row: u32,
    /// Left edge of the crop in pixels.
    pub col: u32,
    /// Edge length of the crop in pixels.
    pub size: u32,
}

impl CropCoordinate {
    /// Whether the pixel `(row, col)` lies inside this crop.
    pub const fn contains(&self, row: u32, col: u32) -> bool {
        row >= self.row && row < self.row + self.size && col >= self.col && col < self.col + self.size
    }
}

/// A crop together with its provenance and its dataset-wide index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropRecord {
    /// File name of the source image (with extension).
    pub image_name: String,
    pub coordinate: CropCoordinate,
    pub index: usize,
}

impl CropRecord {
    /// File stem of the source image; used as the folder name when crops of
    /// the same page are written to disk.
    pub fn image_stem(&self) -> &str {
        Path::new(&self.image_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.image_name)
    }

    /// Name of the crop, e.g. `page_x0256_y0044`.
    pub fn patch_name(&self) -> String {
        format!(
            "{}_x{:04}_y{:04}",
            self.image_stem(),
            self.coordinate.col,
            self.coordinate.row
        )
    }
}

/// An image file, its ground truth and its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePair {
    /// File name of the image.
    pub name: String,
    pub image_path: PathBuf,
    pub gt_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Offsets of the crops along one axis of length `extent`.
///
/// Produces `floor((extent - 1) / crop) + 1` offsets spaced `crop` apart; the
/// last one is pulled back to `extent - crop` so it overlaps its predecessor
/// instead of reaching past the border. Requires `crop <= extent`.
pub fn tile_offsets(extent: u32, crop: u32) -> Vec<u32> {
    debug_assert!(crop > 0 && crop <= extent);
    let count = (extent - 1) / crop + 1;
    (0..count).map(|i| (i * crop).min(extent - crop)).collect()
}

/// Lists the `(image, ground truth)` file pairs of a split directory in
/// sorted filename order.
///
/// Images live in `{split}/data`, ground truth in `{split}/gt`. A ground truth
/// file is matched by exact filename first, then by file stem (pages are often
/// stored as JPEG while their ground truth is PNG).
pub fn list_image_pairs(split_dir: &Path) -> DataResult<Vec<(PathBuf, PathBuf)>> {
    let image_root = split_dir.join(IMAGE_DIR);
    let gt_root = split_dir.join(GT_DIR);
    if !image_root.is_dir() {
        return Err(DataError::DirectoryNotFound { path: image_root });
    }
    if !gt_root.is_dir() {
        return Err(DataError::DirectoryNotFound { path: gt_root });
    }

    let images = list_image_files(&image_root)?;
    let gts = list_image_files(&gt_root)?;

    let mut pairs = Vec::with_capacity(images.len());
    for image_path in images {
        let gt_path = gts
            .iter()
            .find(|gt| gt.file_name() == image_path.file_name())
            .or_else(|| gts.iter().find(|gt| gt.file_stem() == image_path.file_stem()))
            .cloned()
            .ok_or_else(|| {
                DataError::configuration(format!(
                    "no ground truth in {} for image {}",
                    gt_root.display(),
                    image_path.display()
                ))
            })?;
        pairs.push((image_path, gt_path));
    }

    if pairs.is_empty() {
        return Err(DataError::configuration(format!(
            "no image/ground-truth pairs found in {}",
            image_root.display()
        )));
    }

    Ok(pairs)
}

fn list_image_files(dir: &Path) -> DataResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| DataError::DirectoryReadFailed {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && ImageFormat::from_path(path).is_ok() {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn file_name_of(path: &Path) -> DataResult<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| DataError::InvalidUtf8Path {
            path: path.to_path_buf(),
        })
}

fn dimensions_of(path: &Path) -> DataResult<(u32, u32)> {
    image::image_dimensions(path).map_err(|source| DataError::ImageOpenFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Applies a selection to pairs listed in sorted order.
fn select_pairs(
    pairs: Vec<(PathBuf, PathBuf)>,
    selection: &Selection,
) -> DataResult<Vec<(PathBuf, PathBuf)>> {
    match selection {
        Selection::All => Ok(pairs),
        Selection::First(n) => {
            if *n > pairs.len() {
                return Err(DataError::configuration(format!(
                    "selection of {n} images exceeds the {} images available",
                    pairs.len()
                )));
            }
            Ok(pairs.into_iter().take(*n).collect())
        }
        Selection::Names(names) => {
            let mut selected = Vec::with_capacity(names.len());
            let mut missing = Vec::new();
            for (image_path, gt_path) in pairs {
                let file_name = file_name_of(&image_path)?;
                let stem = image_path.file_stem().and_then(|s| s.to_str());
                if names
                    .iter()
                    .any(|name| *name == file_name || Some(name.as_str()) == stem)
                {
                    selected.push((image_path, gt_path));
                }
            }
            for name in names {
                let found = selected.iter().any(|(image_path, _)| {
                    image_path.file_name().and_then(|n| n.to_str()) == Some(name.as_str())
                        || image_path.file_stem().and_then(|s| s.to_str()) == Some(name.as_str())
                });
                if !found {
                    missing.push(name.as_str());
                }
            }
            if !missing.is_empty() {
                return Err(DataError::configuration(format!(
                    "selected images not found on disk: {}",
                    missing.join(", ")
                )));
            }
            Ok(selected)
        }
    }
}

/// The ordered crop records of one split.
#[derive(Debug, Clone)]
pub struct CroppedPatchIndex {
    split_dir: PathBuf,
    crop_size: u32,
    pairs: Vec<ImagePair>,
    records: Vec<CropRecord>,
}

impl CroppedPatchIndex {
    /// Builds the index of `split_dir`.
    ///
    /// Records are ordered by image filename, then row-major within each image,
    /// and numbered `0..len()`. Only image headers are read.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::Configuration`] when a selected image is missing,
    /// has no ground truth, differs in size from its ground truth or is smaller
    /// than the crop.
    pub fn build(split_dir: &Path, selection: &Selection, crop_size: u32) -> DataResult<Self> {
        if crop_size == 0 {
            return Err(DataError::configuration("crop size must be positive"));
        }
        let pairs = select_pairs(list_image_pairs(split_dir)?, selection)?;
        if pairs.is_empty() {
            return Err(DataError::configuration(format!(
                "selection yields no images in {}",
                split_dir.display()
            )));
        }

        let mut image_pairs = Vec::with_capacity(pairs.len());
        for (image_path, gt_path) in pairs {
            let (width, height) = dimensions_of(&image_path)?;
            let gt_dims = dimensions_of(&gt_path)?;
            if gt_dims != (width, height) {
                return Err(DataError::configuration(format!(
                    "image {} is {width}x{height} but its ground truth is {}x{}",
                    image_path.display(),
                    gt_dims.0,
                    gt_dims.1
                )));
            }
            if width < crop_size || height < crop_size {
                return Err(DataError::configuration(format!(
                    "image {} ({width}x{height}) is smaller than the crop size {crop_size}",
                    image_path.display()
                )));
            }
            image_pairs.push(ImagePair {
                name: file_name_of(&image_path)?,
                image_path,
                gt_path,
                width,
                height,
            });
        }

        Ok(Self::from_pairs(split_dir.to_path_buf(), image_pairs, crop_size))
    }

    /// Tiles already probed pairs.
    pub(crate) fn from_pairs(split_dir: PathBuf, pairs: Vec<ImagePair>, crop_size: u32) -> Self {
        let mut records = Vec::new();
        for (image_id, pair) in pairs.iter().enumerate() {
            let cols = tile_offsets(pair.width, crop_size);
            for row in tile_offsets(pair.height, crop_size) {
                for &col in &cols {
                    records.push(CropRecord {
                        image_name: pair.name.clone(),
                        coordinate: CropCoordinate {
                            image_id,
                            row,
                            col,
                            size: crop_size,
                        },
                        index: records.len(),
                    });
                }
            }
        }

        Self {
            split_dir,
            crop_size,
            pairs,
            records,
        }
    }

    pub fn split_dir(&self) -> &Path {
        &self.split_dir
    }

    pub const fn crop_size(&self) -> u32 {
        self.crop_size
    }

    pub fn pairs(&self) -> &[ImagePair] {
        &self.pairs
    }

    pub fn pair(&self, image_id: usize) -> Option<&ImagePair> {
        self.pairs.get(image_id)
    }

    pub fn records(&self) -> &[CropRecord] {
        &self.records
    }

    /// The record with linear index `index`.
    pub fn get(&self, index: usize) -> Option<&CropRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use image::{Rgb, RgbImage};

    use super::*;

    fn pair(name: &str, width: u32, height: u32) -> ImagePair {
        ImagePair {
            name: name.to_string(),
            image_path: PathBuf::from(format!("data/{name}")),
            gt_path: PathBuf::from(format!("gt/{name}")),
            width,
            height,
        }
    }

    fn write_split(root: &Path, names: &[(&str, u32, u32)]) {
        fs::create_dir_all(root.join(IMAGE_DIR)).unwrap();
        fs::create_dir_all(root.join(GT_DIR)).unwrap();
        for (name, width, height) in names {
            RgbImage::from_pixel(*width, *height, Rgb([200, 200, 200]))
                .save(root.join(IMAGE_DIR).join(name))
                .unwrap();
            RgbImage::from_pixel(*width, *height, Rgb([0, 0, 1]))
                .save(root.join(GT_DIR).join(name))
                .unwrap();
        }
    }

    #[test]
    fn exact_multiple_yields_non_overlapping_tiles() {
        let index = CroppedPatchIndex::from_pairs(PathBuf::new(), vec![pair("a.png", 512, 512)], 256);

        let origins: Vec<_> = index
            .records()
            .iter()
            .map(|r| (r.coordinate.row, r.coordinate.col))
            .collect();
        assert_eq!(origins, vec![(0, 0), (0, 256), (256, 0), (256, 256)]);
    }

    #[test]
    fn last_tile_is_shifted_back_inside_the_image() {
        let index = CroppedPatchIndex::from_pairs(PathBuf::new(), vec![pair("a.png", 300, 300)], 256);

        let origins: Vec<_> = index
            .records()
            .iter()
            .map(|r| (r.coordinate.row, r.coordinate.col))
            .collect();
        assert_eq!(origins, vec![(0, 0), (0, 44), (44, 0), (44, 44)]);
    }

    #[test]
    fn tiles_cover_every_pixel_without_leaving_the_image() {
        for (width, height, crop) in [(300, 300, 256), (97, 41, 13), (64, 128, 64), (5, 7, 5), (33, 33, 1)] {
            let index =
                CroppedPatchIndex::from_pairs(PathBuf::new(), vec![pair("a.png", width, height)], crop);
            let crops: Vec<_> = index.records().iter().map(|r| r.coordinate).collect();

            for c in &crops {
                assert!(c.row + c.size <= height && c.col + c.size <= width);
            }
            for row in 0..height {
                for col in 0..width {
                    assert!(
                        crops.iter().any(|c| c.contains(row, col)),
                        "pixel ({row}, {col}) of {width}x{height} not covered with crop {crop}"
                    );
                }
            }
        }
    }

    #[test]
    fn linear_indices_are_contiguous_across_images() {
        let index = CroppedPatchIndex::from_pairs(
            PathBuf::new(),
            vec![pair("a.png", 300, 300), pair("b.png", 256, 600)],
            256,
        );

        assert_eq!(index.len(), 4 + 3);
        for (position, record) in index.records().iter().enumerate() {
            assert_eq!(record.index, position);
            assert_eq!(index.get(position), Some(record));
        }
        assert_eq!(index.records()[4].image_name, "b.png");
        assert_eq!(index.records()[4].coordinate.image_id, 1);
    }

    #[test]
    fn patch_names_encode_the_offsets() {
        let index = CroppedPatchIndex::from_pairs(PathBuf::new(), vec![pair("page.png", 300, 300)], 256);

        assert_eq!(index.records()[1].patch_name(), "page_x0044_y0000");
        assert_eq!(index.records()[1].image_stem(), "page");
    }

    #[test]
    fn build_orders_images_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[("b.png", 8, 8), ("a.png", 16, 8), ("c.png", 8, 8)]);

        let index = CroppedPatchIndex::build(dir.path(), &Selection::All, 8).unwrap();

        let names: Vec<_> = index.pairs().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.png"]);
        assert_eq!(index.len(), 4);
        assert_eq!(index.records()[1].coordinate.col, 8);
    }

    #[test]
    fn build_applies_count_and_name_selections() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[("a.png", 8, 8), ("b.png", 8, 8), ("c.png", 8, 8)]);

        let first = CroppedPatchIndex::build(dir.path(), &Selection::First(2), 8).unwrap();
        let names: Vec<_> = first.pairs().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);

        let named = CroppedPatchIndex::build(
            dir.path(),
            &Selection::Names(vec!["c.png".to_string(), "a".to_string()]),
            8,
        )
        .unwrap();
        let names: Vec<_> = named.pairs().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "c.png"]);
    }

    #[test]
    fn build_rejects_missing_selected_names() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[("a.png", 8, 8)]);

        let result = CroppedPatchIndex::build(
            dir.path(),
            &Selection::Names(vec!["missing.png".to_string()]),
            8,
        );

        assert!(matches!(result, Err(DataError::Configuration { .. })));
    }

    #[test]
    fn build_rejects_oversized_count_selection() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[("a.png", 8, 8)]);

        let result = CroppedPatchIndex::build(dir.path(), &Selection::First(2), 8);

        assert!(matches!(result, Err(DataError::Configuration { .. })));
    }

    #[test]
    fn build_rejects_images_smaller_than_the_crop() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), &[("a.png", 8, 4)]);

        let result = CroppedPatchIndex::build(dir.path(), &Selection::All, 8);

        assert!(matches!(result, Err(DataError::Configuration { .. })));
    }

    #[test]
    fn ground_truth_is_paired_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(IMAGE_DIR)).unwrap();
        fs::create_dir_all(dir.path().join(GT_DIR)).unwrap();
        let gt_path = dir.path().join(GT_DIR).join("page.png");
        RgbImage::new(4, 4).save(&gt_path).unwrap();
        // Only the extension matters for listing.
        fs::copy(&gt_path, dir.path().join(IMAGE_DIR).join("page.jpg")).unwrap();

        let pairs = list_image_pairs(dir.path()).unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1, gt_path);
    }

    #[test]
    fn missing_split_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();

        let result = list_image_pairs(&dir.path().join("val"));

        assert!(matches!(result, Err(DataError::DirectoryNotFound { .. })));
    }
}
