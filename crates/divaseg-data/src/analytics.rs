//! Dataset analytics: normalization statistics, class encodings and class
//! weights computed over the full-resolution training pages.
//!
//! Statistics are gathered on whole pages rather than crops because tiles
//! overlap at the page borders and would weight those pixels twice.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{LazyLock, Mutex, PoisonError},
};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::{
    config::{AnalyticsConfig, ProcessRole, Split},
    error::{DataError, DataResult},
    index::list_image_pairs,
};

/// Statistics of a dataset that the transforms and the loss depend on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    /// Per-channel mean of the RGB pixels scaled to `[0, 1]`.
    pub mean: [f64; 3],
    /// Per-channel population standard deviation, same scale as `mean`.
    pub std: [f64; 3],
    /// Sorted ground-truth colors; the position of a color is its class id.
    pub class_encodings: Vec<[u8; 3]>,
    /// Inverse-frequency weight per class.
    pub class_weights: Vec<f64>,
}

impl Analytics {
    pub fn num_classes(&self) -> usize {
        self.class_encodings.len()
    }

    /// Class id of a ground-truth color.
    pub fn class_of(&self, color: [u8; 3]) -> Option<usize> {
        self.class_encodings.binary_search(&color).ok()
    }

    /// Ground-truth color of a class id.
    pub fn color_of(&self, class: usize) -> Option<[u8; 3]> {
        self.class_encodings.get(class).copied()
    }
}

/// On-disk form of [`Analytics`], tagged with the dataset it describes.
#[derive(Debug, Serialize, Deserialize)]
struct CachedAnalytics {
    source: PathBuf,
    #[serde(flatten)]
    analytics: Analytics,
}

/// Streaming per-channel sums.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    sum: [f64; 3],
    sum_sq: [f64; 3],
    count: u64,
}

impl ChannelStats {
    pub fn update(&mut self, image: &RgbImage) {
        for pixel in image.pixels() {
            for (channel, &value) in pixel.0.iter().enumerate() {
                let value = f64::from(value) / 255.0;
                self.sum[channel] += value;
                self.sum_sq[channel] += value * value;
            }
        }
        self.count += u64::from(image.width()) * u64::from(image.height());
    }

    pub fn mean(&self) -> [f64; 3] {
        let count = self.count.max(1) as f64;
        self.sum.map(|sum| sum / count)
    }

    pub fn std(&self) -> [f64; 3] {
        let count = self.count.max(1) as f64;
        let mean = self.mean();
        let mut std = [0.0; 3];
        for channel in 0..3 {
            let variance = self.sum_sq[channel] / count - mean[channel] * mean[channel];
            std[channel] = variance.max(0.0).sqrt();
        }
        std
    }
}

/// Pixel counts per ground-truth color.
#[derive(Debug, Default, Clone)]
pub struct ClassHistogram {
    counts: BTreeMap<[u8; 3], u64>,
}

impl ClassHistogram {
    pub fn update(&mut self, gt: &RgbImage) {
        for pixel in gt.pixels() {
            *self.counts.entry(pixel.0).or_insert(0) += 1;
        }
    }

    /// Distinct colors in sorted order.
    pub fn colors(&self) -> Vec<[u8; 3]> {
        self.counts.keys().copied().collect()
    }

    pub fn count(&self, color: &[u8; 3]) -> u64 {
        self.counts.get(color).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Inverse-frequency class weights: `total / (num_classes * count[c])`.
///
/// # Errors
///
/// Returns [`DataError::DivideByZero`] for a class that has no pixels.
pub fn class_weights(encodings: &[[u8; 3]], histogram: &ClassHistogram) -> DataResult<Vec<f64>> {
    let total = histogram.total() as f64;
    let num_classes = encodings.len() as f64;
    encodings
        .iter()
        .enumerate()
        .map(|(class_index, color)| match histogram.count(color) {
            0 => Err(DataError::DivideByZero {
                class_index,
                color: *color,
            }),
            count => Ok(total / (num_classes * count as f64)),
        })
        .collect()
}

fn open_rgb(path: &Path) -> DataResult<RgbImage> {
    image::open(path)
        .map(|image| image.into_rgb8())
        .map_err(|source| DataError::ImageOpenFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Scans the given pages once and computes their [`Analytics`].
///
/// # Errors
///
/// Returns [`DataError::Configuration`] when the ground truth holds more than
/// `max_classes` colors or a color outside the fixed encodings, and
/// [`DataError::DivideByZero`] when a fixed class never occurs.
pub fn compute_analytics(
    pairs: &[(PathBuf, PathBuf)],
    config: &AnalyticsConfig,
) -> DataResult<Analytics> {
    if pairs.is_empty() {
        return Err(DataError::configuration(
            "cannot compute analytics without any image",
        ));
    }

    let mut stats = ChannelStats::default();
    let mut histogram = ClassHistogram::default();
    for (image_path, gt_path) in pairs {
        stats.update(&open_rgb(image_path)?);
        histogram.update(&open_rgb(gt_path)?);
    }

    let class_encodings = match fixed_encodings(config) {
        Some(encodings) => {
            if let Some(unknown) = histogram
                .colors()
                .into_iter()
                .find(|color| encodings.binary_search(color).is_err())
            {
                return Err(DataError::configuration(format!(
                    "ground truth contains color {unknown:?} which is not one of the configured class encodings"
                )));
            }
            encodings
        }
        None => histogram.colors(),
    };

    check_class_count(class_encodings.len(), config)?;

    let class_weights = class_weights(&class_encodings, &histogram)?;

    Ok(Analytics {
        mean: stats.mean(),
        std: stats.std(),
        class_encodings,
        class_weights,
    })
}

/// Configured class colors, sorted and deduplicated like discovered ones.
fn fixed_encodings(config: &AnalyticsConfig) -> Option<Vec<[u8; 3]>> {
    config.class_encodings.as_ref().map(|fixed| {
        let mut encodings = fixed.clone();
        encodings.sort_unstable();
        encodings.dedup();
        encodings
    })
}

fn check_class_count(num_classes: usize, config: &AnalyticsConfig) -> DataResult<()> {
    if num_classes > config.max_classes {
        return Err(DataError::configuration(format!(
            "found {num_classes} distinct ground-truth colors, more than the allowed {}; \
             was the ground truth resized with interpolation?",
            config.max_classes
        )));
    }
    Ok(())
}

/// Whether stored analytics were computed with the configured class colors.
fn encodings_match(analytics: &Analytics, config: &AnalyticsConfig) -> bool {
    fixed_encodings(config).is_none_or(|fixed| fixed == analytics.class_encodings)
}

static ANALYTICS_MEMO: LazyLock<Mutex<HashMap<PathBuf, Analytics>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Location of the cache file for a dataset root.
pub fn cache_file_path(dataset_root: &Path, config: &AnalyticsConfig) -> PathBuf {
    config
        .cache_dir
        .as_ref()
        .map_or_else(|| dataset_root.to_path_buf(), PathBuf::from)
        .join(&config.cache_file_name)
}

/// Reads the cache file, returning `None` when it is absent, unreadable or
/// belongs to another dataset.
fn load_cached(path: &Path, source: &Path, config: &AnalyticsConfig) -> Option<Analytics> {
    let contents = fs::read_to_string(path).ok()?;
    let cached: CachedAnalytics = match serde_json::from_str(&contents) {
        Ok(cached) => cached,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring malformed analytics cache");
            return None;
        }
    };
    if cached.source != source {
        tracing::info!(
            path = %path.display(),
            cached_source = %cached.source.display(),
            "analytics cache belongs to another dataset, recomputing"
        );
        return None;
    }
    if !encodings_match(&cached.analytics, config) {
        tracing::info!(path = %path.display(), "cached class encodings differ from configuration, recomputing");
        return None;
    }
    Some(cached.analytics)
}

fn store_cached(path: &Path, source: &Path, analytics: &Analytics) -> DataResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| DataError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let cached = CachedAnalytics {
        source: source.to_path_buf(),
        analytics: analytics.clone(),
    };
    let json = serde_json::to_string_pretty(&cached).map_err(|source| DataError::CacheFormat {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Pairs of the training split of a dataset root; the default input of
/// [`get_analytics`].
pub fn training_pairs(dataset_root: &Path) -> DataResult<Vec<(PathBuf, PathBuf)>> {
    list_image_pairs(&dataset_root.join(Split::Train.dir_name()))
}

/// Returns the analytics of `input_path`, computing them at most once.
///
/// Results are memoized per canonical dataset path for the lifetime of the
/// process and persisted to a JSON cache file. Only the coordinator writes the
/// cache file; workers compute (or read) without touching it. Memoized and
/// cached results are only reused when they were computed with the configured
/// class encodings, and are checked against `max_classes` like fresh ones.
///
/// # Errors
///
/// Propagates the errors of [`compute_analytics`] and of `gt_data_paths`.
pub fn get_analytics<F>(
    input_path: &Path,
    gt_data_paths: F,
    config: &AnalyticsConfig,
    role: ProcessRole,
) -> DataResult<Analytics>
where
    F: FnOnce(&Path) -> DataResult<Vec<(PathBuf, PathBuf)>>,
{
    let source = fs::canonicalize(input_path).map_err(|source| DataError::Io {
        path: input_path.to_path_buf(),
        source,
    })?;

    let memoized = ANALYTICS_MEMO
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&source)
        .filter(|analytics| encodings_match(analytics, config))
        .cloned();
    if let Some(analytics) = memoized {
        check_class_count(analytics.num_classes(), config)?;
        return Ok(analytics);
    }

    let cache_path = cache_file_path(&source, config);
    let analytics = match load_cached(&cache_path, &source, config) {
        Some(analytics) => {
            check_class_count(analytics.num_classes(), config)?;
            tracing::info!(path = %cache_path.display(), "loaded dataset analytics from cache");
            analytics
        }
        None => {
            tracing::info!(dataset = %source.display(), "computing dataset analytics");
            let pairs = gt_data_paths(&source)?;
            let analytics = compute_analytics(&pairs, config)?;
            tracing::info!(
                images = pairs.len(),
                classes = analytics.num_classes(),
                mean = ?analytics.mean,
                std = ?analytics.std,
                "dataset analytics computed"
            );
            if role.is_coordinator() {
                store_cached(&cache_path, &source, &analytics)?;
            }
            analytics
        }
    };

    ANALYTICS_MEMO
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(source, analytics.clone());
    Ok(analytics)
}
