//! Separate backbone and header checkpoints.
//!
//! Every checkpoint event writes the backbone weights and the header weights
//! into two files, so a backbone trained on one task can be paired with a new
//! header later. Filenames come from templates such as `{epoch}/backbone`,
//! where `{epoch}` expands to `epoch=3` and `{val_loss:.2f}` to
//! `val_loss=0.12`. Only the coordinator process touches the filesystem.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use divaseg_data::ProcessRole;

use crate::{
    error::{TrainError, TrainResult},
    model::BackboneHeaderModel,
};

/// Suffix of the filenames written by a [`CheckpointKind::Last`] save.
pub const LAST_SUFFIX: &str = "_last";
/// Extension of the written weight files.
pub const WEIGHTS_EXTENSION: &str = "mpk";

/// Checkpoint location and filename templates.
#[derive(Config, Debug)]
pub struct CheckpointConfig {
    /// Directory all checkpoints are written to.
    pub dir: String,

    #[config(default = "\"{epoch}/backbone\".to_string()")]
    pub backbone_filename: String,

    #[config(default = "\"{epoch}/header\".to_string()")]
    pub header_filename: String,
}

/// Kind of checkpoint event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// A regular save at the end of an epoch.
    Epoch,
    /// The rolling "last" save, overwritten on every event.
    Last,
}

/// Files written by one checkpoint event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCheckpoint {
    pub backbone: PathBuf,
    pub header: PathBuf,
}

/// Expands a checkpoint filename template.
///
/// `{epoch}` becomes `epoch=<epoch>`, `{name}` becomes `name=<value>` and
/// `{name:.Nf}` formats the metric with `N` decimals. Metrics missing from
/// `metrics` are written as zero.
pub fn format_checkpoint_name(
    template: &str,
    epoch: usize,
    metrics: &BTreeMap<String, f64>,
) -> String {
    let mut name = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|close| open + close) else {
            break;
        };
        name.push_str(&rest[..open]);
        let placeholder = &rest[open + 1..close];
        let (key, format) = placeholder
            .split_once(':')
            .map_or((placeholder, None), |(key, format)| (key, Some(format)));

        name.push_str(key);
        name.push('=');
        if key == "epoch" {
            name.push_str(&epoch.to_string());
        } else {
            let value = metrics.get(key).copied().unwrap_or_else(|| {
                tracing::warn!(metric = key, "checkpoint filename refers to an unknown metric");
                0.0
            });
            let precision = format
                .and_then(|f| f.strip_prefix('.'))
                .and_then(|f| f.strip_suffix('f'))
                .and_then(|digits| digits.parse::<usize>().ok());
            match precision {
                Some(precision) => name.push_str(&format!("{value:.precision$}")),
                None => name.push_str(&value.to_string()),
            }
        }
        rest = &rest[close + 1..];
    }
    name.push_str(rest);
    name
}

/// Filename of a "last" save: the final path segment of the template plus
/// [`LAST_SUFFIX`].
pub fn last_checkpoint_name(template: &str) -> String {
    let base = template.rsplit('/').next().unwrap_or(template);
    format!("{base}{LAST_SUFFIX}")
}

/// Writes backbone and header weights on checkpoint events.
#[derive(Debug)]
pub struct CheckpointWriter {
    config: CheckpointConfig,
    role: ProcessRole,
    recorder: NamedMpkFileRecorder<FullPrecisionSettings>,
}

impl CheckpointWriter {
    pub fn new(config: CheckpointConfig, role: ProcessRole) -> Self {
        Self {
            config,
            role,
            recorder: NamedMpkFileRecorder::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        Path::new(&self.config.dir)
    }

    /// Saves the backbone and header of `model`.
    ///
    /// An [`CheckpointKind::Epoch`] save for `epoch > 0` first removes the
    /// `epoch={epoch - 1}` directory. Returns `None` on worker processes,
    /// which write nothing.
    ///
    /// # Errors
    ///
    /// Fails when a directory cannot be created or removed, or a record
    /// cannot be written.
    pub fn save<B, M>(
        &self,
        model: &M,
        epoch: usize,
        metrics: &BTreeMap<String, f64>,
        kind: CheckpointKind,
    ) -> TrainResult<Option<SavedCheckpoint>>
    where
        B: Backend,
        M: BackboneHeaderModel<B>,
    {
        if !self.role.is_coordinator() {
            tracing::debug!(epoch, "skipping checkpoint on worker process");
            return Ok(None);
        }

        let (backbone_name, header_name) = match kind {
            CheckpointKind::Epoch => {
                if epoch > 0 {
                    self.remove_epoch_dir(epoch - 1)?;
                }
                (
                    format_checkpoint_name(&self.config.backbone_filename, epoch, metrics),
                    format_checkpoint_name(&self.config.header_filename, epoch, metrics),
                )
            }
            CheckpointKind::Last => (
                last_checkpoint_name(&self.config.backbone_filename),
                last_checkpoint_name(&self.config.header_filename),
            ),
        };

        let saved = SavedCheckpoint {
            backbone: self.write::<B, _>(model.backbone().clone(), &backbone_name)?,
            header: self.write::<B, _>(model.header().clone(), &header_name)?,
        };
        tracing::info!(
            epoch,
            ?kind,
            backbone = %saved.backbone.display(),
            header = %saved.header.display(),
            "checkpoint saved"
        );
        Ok(Some(saved))
    }

    fn write<B: Backend, P: Module<B>>(&self, part: P, name: &str) -> TrainResult<PathBuf> {
        let path = self.dir().join(format!("{name}.{WEIGHTS_EXTENSION}"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| TrainError::io(parent, source))?;
        }
        part.save_file(path.clone(), &self.recorder)
            .map_err(|source| TrainError::Record {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    fn remove_epoch_dir(&self, epoch: usize) -> TrainResult<()> {
        let old = self.dir().join(format!("epoch={epoch}"));
        if !old.is_dir() {
            return Ok(());
        }
        fs::remove_dir_all(&old).map_err(|source| TrainError::io(&old, source))?;
        tracing::debug!(path = %old.display(), "removed previous checkpoint");
        Ok(())
    }
}
