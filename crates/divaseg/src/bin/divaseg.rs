use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use divaseg::{
    backend::{create_device, SelectedBackend},
    commands::{analytics_report, index_report, info_report, loader_report},
};
use divaseg_data::{AnalyticsConfig, DataModuleConfig, ProcessRole, Selection, Split};

#[derive(Parser)]
#[command(name = "divaseg")]
#[command(about = "Cropped-patch semantic segmentation of document images")]
struct Cli {
    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute or load the dataset analytics and print them as JSON
    Analytics {
        /// Dataset root containing train/val/test
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Upper bound on the number of ground-truth colors
        #[arg(long, default_value_t = 64)]
        max_classes: usize,

        /// Do not write the analytics cache file
        #[arg(long)]
        no_cache_write: bool,
    },

    /// Print the crop index of one split
    Index {
        /// Dataset root containing train/val/test
        #[arg(short, long)]
        data_dir: PathBuf,

        #[arg(short, long, value_enum, default_value_t = SplitArg::Train)]
        split: SplitArg,

        /// Edge length of the square crops
        #[arg(short, long, default_value_t = 256)]
        crop_size: u32,

        /// Only index the first N images
        #[arg(long)]
        first: Option<usize>,
    },

    /// Set up every split and drain its data loader once on the selected backend
    Loaders {
        /// Dataset root containing train/val/test
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Edge length of the square crops
        #[arg(short, long, default_value_t = 256)]
        crop_size: u32,

        #[arg(short, long, default_value_t = 8)]
        batch_size: usize,

        /// Loader threads; 0 loads on the main thread
        #[arg(long, default_value_t = 4)]
        num_workers: usize,

        /// Keep incomplete train/val batches
        #[arg(long)]
        keep_last_batch: bool,
    },

    /// Show backend information
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum SplitArg {
    Train,
    Val,
    Test,
}

impl From<SplitArg> for Split {
    fn from(split: SplitArg) -> Self {
        match split {
            SplitArg::Train => Self::Train,
            SplitArg::Val => Self::Val,
            SplitArg::Test => Self::Test,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Analytics {
            data_dir,
            max_classes,
            no_cache_write,
        } => {
            let config = AnalyticsConfig::new().with_max_classes(max_classes);
            let role = if no_cache_write {
                ProcessRole::Worker
            } else {
                ProcessRole::Coordinator
            };
            println!("{}", analytics_report(&data_dir, &config, role)?);
            Ok(())
        }

        Commands::Index {
            data_dir,
            split,
            crop_size,
            first,
        } => {
            let selection = first.map_or(Selection::All, Selection::First);
            print!(
                "{}",
                index_report(&data_dir, split.into(), crop_size, &selection)?
            );
            Ok(())
        }

        Commands::Loaders {
            data_dir,
            crop_size,
            batch_size,
            num_workers,
            keep_last_batch,
        } => {
            let config = DataModuleConfig::new(data_dir.display().to_string())
                .with_crop_size(crop_size)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_drop_last_batch(!keep_last_batch);
            let device = create_device();
            print!(
                "{}",
                loader_report::<SelectedBackend>(config, ProcessRole::Coordinator, &device)?
            );
            Ok(())
        }

        Commands::Info => {
            print!("{}", info_report());
            Ok(())
        }
    }
}
