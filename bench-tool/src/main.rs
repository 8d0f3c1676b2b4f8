use anyhow::{Context as _, Result};
use clap::Parser;
use effdet_bench::{Anchors, BenchConfig};
use log::info;
use prettytable::{cell, row, Table};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Show the configuration and the anchors it generates.
    Info {
        /// configuration file
        config_file: PathBuf,
    },
    /// Write the default EfficientDet-D0 configuration.
    DefaultConfig {
        /// output JSON5 file, print to stdout if not set
        output_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    match Opts::parse() {
        Opts::Info { config_file } => {
            info(config_file)?;
        }
        Opts::DefaultConfig { output_file } => {
            default_config(output_file)?;
        }
    }

    Ok(())
}

fn info(config_file: impl AsRef<Path>) -> Result<()> {
    let config_file = config_file.as_ref();
    let config = BenchConfig::open(config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;
    let anchors = Anchors::new(&config)?;

    // print configuration
    {
        let mut table = Table::new();
        table.add_row(row!["field", "value"]);
        table.add_row(row!["levels", format!("{}..={}", config.min_level, config.max_level)]);
        table.add_row(row!["num_scales", config.num_scales]);
        table.add_row(row!["aspect_ratios", format!("{:?}", config.aspect_ratios)]);
        table.add_row(row!["anchor_scale", config.anchor_scale]);
        table.add_row(row!["image_size", config.image_size]);
        table.add_row(row!["num_classes", config.num_classes]);
        table.add_row(row!["max_detection_points", config.max_detection_points]);
        table.add_row(row!["max_instances", config.max_instances]);
        table.add_row(row!["score_threshold", config.score_threshold]);
        table.add_row(row!["match_threshold", config.match_threshold]);
        table.add_row(row![
            "nms_iou_threshold",
            config
                .nms_iou_threshold
                .map(|iou| format!("{}", iou))
                .unwrap_or_else(|| "disabled".to_string())
        ]);
        table.printstd();
    }

    // print per-level anchor statistics
    {
        let mut table = Table::new();
        table.add_row(row!["level", "stride", "grid", "anchors"]);

        anchors.levels().iter().for_each(|level| {
            table.add_row(row![
                level.level,
                level.stride,
                format!("{0}x{0}", level.grid_size),
                level.num_anchors,
            ]);
        });
        table.add_row(row!["total", "", "", anchors.num_anchors()]);

        table.printstd();
    }

    Ok(())
}

fn default_config(output_file: Option<PathBuf>) -> Result<()> {
    let text = json5::to_string(&BenchConfig::default())?;

    match output_file {
        Some(path) => {
            fs::write(&path, text)
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            info!("wrote default configuration to '{}'", path.display());
        }
        None => println!("{}", text),
    }

    Ok(())
}
