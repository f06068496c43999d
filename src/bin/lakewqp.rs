use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lakewqp::core::timeseries::{RowPolicy, StatisticKind};
use lakewqp::core::{PayloadBuilder, PipelineConfig, StatsFormatter, WqpPipeline};
use lakewqp::io::{ObservationClient, ObservationConfig, VectorStore};
use log::{info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lakewqp")]
#[command(about = "Lake water-quality statistics, outlier rejection and time-series export", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crop, compute statistics, reject outliers and export for each WQP raster
    Process {
        /// Lake polygons (any OGR vector format)
        #[arg(long)]
        vector: PathBuf,

        /// Pipeline configuration (JSON); defaults are used when absent
        #[arg(long)]
        config: Option<PathBuf>,

        /// WQP rasters to process
        #[arg(required = true)]
        rasters: Vec<PathBuf>,
    },

    /// Build an observation payload from an exported statistics table
    Payload {
        /// Statistics CSV written by `process`
        #[arg(long)]
        stats: PathBuf,

        /// Sample observation JSON used as template
        #[arg(long)]
        sample: PathBuf,

        /// Procedure name, e.g. SATELLITE_CHL_TURB_MA
        #[arg(long)]
        procedure: String,

        /// Keep rows with missing values instead of dropping them
        #[arg(long)]
        keep_partial: bool,

        /// Output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Publish the statistics of every procedure of a lake to the observation service
    Publish {
        /// Observation service configuration (JSON)
        #[arg(long)]
        service: PathBuf,

        /// Statistics CSV written by `process`
        #[arg(long)]
        stats: PathBuf,

        /// Keep rows with missing values instead of dropping them
        #[arg(long)]
        keep_partial: bool,
    },
}

fn row_policy(keep_partial: bool) -> RowPolicy {
    if keep_partial {
        RowPolicy::KeepPartial
    } else {
        RowPolicy::DropIncomplete
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Process { vector, config, rasters } => {
            let config = match config {
                Some(path) => PipelineConfig::from_file(&path)
                    .with_context(|| format!("Failed to load configuration {}", path.display()))?,
                None => PipelineConfig::default(),
            };
            let polygons = VectorStore::load_polygons(&vector, &config.name_field)
                .with_context(|| format!("Failed to load polygons from {}", vector.display()))?;
            if polygons.is_empty() {
                bail!("No polygons named by '{}' in {}", config.name_field, vector.display());
            }

            let pipeline = WqpPipeline::new(config)?;
            let (results, summary) = pipeline.run_batch(&rasters, &polygons);

            for item in &summary.skipped {
                warn!("Skipped {} ({:?}): {}", item.item, item.kind, item.message);
            }
            info!("{} of {} product(s) processed", results.len(), rasters.len());
        }

        Command::Payload { stats, sample, procedure, keep_partial, output } => {
            let table = StatsFormatter::read_stats_table(&stats)?;
            let template: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&sample)
                    .with_context(|| format!("Failed to read sample {}", sample.display()))?,
            )?;
            let statistic = StatisticKind::from_procedure(&procedure);
            let (payload, skipped) =
                PayloadBuilder::build_payload(&table, &template, &procedure, statistic, row_policy(keep_partial))?;
            if !skipped.is_empty() {
                warn!("{} value(s) missing from the payload", skipped.len());
            }

            let text = serde_json::to_string_pretty(&payload)?;
            match output {
                Some(path) => std::fs::write(&path, text)?,
                None => println!("{}", text),
            }
        }

        Command::Publish { service, stats, keep_partial } => {
            let config: ObservationConfig = serde_json::from_str(&std::fs::read_to_string(&service)?)
                .with_context(|| format!("Invalid service configuration {}", service.display()))?;
            let table = StatsFormatter::read_stats_table(&stats)?;

            let mut client = ObservationClient::new(&config)?;
            client.refresh_token()?;
            let ids = client.procedure_ids()?;

            for (procedure, sensor_id) in ids.iter() {
                if sensor_id.is_empty() {
                    warn!("Skipping {}: no assigned sensor id", procedure);
                    continue;
                }
                match client.publish(&table, procedure, sensor_id, row_policy(keep_partial)) {
                    Ok(skipped) => info!("{} published ({} missing value(s))", procedure, skipped.len()),
                    Err(e) => warn!("Failed to publish {}: {}", procedure, e),
                }
            }
        }
    }

    Ok(())
}
