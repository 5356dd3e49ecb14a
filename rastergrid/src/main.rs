//! rastergrid command line: materialize one layer-version as a grid of
//! cloud-optimized raster tiles.

use anyhow::{Context, Result};
use clap::Parser;
use rastergrid_core::{CancelFlag, EnvSettings, RasterGridError};
use rastergrid_pipeline::layer::{Layer, LayerSpec};
use rastergrid_pipeline::{Pipe, PipeResults, S3Store, SourceCatalog};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
	name = "rastergrid",
	about = "Cut large geospatial rasters into regular grids of cloud-optimized tiles",
	version,
	disable_help_subcommand = true,
)]
struct Cli {
	/// Name of the dataset
	name: String,

	/// Version of the dataset
	#[arg(short = 'v', long)]
	version: String,

	/// Type of input file(s)
	#[arg(short = 's', long, default_value = "raster", value_parser = ["raster", "vector", "tcd_raster"])]
	source_type: String,

	/// Field represented in the output dataset (pixel meaning)
	#[arg(short = 'f', long)]
	field: String,

	/// Grid of the output dataset, e.g. 10/40000 or zoom_14
	#[arg(short = 'g', long, default_value = "10/40000")]
	grid_name: String,

	/// Subset of tile ids to process; may be given multiple times
	#[arg(long)]
	subset: Vec<String>,

	/// Overwrite existing tiles in the output location
	#[arg(short = 'o', long)]
	overwrite: bool,

	/// Layer definition document (JSON array of layer records)
	#[arg(long, default_value = "layers.json")]
	layer_config: PathBuf,

	/// Increase log verbosity (repeatable)
	#[arg(long, action = clap::ArgAction::Count)]
	verbose: u8,
}

fn main() {
	let cli = Cli::parse();

	let level = match cli.verbose {
		0 => log::LevelFilter::Info,
		1 => log::LevelFilter::Debug,
		_ => log::LevelFilter::Trace,
	};
	env_logger::Builder::new().filter_level(level).format_timestamp(None).init();

	match run(&cli) {
		Ok(results) => {
			let (succeeded, skipped, failed) = results.counts();
			log::info!("successfully processed {succeeded} tiles");
			log::info!("{skipped} tiles skipped");
			log::info!("{failed} tiles failed");
			for tile in &results.failed {
				log::error!("failed tile {}: {}", tile.tile_id, tile.error().unwrap_or("unknown error"));
			}
			if failed > 0 {
				std::process::exit(1);
			}
		}
		Err(err) => {
			log::error!("{err:#}");
			std::process::exit(2);
		}
	}
}

#[tokio::main]
async fn run(cli: &Cli) -> Result<PipeResults> {
	log::info!(
		"start tile preparation for layer {}, version {}, grid {}, source type {}, field {} (overwrite: {})",
		cli.name,
		cli.version,
		cli.grid_name,
		cli.source_type,
		cli.field,
		cli.overwrite
	);
	if cli.subset.is_empty() {
		log::info!("running on the full extent");
	} else {
		log::info!("running on subset: {:?}", cli.subset);
	}

	let settings = EnvSettings::from_env()?;
	let layer = Arc::new(load_layer(cli)?);

	let store = Arc::new(S3Store::new(&settings));
	let source_uri = layer.spec.source_uri.clone().expect("validated: raster layers have a source_uri");
	let catalog = Arc::new(SourceCatalog::load(&source_uri, store.as_ref()).await?);

	let cancel = CancelFlag::new();
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				log::warn!("cancellation requested; letting in-flight work finish");
				cancel.cancel();
			}
		});
	}

	let work_root = tempfile::Builder::new()
		.prefix("rastergrid_")
		.tempdir()
		.context("failed to create work directory")?;

	let subset = if cli.subset.is_empty() { None } else { Some(cli.subset.clone()) };
	let pipe = Pipe::new(
		layer,
		catalog,
		store,
		&settings,
		subset,
		work_root.path().to_path_buf(),
		cancel,
	)?;
	let results = pipe.create_tiles(cli.overwrite).await?;

	// the work directory (and any leftover per-tile files) goes away here
	work_root.close().context("failed to remove work directory")?;
	Ok(results)
}

/// Resolve the full layer record from the layer definition document and the
/// command line: the document provides data type, nodata, source URI and
/// calc; the command line provides dataset, version, source type, field and
/// grid.
fn load_layer(cli: &Cli) -> Result<Layer> {
	let text = std::fs::read_to_string(&cli.layer_config)
		.map_err(|err| RasterGridError::Validation(format!("cannot read layer config {:?}: {err}", cli.layer_config)))?;
	let records: Vec<serde_json::Value> = serde_json::from_str(&text)
		.map_err(|err| RasterGridError::Validation(format!("layer config {:?} is not a JSON array: {err}", cli.layer_config)))?;

	let mut record = records
		.into_iter()
		.find(|record| {
			record.get("dataset").and_then(|v| v.as_str()) == Some(cli.name.as_str())
				&& record.get("pixel_meaning").and_then(|v| v.as_str()) == Some(cli.field.as_str())
		})
		.ok_or_else(|| {
			RasterGridError::Validation(format!(
				"no layer record for dataset {} with pixel meaning {} in {:?}",
				cli.name, cli.field, cli.layer_config
			))
		})?;

	let fields = record
		.as_object_mut()
		.ok_or_else(|| RasterGridError::Validation("layer record must be a JSON object".to_string()))?;
	fields.insert("version".to_string(), serde_json::Value::String(cli.version.clone()));
	fields.insert("grid".to_string(), serde_json::Value::String(cli.grid_name.clone()));
	fields.insert("source_type".to_string(), serde_json::Value::String(cli.source_type.clone()));

	let spec: LayerSpec = serde_json::from_value(record)
		.map_err(|err| RasterGridError::Validation(format!("invalid layer record: {err}")))?;
	Layer::new(spec)
}
