//! Post-processing hook, invoked once per tile after a successful transform.

use crate::layer::OutputFormat;
use crate::tile::Tile;
use crate::transform::creation_options;
use anyhow::{Context, Result};
use async_trait::async_trait;
use gdal::{Dataset, DriverManager};
use rastergrid_core::DestinationProfile;
use std::path::Path;

/// Extension point after the transform: compute stats, histograms or
/// alternate output formats. A failure fails the tile.
#[async_trait]
pub trait Postprocess: Send + Sync {
	async fn run(&self, tile: &mut Tile) -> Result<()>;
}

/// No-op hook, used when only the primary output is wanted.
pub struct NoPostprocess;

#[async_trait]
impl Postprocess for NoPostprocess {
	async fn run(&self, _tile: &mut Tile) -> Result<()> {
		Ok(())
	}
}

/// Stock hook: materialize the DEFLATE-compressed `geotiff` variant of the
/// primary output, with the same grid profile.
pub struct GdalGeotiff;

#[async_trait]
impl Postprocess for GdalGeotiff {
	async fn run(&self, tile: &mut Tile) -> Result<()> {
		let src = tile.local_path(OutputFormat::Raster);
		if !src.exists() {
			return Ok(());
		}
		let dst = tile.local_path(OutputFormat::Geotiff);
		let profile = tile.dst.with_compression(OutputFormat::Geotiff.compression());
		log::debug!("create geotiff variant for tile {}", tile.tile_id);
		tokio::task::spawn_blocking(move || copy_with_profile(&src, &dst, &profile))
			.await
			.context("geotiff variant task panicked")??;
		tile.set_local(OutputFormat::Geotiff);
		Ok(())
	}
}

fn copy_with_profile(src: &Path, dst: &Path, profile: &DestinationProfile) -> Result<()> {
	if let Some(parent) = dst.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let source = Dataset::open(src).with_context(|| format!("failed to open {src:?}"))?;
	let driver = DriverManager::get_driver_by_name("GTiff").context("failed to get GTiff driver")?;
	source
		.create_copy(&driver, dst, &creation_options(profile))
		.with_context(|| format!("failed to write {dst:?}"))?;
	Ok(())
}
