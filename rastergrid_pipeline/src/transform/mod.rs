//! The per-tile transform engine: plans memory-sized super-windows over the
//! destination block grid, then executes read → calc → cast → write for each
//! of them, sequentially or with a per-tile worker pool.
//!
//! Sequential mode keeps one source view for the whole tile and writes every
//! window into the shared output file; all window buffers are dropped when
//! their scope ends, so no pixel data outlives its window. Parallel mode
//! gives every super-window its own source view and temporary file and
//! merges the temporaries through a VRT into the final output.

pub mod windows;

use crate::calc::{self, Bindings, Expr};
use crate::layer::OutputFormat;
use crate::source::{get_spatial_ref, GdalSourceView, RasterSourceView};
use crate::tile::Tile;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use gdal::raster::{Buffer, RasterCreationOptions};
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags};
use ndarray::Array2;
use rastergrid_core::{
	Bounds, CancelFlag, Crs, DataType, DestinationProfile, GlobalResourceState, MaskedArray, RasterGridError,
	RetryPolicy, Window,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a worker needs to open its own source view; cheap to clone
/// into `spawn_blocking` closures.
#[derive(Clone)]
struct ViewParams {
	vrt_path: PathBuf,
	crs: Crs,
	transform: rastergrid_core::GeoTransform,
	world: Bounds,
	resampling: crate::layer::Resampling,
	warp_memory: u64,
	retry: RetryPolicy,
}

impl ViewParams {
	fn open(&self) -> Result<GdalSourceView> {
		GdalSourceView::open(
			&self.vrt_path,
			self.crs,
			self.transform,
			self.world,
			self.resampling,
			self.warp_memory,
			self.retry,
		)
	}
}

/// Drives the transform of single tiles. One engine is shared by the whole
/// pipeline run.
pub struct TransformEngine {
	resources: GlobalResourceState,
	retry: RetryPolicy,
	cancel: CancelFlag,
}

impl TransformEngine {
	pub fn new(resources: GlobalResourceState, retry: RetryPolicy, cancel: CancelFlag) -> TransformEngine {
		TransformEngine {
			resources,
			retry,
			cancel,
		}
	}

	/// Transform one tile into its local output file.
	///
	/// Returns `Ok(true)` when the output contains data, `Ok(false)` when
	/// every window was empty (the tile should be skipped). Errors are
	/// tile-fatal; partial local files are removed by the caller's cleanup.
	pub async fn transform_tile(&self, tile: &mut Tile) -> Result<bool> {
		log::info!("transform tile {}", tile.tile_id);
		let has_calc = tile.layer.has_calc();
		let calc_expr = self.compile_calc(tile)?;

		let vrt_path = tile
			.vrt_path()
			.context("tile source is not prepared; call Tile::prepare before transforming")?
			.to_path_buf();

		let params = ViewParams {
			vrt_path,
			crs: tile.dst.crs,
			transform: tile.dst.transform,
			world: tile.layer.grid.world_bounds(),
			resampling: tile.layer.spec.resampling,
			warp_memory: self.resources.per_process_memory,
			retry: self.retry,
		};

		let windows = self.plan_windows(tile, &params, has_calc).await?;
		if windows.is_empty() {
			log::debug!("tile {} has no overlap with the source after snapping", tile.tile_id);
			return Ok(false);
		}

		let co_workers = self.resources.co_workers();
		let has_data = if co_workers >= 2 {
			log::info!("process tile {} with {co_workers} co-workers", tile.tile_id);
			self.process_windows_parallel(tile, &params, &windows, calc_expr, co_workers).await?
		} else {
			log::info!("process tile {} with a single worker", tile.tile_id);
			self.process_windows_sequential(tile, &params, &windows, calc_expr).await?
		};

		if has_data {
			tile.set_local(OutputFormat::Raster);
		}
		Ok(has_data)
	}

	/// Compile and statically validate the layer's calc expression, if any.
	fn compile_calc(&self, tile: &Tile) -> Result<Option<Arc<Expr>>> {
		match &tile.layer.spec.calc {
			None => Ok(None),
			Some(src) => Ok(Some(Arc::new(calc::compile(src, &["A"])?))),
		}
	}

	/// Open the source once to derive the snapped intersecting window, then
	/// cut it into super-windows.
	async fn plan_windows(&self, tile: &Tile, params: &ViewParams, has_calc: bool) -> Result<Vec<Window>> {
		let grid = tile.layer.grid;
		let profile = tile.dst.clone();
		let block_count = windows::block_count(&profile, &self.resources, has_calc);
		log::debug!(
			"tile {}: {} blocks per super-window side, {} bytes per block",
			tile.tile_id,
			block_count,
			profile.block_byte_size()
		);

		let params = params.clone();
		tokio::task::spawn_blocking(move || -> Result<Vec<Window>> {
			let view = params.open()?;
			let snapped = windows::snap_bounds(&grid, &view.bounds());
			Ok(match windows::intersecting_window(&profile, &snapped) {
				Some(intersecting) => windows::plan(&profile, &intersecting, block_count),
				None => Vec::new(),
			})
		})
		.await
		.context("window planning task panicked")?
	}

	/// One view for the whole tile; windows processed in row-major order into
	/// the shared output file, which is created up front with the full
	/// destination profile.
	async fn process_windows_sequential(
		&self,
		tile: &mut Tile,
		params: &ViewParams,
		windows: &[Window],
		calc_expr: Option<Arc<Expr>>,
	) -> Result<bool> {
		let out_path = tile.local_path(OutputFormat::Raster);
		let profile = tile.dst.clone();
		let params = params.clone();
		let windows = windows.to_vec();
		let cancel = self.cancel.clone();
		let tile_id = tile.tile_id.clone();

		tokio::task::spawn_blocking(move || -> Result<bool> {
			create_output_file(&out_path, &profile, profile.width, profile.height, &profile.transform)?;
			let view = params.open()?;
			let mut has_data = false;
			for window in &windows {
				if cancel.is_cancelled() {
					bail!("transform of tile {tile_id} cancelled");
				}
				// the window's arrays live only inside this scope
				if let Some(array) = read_and_compute(&view, window, calc_expr.as_deref())? {
					let data = cast_to_dtype(&array, &profile);
					drop(array);
					let mut dataset = open_for_update(&out_path)?;
					write_window(&mut dataset, window, &data, profile.dtype)
						.with_context(|| transform_error(format!("failed to write {window:?} of tile {tile_id}")))?;
					has_data = true;
				} else {
					log::debug!("{window:?} of tile {tile_id} has no data, skipping");
				}
			}
			Ok(has_data)
		})
		.await
		.context("sequential transform task panicked")?
	}

	/// Every super-window gets its own view and temporary file; the
	/// temporaries are merged through a VRT into the final output once all
	/// workers have finished.
	async fn process_windows_parallel(
		&self,
		tile: &mut Tile,
		params: &ViewParams,
		windows: &[Window],
		calc_expr: Option<Arc<Expr>>,
		co_workers: usize,
	) -> Result<bool> {
		let tmp_dir = tile.tmp_dir();
		std::fs::create_dir_all(&tmp_dir).with_context(|| format!("failed to create {tmp_dir:?}"))?;

		let results: Vec<Option<PathBuf>> = stream::iter(windows.iter().copied())
			.map(|window| {
				let params = params.clone();
				let calc_expr = calc_expr.clone();
				let cancel = self.cancel.clone();
				let profile = tile.dst.clone();
				let tmp_dir = tmp_dir.clone();
				let tile_id = tile.tile_id.clone();
				async move {
					tokio::task::spawn_blocking(move || -> Result<Option<PathBuf>> {
						if cancel.is_cancelled() {
							bail!("transform of tile {tile_id} cancelled");
						}
						let view = params.open()?;
						let array = match read_and_compute(&view, &window, calc_expr.as_deref())? {
							Some(array) => array,
							None => return Ok(None),
						};
						let data = cast_to_dtype(&array, &profile);
						drop(array);
						let path = tmp_dir.join(format!("{tile_id}_{}_{}.tif", window.col_off, window.row_off));
						let sub_transform = profile.transform.window_transform(&window);
						create_output_file(&path, &profile, window.width, window.height, &sub_transform)?;
						let mut dataset = open_for_update(&path)?;
						write_window(&mut dataset, &Window::new(0, 0, window.width, window.height), &data, profile.dtype)
							.with_context(|| transform_error(format!("failed to write {window:?} of tile {tile_id}")))?;
						Ok(Some(path))
					})
					.await
					.context("window transform task panicked")?
				}
			})
			.buffer_unordered(co_workers)
			.try_collect()
			.await?;

		let temp_files: Vec<PathBuf> = results.into_iter().flatten().collect();
		if temp_files.is_empty() {
			return Ok(false);
		}

		let out_path = tile.local_path(OutputFormat::Raster);
		let profile = tile.dst.clone();
		let tile_id = tile.tile_id.clone();
		tokio::task::spawn_blocking(move || -> Result<()> {
			merge_window_files(&temp_files, &out_path, &profile)
				.with_context(|| transform_error(format!("failed to assemble tile {tile_id}")))?;
			for path in &temp_files {
				log::debug!("delete temporary file {path:?}");
				let _ = std::fs::remove_file(path);
			}
			Ok(())
		})
		.await
		.context("merge task panicked")??;
		Ok(true)
	}
}

fn transform_error(message: String) -> RasterGridError {
	RasterGridError::Transform(message)
}

/// read → has_data check → calc. Returns the destination-ready array, or
/// `None` when every pixel of the window is masked.
fn read_and_compute(view: &GdalSourceView, window: &Window, calc_expr: Option<&Expr>) -> Result<Option<MaskedArray>> {
	let array = view.read(window)?;
	if !array.has_data() {
		return Ok(None);
	}
	let array = match calc_expr {
		None => array,
		Some(expr) => {
			let bindings: Bindings = Bindings::from([("A".to_string(), array)]);
			calc::evaluate_expr(expr, &bindings).context("calc evaluation failed")?
		}
	};
	Ok(Some(array))
}

/// Enforce the destination dtype and nodata: masked cells become the nodata
/// value when one is configured, otherwise the raw data is cast as-is.
fn cast_to_dtype(array: &MaskedArray, profile: &DestinationProfile) -> Array2<f64> {
	match profile.nodata {
		Some(nodata) => array.filled(nodata),
		None => array.data.clone(),
	}
}

pub(crate) fn creation_options(profile: &DestinationProfile) -> RasterCreationOptions {
	let mut options = vec![
		"TILED=YES".to_string(),
		"INTERLEAVE=BAND".to_string(),
		format!("COMPRESS={}", profile.compression.as_gdal_option()),
		format!("BLOCKXSIZE={}", profile.block_x_size),
		format!("BLOCKYSIZE={}", profile.block_y_size),
	];
	if let Some(nbits) = profile.nbits {
		options.push(format!("NBITS={nbits}"));
	}
	RasterCreationOptions::from_iter(options)
}

/// Create a GeoTIFF with the profile's band layout and the given shape and
/// transform (full tile, or one window of it).
fn create_output_file(
	path: &Path,
	profile: &DestinationProfile,
	width: u64,
	height: u64,
	transform: &rastergrid_core::GeoTransform,
) -> Result<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).with_context(|| format!("failed to create {parent:?}"))?;
	}
	let driver = DriverManager::get_driver_by_name("GTiff").context("failed to get GTiff driver")?;
	let options = creation_options(profile);

	macro_rules! create_as {
		($t:ty) => {
			driver.create_with_band_type_with_options::<$t, _>(path, width as usize, height as usize, 1, &options)
		};
	}
	let mut dataset = match profile.dtype {
		DataType::Uint8 => create_as!(u8),
		DataType::Uint16 => create_as!(u16),
		DataType::Int16 => create_as!(i16),
		DataType::Uint32 => create_as!(u32),
		DataType::Int32 => create_as!(i32),
		DataType::Float32 => create_as!(f32),
		DataType::Float64 => create_as!(f64),
	}
	.with_context(|| transform_error(format!("failed to create output file {path:?}")))?;

	dataset.set_geo_transform(&transform.to_gdal())?;
	dataset.set_spatial_ref(&get_spatial_ref(profile.crs.epsg())?)?;
	if let Some(nodata) = profile.nodata {
		dataset.rasterband(1)?.set_no_data_value(Some(nodata))?;
	}
	Ok(())
}

fn open_for_update(path: &Path) -> Result<Dataset> {
	Dataset::open_ex(
		path,
		DatasetOptions {
			open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
			..Default::default()
		},
	)
	.with_context(|| format!("failed to open {path:?} for update"))
}

/// Write one destination-ready (already cast and filled) window into
/// `dataset` at the window's offset.
fn write_window(dataset: &mut Dataset, window: &Window, data: &Array2<f64>, dtype: DataType) -> Result<()> {
	let width = window.width as usize;
	let height = window.height as usize;
	let offset = (window.col_off as isize, window.row_off as isize);

	let mut band = dataset.rasterband(1)?;
	macro_rules! write_as {
		($t:ty) => {{
			let values: Vec<$t> = data.iter().map(|&value| value as $t).collect();
			let mut buffer = Buffer::new((width, height), values);
			band.write(offset, (width, height), &mut buffer)?;
		}};
	}
	match dtype {
		DataType::Uint8 => write_as!(u8),
		DataType::Uint16 => write_as!(u16),
		DataType::Int16 => write_as!(i16),
		DataType::Uint32 => write_as!(u32),
		DataType::Int32 => write_as!(i32),
		DataType::Float32 => write_as!(f32),
		DataType::Float64 => write_as!(f64),
	}
	Ok(())
}

/// Assemble window files into the final tile: a VRT pinned to the full tile
/// extent, materialized into a single GeoTIFF with the destination profile.
fn merge_window_files(temp_files: &[PathBuf], out_path: &Path, profile: &DestinationProfile) -> Result<()> {
	if let Some(parent) = out_path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let datasets: Vec<Dataset> = temp_files
		.iter()
		.map(|path| Dataset::open(path).with_context(|| format!("failed to open temporary file {path:?}")))
		.collect::<Result<_>>()?;

	let bounds = profile.bounds();
	let vrt_args: Vec<String> = vec![
		"-te".to_string(),
		bounds.west.to_string(),
		bounds.south.to_string(),
		bounds.east.to_string(),
		bounds.north.to_string(),
	];
	let vrt_path = out_path.with_extension("vrt");
	let vrt = gdal::programs::raster::build_vrt(
		Some(&vrt_path),
		&datasets,
		Some(gdal::programs::raster::BuildVRTOptions::new(vrt_args)?),
	)
	.context("failed to build merge VRT")?;

	let driver = DriverManager::get_driver_by_name("GTiff").context("failed to get GTiff driver")?;
	vrt
		.create_copy(&driver, out_path, &creation_options(profile))
		.with_context(|| format!("failed to materialize {out_path:?}"))?;
	drop(vrt);
	let _ = std::fs::remove_file(&vrt_path);
	Ok(())
}
