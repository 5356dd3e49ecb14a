//! Raster source view: a set of intersecting input rasters presented as one
//! warped dataset in the destination CRS.
//!
//! The inputs are stitched into a VRT once per tile; each view (one per
//! worker in parallel window mode) opens that VRT and serves windowed reads
//! by warping into an in-memory dataset carrying the window's transform.

use crate::layer::Resampling;
use crate::storage::to_vsi_path;
use anyhow::{bail, Context, Result};
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use rastergrid_core::error::{is_transient_io, is_terminal_io};
use rastergrid_core::{Bounds, Crs, GeoTransform, MaskedArray, RasterGridError, RetryPolicy, Window};
use std::path::{Path, PathBuf};

/// Windowed access to source pixels, reprojected and resampled onto the
/// destination grid. The vector rasterization path plugs in behind this same
/// trait.
pub trait RasterSourceView {
	/// Source extent reprojected into the destination CRS and clamped to the
	/// world bounds of that CRS.
	fn bounds(&self) -> Bounds;

	/// Read one window (in destination tile pixel space) as a masked array.
	fn read(&self, window: &Window) -> Result<MaskedArray>;
}

pub fn get_spatial_ref(epsg: u32) -> Result<SpatialRef> {
	let mut srs = SpatialRef::from_epsg(epsg).with_context(|| format!("failed to build spatial reference {epsg}"))?;
	srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
	Ok(srs)
}

/// Stitch `inputs` (remote URIs or local paths) into a VRT at `vrt_path`.
///
/// Opening the inputs is where missing or unreadable sources surface; those
/// fail immediately with [`RasterGridError::SourceUnavailable`] while
/// transient I/O errors are retried per `retry`.
pub fn build_vrt(inputs: &[String], vrt_path: &Path, retry: &RetryPolicy) -> Result<PathBuf> {
	anyhow::ensure!(!inputs.is_empty(), "cannot build a VRT from zero inputs");
	let datasets: Vec<Dataset> = inputs
		.iter()
		.map(|uri| {
			let vsi = to_vsi_path(uri);
			retry
				.run_blocking("open source raster", is_transient_io, || {
					Dataset::open(Path::new(&vsi)).with_context(|| format!("failed to open source raster {uri}"))
				})
				.map_err(|err| source_unavailable(err, uri))
		})
		.collect::<Result<_>>()?;
	gdal::programs::raster::build_vrt(Some(vrt_path), &datasets, None)
		.with_context(|| format!("failed to build VRT {vrt_path:?}"))?;
	log::debug!("built VRT {vrt_path:?} over {} inputs", datasets.len());
	Ok(vrt_path.to_path_buf())
}

fn source_unavailable(err: anyhow::Error, what: &str) -> anyhow::Error {
	let class = RasterGridError::SourceUnavailable(format!("{what}: {err:#}"));
	err.context(class)
}

/// GDAL implementation of [`RasterSourceView`].
///
/// Not `Sync`: every worker opens its own view, exactly so that no GDAL
/// handle is shared between threads.
pub struct GdalSourceView {
	dataset: Dataset,
	src_nodata: Option<f64>,
	dst_crs: Crs,
	dst_transform: GeoTransform,
	resampling: Resampling,
	warp_memory: u64,
	bounds: Bounds,
	retry: RetryPolicy,
}

impl GdalSourceView {
	/// Open the tile's VRT and derive the reprojected source extent.
	///
	/// `dst_transform` is the destination tile transform; read windows are
	/// expressed in its pixel space. `warp_memory` caps the warper's working
	/// set in bytes.
	pub fn open(
		vrt_path: &Path,
		dst_crs: Crs,
		dst_transform: GeoTransform,
		world_bounds: Bounds,
		resampling: Resampling,
		warp_memory: u64,
		retry: RetryPolicy,
	) -> Result<GdalSourceView> {
		let dataset = retry
			.run_blocking("open source VRT", is_transient_io, || {
				Dataset::open(vrt_path).with_context(|| format!("failed to open VRT {vrt_path:?}"))
			})
			.map_err(|err| source_unavailable(err, &vrt_path.display().to_string()))?;
		let src_nodata = dataset.rasterband(1)?.no_data_value();
		let bounds = reproject_bounds(&dataset, dst_crs, &world_bounds)?;
		Ok(GdalSourceView {
			dataset,
			src_nodata,
			dst_crs,
			dst_transform,
			resampling,
			warp_memory,
			bounds,
			retry,
		})
	}

	pub fn src_nodata(&self) -> Option<f64> {
		self.src_nodata
	}

	/// One warp+read attempt for `window`.
	fn read_once(&self, window: &Window) -> Result<MaskedArray> {
		let bounds = self.dst_transform.window_bounds(window);
		let width = window.width as usize;
		let height = window.height as usize;
		let fill = self.src_nodata.unwrap_or(f64::NAN);

		let driver = DriverManager::get_driver_by_name("MEM").context("failed to get GDAL MEM driver")?;
		let mut dst = driver
			.create_with_band_type::<f64, _>("", width, height, 1)
			.context("failed to create in-memory window dataset")?;
		dst.set_spatial_ref(&get_spatial_ref(self.dst_crs.epsg())?)?;
		dst.set_geo_transform(
			&GeoTransform::from_origin(bounds.west, bounds.north, self.dst_transform.x_res, self.dst_transform.y_res).to_gdal(),
		)?;
		dst.rasterband(1)?.set_no_data_value(Some(fill))?;

		self.warp_into(&dst, width, height)?;

		let buffer = dst.rasterband(1)?.read_band_as::<f64>()?;
		let data = Array2::from_shape_vec((height, width), buffer.data().to_vec())
			.context("window buffer does not match window shape")?;
		Ok(MaskedArray::from_nodata(data, Some(fill)))
	}

	fn warp_into(&self, dst: &Dataset, width: usize, height: usize) -> Result<()> {
		let h_src_ds = self.dataset.c_dataset();
		let h_dst_ds = dst.c_dataset();

		unsafe {
			use gdal_sys::*;

			let mut options: GDALWarpOptions = *GDALCreateWarpOptions();
			options.hSrcDS = h_src_ds;
			options.hDstDS = h_dst_ds;

			options.nBandCount = 1;
			options.panSrcBands = CPLMalloc(std::mem::size_of::<i32>()) as *mut i32;
			options.panDstBands = CPLMalloc(std::mem::size_of::<i32>()) as *mut i32;
			options.panSrcBands.write(1);
			options.panDstBands.write(1);

			if let Some(nodata) = self.src_nodata {
				options.padfSrcNoDataReal = CPLMalloc(std::mem::size_of::<f64>()) as *mut f64;
				options.padfDstNoDataReal = CPLMalloc(std::mem::size_of::<f64>()) as *mut f64;
				options.padfSrcNoDataReal.write(nodata);
				options.padfDstNoDataReal.write(nodata);
			} else {
				options.padfDstNoDataReal = CPLMalloc(std::mem::size_of::<f64>()) as *mut f64;
				options.padfDstNoDataReal.write(f64::NAN);
			}

			options.papszWarpOptions = CSLSetNameValue(options.papszWarpOptions, c"INIT_DEST".as_ptr(), c"NO_DATA".as_ptr());
			options.papszWarpOptions = CSLSetNameValue(
				options.papszWarpOptions,
				c"UNIFIED_SRC_NODATA".as_ptr(),
				c"YES".as_ptr(),
			);

			options.eResampleAlg = self.resampling.as_gdal();
			options.dfWarpMemoryLimit = self.warp_memory as f64;

			options.pTransformerArg = GDALCreateGenImgProjTransformer2(h_src_ds, h_dst_ds, core::ptr::null_mut());
			options.pfnTransformer = Some(GDALGenImgProjTransform);

			let operation: GDALWarpOperationH = GDALCreateWarpOperation(&options);
			let rv = GDALChunkAndWarpImage(operation, 0, 0, width as i32, height as i32);

			GDALDestroyWarpOperation(operation);
			GDALDestroyGenImgProjTransformer(options.pTransformerArg);

			if rv != CPLErr::CE_None {
				let message = std::ffi::CStr::from_ptr(CPLGetLastErrorMsg()).to_string_lossy().into_owned();
				bail!("warp failed: {message}");
			}
		}
		Ok(())
	}
}

impl RasterSourceView for GdalSourceView {
	fn bounds(&self) -> Bounds {
		self.bounds
	}

	/// Read with retries; terminal I/O classes and exhausted budgets surface
	/// as [`RasterGridError::SourceUnavailable`].
	fn read(&self, window: &Window) -> Result<MaskedArray> {
		self
			.retry
			.run_blocking("read source window", is_transient_io, || {
				self
					.read_once(window)
					.with_context(|| format!("failed to read {window:?}"))
			})
			.map_err(|err| {
				if is_terminal_io(&err) {
					source_unavailable(err, "source read")
				} else {
					err
				}
			})
	}
}

/// Reproject the dataset's native extent into `dst_crs`, replacing
/// non-finite coordinates with the world edge and clamping into the world
/// bounds. Values are rounded to 8 decimals to keep snapping stable.
fn reproject_bounds(dataset: &Dataset, dst_crs: Crs, world: &Bounds) -> Result<Bounds> {
	let gt = dataset.geo_transform().context("source has no geo transform")?;
	anyhow::ensure!(gt[2] == 0.0 && gt[4] == 0.0, "source raster must not be rotated");
	let (width, height) = dataset.raster_size();
	let native = [
		gt[0],
		gt[3] + gt[5] * height as f64,
		gt[0] + gt[1] * width as f64,
		gt[3],
	];

	let src_ref = dataset.spatial_ref().context("source has no spatial reference")?;
	let transform = CoordTransform::new(&src_ref, &get_spatial_ref(dst_crs.epsg())?)
		.context("failed to create coordinate transform to destination CRS")?;
	let projected = transform.transform_bounds(&native, 21)?;

	let round8 = |value: f64| (value * 1e8).round() / 1e8;
	let clean = |value: f64, fallback: f64| if value.is_finite() { round8(value) } else { fallback };

	let bounds = Bounds {
		west: clean(projected[0], world.west).clamp(world.west, world.east),
		south: clean(projected[1], world.south).clamp(world.south, world.north),
		east: clean(projected[2], world.east).clamp(world.west, world.east),
		north: clean(projected[3], world.north).clamp(world.south, world.north),
	};
	log::debug!("source bounds reprojected to {}: {bounds:?}", dst_crs.authority());
	Ok(bounds)
}

#[cfg(test)]
mod tests {
	use super::*;
	use gdal::raster::Buffer;
	use rastergrid_core::DataType;
	use std::time::Duration;
	use tempfile::TempDir;

	fn quick_retry() -> RetryPolicy {
		RetryPolicy {
			max_attempts: 2,
			base: Duration::from_millis(1),
			cap: Duration::from_millis(2),
		}
	}

	/// A 100x100 uint8 raster covering 10..11E / 9..10N, filled with `value`,
	/// nodata 0.
	fn write_test_raster(path: &Path, value: u8) {
		let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
		let mut dataset = driver.create_with_band_type::<u8, _>(path, 100, 100, 1).unwrap();
		dataset.set_spatial_ref(&get_spatial_ref(4326).unwrap()).unwrap();
		dataset
			.set_geo_transform(&GeoTransform::from_origin(10.0, 10.0, 0.01, 0.01).to_gdal())
			.unwrap();
		let mut band = dataset.rasterband(1).unwrap();
		band.set_no_data_value(Some(0.0)).unwrap();
		let mut buffer = Buffer::new((100, 100), vec![value; 100 * 100]);
		band.write((0, 0), (100, 100), &mut buffer).unwrap();
	}

	fn open_view(vrt_path: &Path) -> GdalSourceView {
		GdalSourceView::open(
			vrt_path,
			Crs::Epsg4326,
			GeoTransform::from_origin(10.0, 10.0, 0.01, 0.01),
			Bounds::new(-180.0, -90.0, 180.0, 90.0).unwrap(),
			Resampling::Nearest,
			64 << 20,
			quick_retry(),
		)
		.unwrap()
	}

	#[test]
	fn test_build_vrt_and_read() {
		let dir = TempDir::new().unwrap();
		let raster = dir.path().join("src.tif");
		write_test_raster(&raster, 7);

		let vrt = dir.path().join("tile.vrt");
		build_vrt(&[raster.display().to_string()], &vrt, &quick_retry()).unwrap();
		assert!(vrt.exists());

		let view = open_view(&vrt);
		assert_eq!(view.src_nodata(), Some(0.0));
		let bounds = view.bounds();
		assert!((bounds.west - 10.0).abs() < 1e-9);
		assert!((bounds.north - 10.0).abs() < 1e-9);

		let array = view.read(&Window::new(0, 0, 50, 50)).unwrap();
		assert_eq!(array.shape(), (50, 50));
		assert!(array.has_data());
		assert_eq!(array.data[[0, 0]], 7.0);
		assert_eq!(array.valid_count(), 50 * 50);
	}

	#[test]
	fn test_read_outside_source_is_fully_masked() {
		let dir = TempDir::new().unwrap();
		let raster = dir.path().join("src.tif");
		write_test_raster(&raster, 7);
		let vrt = dir.path().join("tile.vrt");
		build_vrt(&[raster.display().to_string()], &vrt, &quick_retry()).unwrap();

		let view = open_view(&vrt);
		// window far east of the 1x1 degree source
		let array = view.read(&Window::new(1000, 0, 10, 10)).unwrap();
		assert!(!array.has_data());
	}

	#[test]
	fn test_build_vrt_missing_input_is_source_unavailable() {
		let dir = TempDir::new().unwrap();
		let vrt = dir.path().join("tile.vrt");
		let err = build_vrt(&["/nowhere/missing.tif".to_string()], &vrt, &quick_retry()).unwrap_err();
		assert!(matches!(
			RasterGridError::classify(&err),
			Some(RasterGridError::SourceUnavailable(_))
		));
	}

	#[test]
	fn test_dtype_of_mem_read_is_float() {
		// reads always come back as f64 regardless of source dtype
		let dir = TempDir::new().unwrap();
		let raster = dir.path().join("src.tif");
		write_test_raster(&raster, 200);
		let vrt = dir.path().join("tile.vrt");
		build_vrt(&[raster.display().to_string()], &vrt, &quick_retry()).unwrap();
		let view = open_view(&vrt);
		let array = view.read(&Window::new(0, 0, 4, 4)).unwrap();
		assert_eq!(array.data[[3, 3]], 200.0);
		assert_eq!(DataType::Float64.item_size(), 8);
	}
}
