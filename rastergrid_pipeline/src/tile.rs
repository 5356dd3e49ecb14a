//! Per-tile identity and lifecycle: destination profile, work directory,
//! source resolution, upload and cleanup.

use crate::catalog::{bounds_to_polygon, SourceCatalog};
use crate::layer::{Layer, OutputFormat};
use crate::source::build_vrt;
use crate::storage::{split_s3_uri, ObjectStore};
use anyhow::{Context, Result};
use geo::Polygon;
use rastergrid_core::{Bounds, DestinationProfile, RasterGridError, RetryPolicy, TileId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle state of a tile. Transitions are monotonic toward a terminal
/// value: `Pending` may move to any other state, `Succeeded` may still fail
/// during upload, `Skipped` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
	Pending,
	Skipped,
	Failed,
	Succeeded,
}

impl TileStatus {
	fn may_transition_to(&self, next: TileStatus) -> bool {
		match self {
			TileStatus::Pending => true,
			TileStatus::Succeeded => next == TileStatus::Failed,
			TileStatus::Skipped | TileStatus::Failed => false,
		}
	}
}

/// One grid cell of the output, owned by the pipeline that drives it.
///
/// The identity fields (`tile_id`, `layer`, `dst`) are fixed at construction;
/// only `status`, the resolved source and the local file set change as the
/// tile moves through the stages.
pub struct Tile {
	pub tile_id: TileId,
	pub layer: Arc<Layer>,
	pub dst: DestinationProfile,
	status: TileStatus,
	error: Option<String>,
	work_dir: PathBuf,
	local: BTreeMap<&'static str, (OutputFormat, PathBuf)>,
	input_uris: Vec<String>,
	vrt_path: Option<PathBuf>,
}

impl Tile {
	pub fn new(tile_id: TileId, layer: Arc<Layer>, work_root: &Path) -> Result<Tile> {
		let dst = layer.destination_profile(&tile_id, OutputFormat::Raster)?;
		let work_dir = work_root.join(tile_id.as_str());
		Ok(Tile {
			tile_id,
			layer,
			dst,
			status: TileStatus::Pending,
			error: None,
			work_dir,
			local: BTreeMap::new(),
			input_uris: Vec::new(),
			vrt_path: None,
		})
	}

	pub fn status(&self) -> TileStatus {
		self.status
	}

	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}

	pub fn is_pending(&self) -> bool {
		self.status == TileStatus::Pending
	}

	fn transition(&mut self, next: TileStatus) {
		debug_assert!(
			self.status.may_transition_to(next),
			"illegal status transition {:?} -> {next:?} for tile {}",
			self.status,
			self.tile_id
		);
		self.status = next;
	}

	pub fn mark_skipped(&mut self, reason: &str) {
		log::debug!("tile {} skipped: {reason}", self.tile_id);
		self.transition(TileStatus::Skipped);
	}

	pub fn mark_failed(&mut self, err: &anyhow::Error) {
		log::error!("tile {} failed: {err:#}", self.tile_id);
		self.error = Some(format!("{err:#}"));
		self.transition(TileStatus::Failed);
	}

	pub fn mark_succeeded(&mut self) {
		self.transition(TileStatus::Succeeded);
	}

	/// Tile extent in grid CRS units.
	pub fn bounds(&self) -> Bounds {
		self.dst.bounds()
	}

	/// Tile extent as a geographic polygon, for manifest intersection tests.
	pub fn geographic_geom(&self) -> Result<Polygon<f64>> {
		let bounds = self.layer.grid.tile_geographic_bounds(&self.tile_id)?;
		Ok(bounds_to_polygon(&bounds))
	}

	/// True when the tile overlaps the layer's source footprint by more than
	/// a shared boundary.
	pub fn intersects_source(&self, catalog: &SourceCatalog) -> Result<bool> {
		Ok(catalog.intersects(&self.geographic_geom()?))
	}

	/// True when the primary destination object already exists.
	pub async fn dst_exists(&self, store: &dyn ObjectStore, bucket: &str) -> Result<bool> {
		let key = self.layer.remote_key(&self.tile_id, OutputFormat::Raster);
		store.exists(bucket, &key).await
	}

	pub fn work_dir(&self) -> &Path {
		&self.work_dir
	}

	/// Scratch directory for parallel-mode window files.
	pub fn tmp_dir(&self) -> PathBuf {
		self.work_dir.join("tmp")
	}

	/// Local file path of one output format.
	pub fn local_path(&self, format: OutputFormat) -> PathBuf {
		self
			.work_dir
			.join(format.key_segment())
			.join(format!("{}.tif", self.tile_id))
	}

	/// Record that the local file of `format` has been produced.
	pub fn set_local(&mut self, format: OutputFormat) {
		self.local.insert(format.key_segment(), (format, self.local_path(format)));
	}

	pub fn local_files(&self) -> impl Iterator<Item = (OutputFormat, &Path)> {
		self.local.values().map(|(format, path)| (*format, path.as_path()))
	}

	/// URIs of the manifest inputs intersecting this tile, resolved by
	/// [`Tile::prepare`].
	pub fn input_uris(&self) -> &[String] {
		&self.input_uris
	}

	/// VRT over the intersecting inputs, built by [`Tile::prepare`].
	pub fn vrt_path(&self) -> Option<&Path> {
		self.vrt_path.as_deref()
	}

	/// Resolve the tile's source: select intersecting inputs, download them
	/// when the layer asks for local processing, and stitch them into a VRT.
	///
	/// Must be called before the transform stage; the transform never
	/// triggers downloads on its own.
	pub async fn prepare(&mut self, catalog: &SourceCatalog, store: &dyn ObjectStore, retry: &RetryPolicy) -> Result<()> {
		let geom = self.geographic_geom()?;
		let mut inputs = catalog.intersecting(&geom);
		if inputs.is_empty() {
			return Err(
				RasterGridError::SourceUnavailable(format!("no source files intersect tile {}", self.tile_id)).into(),
			);
		}
		log::debug!("tile {} intersects {} input files", self.tile_id, inputs.len());

		if self.layer.spec.process_locally {
			let mut local_inputs = Vec::with_capacity(inputs.len());
			for uri in &inputs {
				local_inputs.push(self.download_input(uri, store).await?);
			}
			inputs = local_inputs;
		}

		std::fs::create_dir_all(&self.work_dir).with_context(|| format!("failed to create {:?}", self.work_dir))?;
		let vrt_path = self.work_dir.join(format!("{}.vrt", self.tile_id));
		let retry = *retry;
		let built = tokio::task::spawn_blocking(move || build_vrt(&inputs, &vrt_path, &retry))
		.await
		.context("VRT build task panicked")??;

		self.input_uris = catalog.intersecting(&geom);
		self.vrt_path = Some(built);
		Ok(())
	}

	/// Fetch one remote input into `{work_dir}/input/{bucket}/{key}`.
	/// Non-S3 URIs stay remote and are read through GDAL's virtual
	/// filesystem instead.
	async fn download_input(&self, uri: &str, store: &dyn ObjectStore) -> Result<String> {
		let (bucket, key) = match split_s3_uri(uri) {
			Ok(parts) => parts,
			Err(_) => {
				log::warn!("cannot download {uri} for local processing, reading it remotely");
				return Ok(uri.to_string());
			}
		};
		let dest = self.work_dir.join("input").join(bucket).join(key);
		store
			.download(bucket, key, &dest)
			.await
			.with_context(|| format!("failed to download {uri}"))?;
		Ok(dest.display().to_string())
	}

	/// Upload every produced local file to its remote key. The tile keeps
	/// its local files; [`Tile::rm_local`] removes them afterwards.
	pub async fn upload(&self, store: &dyn ObjectStore, bucket: &str) -> Result<()> {
		for (format, path) in self.local_files() {
			let key = self.layer.remote_key(&self.tile_id, format);
			store
				.upload(path, bucket, &key)
				.await
				.with_context(|| format!("failed to upload tile {}", self.tile_id))?;
			log::info!("uploaded {} to s3://{bucket}/{key}", self.tile_id);
		}
		Ok(())
	}

	/// Remove the tile's whole work directory, including temporaries and
	/// downloaded inputs. Safe to call repeatedly.
	pub fn rm_local(&mut self) {
		if self.work_dir.exists() {
			if let Err(err) = std::fs::remove_dir_all(&self.work_dir) {
				log::warn!("failed to remove {:?}: {err}", self.work_dir);
			}
		}
		self.local.clear();
	}
}

impl std::fmt::Debug for Tile {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Tile({}, {:?})", self.tile_id, self.status)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::InputFile;
	use crate::layer::LayerSpec;
	use crate::storage::MemoryStore;
	use geo::MultiPolygon;
	use tempfile::TempDir;

	fn test_layer() -> Arc<Layer> {
		let spec: LayerSpec = serde_json::from_value(serde_json::json!({
			"dataset": "aqueduct_erosion_risk",
			"version": "v201911",
			"pixel_meaning": "level",
			"source_type": "raster",
			"data_type": "uint8",
			"no_data": 0,
			"grid": "1/4000",
			"source_uri": "s3://rastergrid-data-test/manifest.geojson"
		}))
		.unwrap();
		Arc::new(Layer::new(spec).unwrap())
	}

	fn square_catalog() -> SourceCatalog {
		let footprint = bounds_to_polygon(&Bounds::new(10.0, 9.0, 11.0, 10.0).unwrap());
		SourceCatalog::from_records(vec![InputFile {
			geometry: MultiPolygon::new(vec![footprint]),
			uri: "s3://source-bucket/a.tif".to_string(),
		}])
	}

	#[test]
	fn test_status_transitions() {
		let dir = TempDir::new().unwrap();
		let mut tile = Tile::new(TileId::from("10N_010E"), test_layer(), dir.path()).unwrap();
		assert!(tile.is_pending());
		tile.mark_succeeded();
		assert_eq!(tile.status(), TileStatus::Succeeded);
		// upload failure can still fail a succeeded tile
		tile.mark_failed(&anyhow::anyhow!("upload broke"));
		assert_eq!(tile.status(), TileStatus::Failed);
		assert!(tile.error().unwrap().contains("upload broke"));
	}

	#[test]
	fn test_local_path_layout() {
		let dir = TempDir::new().unwrap();
		let tile = Tile::new(TileId::from("10N_010E"), test_layer(), dir.path()).unwrap();
		assert!(tile
			.local_path(OutputFormat::Raster)
			.ends_with("10N_010E/raster/10N_010E.tif"));
		assert!(tile
			.local_path(OutputFormat::Geotiff)
			.ends_with("10N_010E/geotiff/10N_010E.tif"));
	}

	#[test]
	fn test_intersects_source() {
		let dir = TempDir::new().unwrap();
		let catalog = square_catalog();
		let inside = Tile::new(TileId::from("10N_010E"), test_layer(), dir.path()).unwrap();
		assert!(inside.intersects_source(&catalog).unwrap());
		// 20N_010E only touches the footprint's top edge at y=10... it does
		// not even touch; it is one degree north
		let outside = Tile::new(TileId::from("20N_010E"), test_layer(), dir.path()).unwrap();
		assert!(!outside.intersects_source(&catalog).unwrap());
		// 11N_010E shares the edge y=10 with the footprint: touching only
		let touching = Tile::new(TileId::from("11N_010E"), test_layer(), dir.path()).unwrap();
		assert!(!touching.intersects_source(&catalog).unwrap());
	}

	#[tokio::test]
	async fn test_dst_exists() {
		let dir = TempDir::new().unwrap();
		let store = MemoryStore::new();
		let tile = Tile::new(TileId::from("10N_010E"), test_layer(), dir.path()).unwrap();
		let bucket = "rastergrid-data-test";
		assert!(!tile.dst_exists(&store, bucket).await.unwrap());
		store.put(
			bucket,
			"aqueduct_erosion_risk/v201911/raster/1/4000/level/10N_010E.tif",
			b"tiff".to_vec(),
		);
		assert!(tile.dst_exists(&store, bucket).await.unwrap());
	}

	#[tokio::test]
	async fn test_upload_and_cleanup() {
		let dir = TempDir::new().unwrap();
		let store = MemoryStore::new();
		let mut tile = Tile::new(TileId::from("10N_010E"), test_layer(), dir.path()).unwrap();

		let local = tile.local_path(OutputFormat::Raster);
		std::fs::create_dir_all(local.parent().unwrap()).unwrap();
		std::fs::write(&local, b"tiff bytes").unwrap();
		tile.set_local(OutputFormat::Raster);

		tile.upload(&store, "rastergrid-data-test").await.unwrap();
		assert_eq!(
			store.keys("rastergrid-data-test"),
			vec!["aqueduct_erosion_risk/v201911/raster/1/4000/level/10N_010E.tif".to_string()]
		);

		tile.rm_local();
		assert!(!tile.work_dir().exists());
	}

	#[tokio::test]
	async fn test_prepare_without_intersecting_inputs_is_source_unavailable() {
		let dir = TempDir::new().unwrap();
		let catalog = SourceCatalog::from_records(vec![]);
		let store = MemoryStore::new();
		let mut tile = Tile::new(TileId::from("10N_010E"), test_layer(), dir.path()).unwrap();
		let err = tile
			.prepare(&catalog, &store, &RetryPolicy::default())
			.await
			.unwrap_err();
		assert!(matches!(
			RasterGridError::classify(&err),
			Some(RasterGridError::SourceUnavailable(_))
		));
	}
}
