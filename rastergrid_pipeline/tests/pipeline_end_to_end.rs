//! End-to-end pipeline runs against a real raster on disk: seed, filter,
//! transform through the GDAL engine, postprocess, upload into an in-memory
//! store, clean up.

use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager};
use pretty_assertions::assert_eq;
use rastergrid_core::{Bounds, CancelFlag, EnvSettings, Environment, GeoTransform, TileId};
use rastergrid_pipeline::catalog::{bounds_to_polygon, InputFile};
use rastergrid_pipeline::layer::{Layer, LayerSpec};
use rastergrid_pipeline::source::get_spatial_ref;
use rastergrid_pipeline::{MemoryStore, ObjectStore, Pipe, SourceCatalog};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const BUCKET: &str = "rastergrid-data-test";

fn settings() -> EnvSettings {
	EnvSettings {
		environment: Environment::Test,
		aws_region: "us-east-1".to_string(),
		endpoint_url: None,
		cores: 4,
		// small budget so a tile decomposes into several super-windows
		max_mem: 64 << 20,
	}
}

fn layer(resampling: &str) -> Arc<Layer> {
	let spec: LayerSpec = serde_json::from_value(serde_json::json!({
		"dataset": "aqueduct_erosion_risk",
		"version": "v201911",
		"pixel_meaning": "level",
		"source_type": "raster",
		"data_type": "uint8",
		"no_data": 0,
		"grid": "1/4000",
		"resampling": resampling,
		"source_uri": format!("s3://{BUCKET}/manifest.geojson")
	}))
	.unwrap();
	Arc::new(Layer::new(spec).unwrap())
}

/// A 200x200 uint8 raster covering 10..11E / 9..10N filled with `value`,
/// with nodata 0 in the north-west 20x20 corner.
fn write_source_raster(path: &Path, value: u8) {
	let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
	let mut dataset = driver.create_with_band_type::<u8, _>(path, 200, 200, 1).unwrap();
	dataset.set_spatial_ref(&get_spatial_ref(4326).unwrap()).unwrap();
	dataset
		.set_geo_transform(&GeoTransform::from_origin(10.0, 10.0, 0.005, 0.005).to_gdal())
		.unwrap();
	let mut band = dataset.rasterband(1).unwrap();
	band.set_no_data_value(Some(0.0)).unwrap();
	let mut values = vec![value; 200 * 200];
	for row in 0..20 {
		for col in 0..20 {
			values[row * 200 + col] = 0;
		}
	}
	let mut buffer = Buffer::new((200, 200), values);
	band.write((0, 0), (200, 200), &mut buffer).unwrap();
}

fn catalog_for(source_path: &Path) -> Arc<SourceCatalog> {
	Arc::new(SourceCatalog::from_records(vec![InputFile {
		geometry: geo::MultiPolygon::new(vec![bounds_to_polygon(&Bounds::new(10.0, 9.0, 11.0, 10.0).unwrap())]),
		uri: source_path.display().to_string(),
	}]))
}

#[tokio::test(flavor = "multi_thread")]
async fn full_run_produces_grid_sized_tiles() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("source.tif");
	write_source_raster(&source, 7);

	let store = Arc::new(MemoryStore::new());
	let layer = layer("nearest");
	let subset = Some(vec!["10N_010E".to_string(), "20N_010E".to_string(), "30N_010E".to_string()]);
	let pipe = Pipe::new(
		layer.clone(),
		catalog_for(&source),
		store.clone(),
		&settings(),
		subset,
		dir.path().join("work"),
		CancelFlag::new(),
	)
	.unwrap();

	let results = pipe.create_tiles(true).await.unwrap();
	assert_eq!(results.counts(), (1, 2, 0));
	assert_eq!(results.succeeded[0].tile_id, TileId::from("10N_010E"));

	// both the primary and the geotiff variant were uploaded
	let keys = store.keys(BUCKET);
	assert_eq!(
		keys,
		vec![
			"aqueduct_erosion_risk/v201911/geotiff/1/4000/level/10N_010E.tif".to_string(),
			"aqueduct_erosion_risk/v201911/raster/1/4000/level/10N_010E.tif".to_string(),
		]
	);

	// the output raster has the full grid shape regardless of coverage
	let bytes = store
		.read(BUCKET, "aqueduct_erosion_risk/v201911/raster/1/4000/level/10N_010E.tif")
		.await
		.unwrap();
	let out_path = dir.path().join("check.tif");
	std::fs::write(&out_path, bytes).unwrap();
	let dataset = Dataset::open(&out_path).unwrap();
	assert_eq!(dataset.raster_size(), (4000, 4000));
	let band = dataset.rasterband(1).unwrap();
	assert_eq!(band.no_data_value(), Some(0.0));

	let buffer = band.read_band_as::<u8>().unwrap();
	let values = buffer.data();
	// the source's nodata corner stays nodata in the output
	assert_eq!(values[0], 0);
	// the data area carries the source value
	assert_eq!(values[2000 * 4000 + 2000], 7);

	// local work files are gone
	assert!(!dir.path().join("work").join("10N_010E").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_without_overwrite_skips_existing_tiles() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("source.tif");
	write_source_raster(&source, 9);
	let store = Arc::new(MemoryStore::new());
	let subset = Some(vec!["10N_010E".to_string()]);

	let first = Pipe::new(
		layer("nearest"),
		catalog_for(&source),
		store.clone(),
		&settings(),
		subset.clone(),
		dir.path().join("work1"),
		CancelFlag::new(),
	)
	.unwrap()
	.create_tiles(false)
	.await
	.unwrap();
	assert_eq!(first.counts(), (1, 0, 0));

	let second = Pipe::new(
		layer("nearest"),
		catalog_for(&source),
		store.clone(),
		&settings(),
		subset,
		dir.path().join("work2"),
		CancelFlag::new(),
	)
	.unwrap()
	.create_tiles(false)
	.await
	.unwrap();
	assert_eq!(second.counts(), (0, 1, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn calc_expression_is_applied_per_pixel() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("source.tif");
	write_source_raster(&source, 7);
	let store = Arc::new(MemoryStore::new());

	let spec: LayerSpec = serde_json::from_value(serde_json::json!({
		"dataset": "aqueduct_erosion_risk",
		"version": "v201911",
		"pixel_meaning": "level",
		"source_type": "raster",
		"data_type": "uint8",
		"no_data": 0,
		"grid": "1/4000",
		"calc": "A*2+1",
		"source_uri": format!("s3://{BUCKET}/manifest.geojson")
	}))
	.unwrap();
	let layer = Arc::new(Layer::new(spec).unwrap());

	let results = Pipe::new(
		layer,
		catalog_for(&source),
		store.clone(),
		&settings(),
		Some(vec!["10N_010E".to_string()]),
		dir.path().join("work"),
		CancelFlag::new(),
	)
	.unwrap()
	.create_tiles(true)
	.await
	.unwrap();
	assert_eq!(results.counts(), (1, 0, 0));

	let bytes = store
		.read(BUCKET, "aqueduct_erosion_risk/v201911/raster/1/4000/level/10N_010E.tif")
		.await
		.unwrap();
	let out_path = dir.path().join("check.tif");
	std::fs::write(&out_path, bytes).unwrap();
	let dataset = Dataset::open(&out_path).unwrap();
	let buffer = dataset.rasterband(1).unwrap().read_band_as::<u8>().unwrap();
	// 7 * 2 + 1
	assert_eq!(buffer.data()[2000 * 4000 + 2000], 15);
	// masked source pixels become the destination nodata, not 1
	assert_eq!(buffer.data()[0], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn tile_without_source_overlap_produces_no_object() {
	let dir = TempDir::new().unwrap();
	let source = dir.path().join("source.tif");
	write_source_raster(&source, 7);
	let store = Arc::new(MemoryStore::new());

	let results = Pipe::new(
		layer("nearest"),
		catalog_for(&source),
		store.clone(),
		&settings(),
		Some(vec!["50N_050E".to_string()]),
		dir.path().join("work"),
		CancelFlag::new(),
	)
	.unwrap()
	.create_tiles(true)
	.await
	.unwrap();
	assert_eq!(results.counts(), (0, 1, 0));
	assert!(store.keys(BUCKET).is_empty());
}
