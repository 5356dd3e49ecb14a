//! Source catalog: resolves a layer's manifest into footprint/URI records
//! and answers intersection queries against tile geometries.

use crate::storage::{split_s3_uri, ObjectStore};
use anyhow::{Context, Result};
use geo::{BooleanOps, Intersects, MultiPolygon, Polygon, Relate};
use geo_types::{coord, LineString};
use rastergrid_core::{Bounds, RasterGridError};
use std::sync::OnceLock;

/// One manifest entry: the raster's footprint in EPSG:4326 and its URI.
#[derive(Debug, Clone)]
pub struct InputFile {
	pub geometry: MultiPolygon<f64>,
	pub uri: String,
}

/// The resolved input manifest of a layer.
///
/// Records keep their manifest order; the union footprint is computed once on
/// first use.
#[derive(Debug)]
pub struct SourceCatalog {
	records: Vec<InputFile>,
	footprint: OnceLock<MultiPolygon<f64>>,
}

impl SourceCatalog {
	/// Fetch and parse the manifest feature collection at `manifest_uri`.
	///
	/// Each feature must carry a polygonal geometry and a `name` property
	/// holding the raster URI. A missing object yields
	/// [`RasterGridError::ManifestNotFound`], anything unparsable
	/// [`RasterGridError::ManifestMalformed`].
	pub async fn load(manifest_uri: &str, store: &dyn ObjectStore) -> Result<SourceCatalog> {
		log::info!("loading source manifest {manifest_uri}");
		let (bucket, key) = split_s3_uri(manifest_uri)
			.map_err(|err| RasterGridError::ManifestNotFound(format!("{manifest_uri}: {err}")))?;
		let bytes = store
			.read(bucket, key)
			.await
			.with_context(|| format!("failed to fetch manifest {manifest_uri}"))?;
		let records = parse_manifest(&bytes).map_err(|err| RasterGridError::ManifestMalformed(format!("{manifest_uri}: {err}")))?;
		log::info!("manifest {manifest_uri} lists {} input files", records.len());
		Ok(SourceCatalog {
			records,
			footprint: OnceLock::new(),
		})
	}

	/// Build a catalog from records directly; used by tests.
	pub fn from_records(records: Vec<InputFile>) -> SourceCatalog {
		SourceCatalog {
			records,
			footprint: OnceLock::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	/// Geometric union of all footprints, memoized.
	pub fn footprint(&self) -> &MultiPolygon<f64> {
		self.footprint.get_or_init(|| {
			let mut union = MultiPolygon::<f64>::new(vec![]);
			for record in &self.records {
				union = union.union(&record.geometry);
			}
			union
		})
	}

	/// True when the tile geometry overlaps the union footprint by more than
	/// a shared boundary.
	pub fn intersects(&self, tile_geom: &Polygon<f64>) -> bool {
		overlaps(self.footprint(), tile_geom)
	}

	/// URIs of the inputs whose footprint overlaps the tile geometry by more
	/// than a shared boundary, in manifest order.
	pub fn intersecting(&self, tile_geom: &Polygon<f64>) -> Vec<String> {
		self
			.records
			.iter()
			.filter(|record| overlaps(&record.geometry, tile_geom))
			.map(|record| record.uri.clone())
			.collect()
	}
}

/// Intersects, but not merely touching along an edge or corner.
fn overlaps(geometry: &MultiPolygon<f64>, tile_geom: &Polygon<f64>) -> bool {
	geometry.intersects(tile_geom) && !geometry.relate(tile_geom).is_touches()
}

/// A tile extent as a closed polygon ring (NW → NE → SE → SW).
pub fn bounds_to_polygon(bounds: &Bounds) -> Polygon<f64> {
	Polygon::new(
		LineString::new(vec![
			coord! { x: bounds.west, y: bounds.north },
			coord! { x: bounds.east, y: bounds.north },
			coord! { x: bounds.east, y: bounds.south },
			coord! { x: bounds.west, y: bounds.south },
			coord! { x: bounds.west, y: bounds.north },
		]),
		vec![],
	)
}

fn parse_manifest(bytes: &[u8]) -> Result<Vec<InputFile>> {
	let text = std::str::from_utf8(bytes).context("manifest is not valid UTF-8")?;
	let geojson: geojson::GeoJson = text.parse().context("manifest is not valid GeoJSON")?;
	let collection = match geojson {
		geojson::GeoJson::FeatureCollection(fc) => fc,
		_ => anyhow::bail!("manifest must be a FeatureCollection"),
	};

	let mut records = Vec::with_capacity(collection.features.len());
	for (index, feature) in collection.features.into_iter().enumerate() {
		let geometry = feature
			.geometry
			.with_context(|| format!("feature {index} has no geometry"))?;
		let geometry: geo_types::Geometry<f64> = geometry
			.try_into()
			.with_context(|| format!("feature {index} has an unsupported geometry"))?;
		let geometry = match geometry {
			geo_types::Geometry::Polygon(polygon) => MultiPolygon::new(vec![polygon]),
			geo_types::Geometry::MultiPolygon(mp) => mp,
			other => anyhow::bail!("feature {index} must be polygonal, got {other:?}"),
		};
		let uri = feature
			.properties
			.as_ref()
			.and_then(|props| props.get("name"))
			.and_then(|value| value.as_str())
			.with_context(|| format!("feature {index} has no 'name' property"))?
			.to_string();
		records.push(InputFile { geometry, uri });
	}
	Ok(records)
}
