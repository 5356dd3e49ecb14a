//! Tiling schemes. A [`Grid`] fixes the CRS, pixel size, tile size and block
//! size of every output tile, and maps tile ids to world coordinates and
//! back.

mod lat_lng;
mod web_mercator;

pub use lat_lng::LatLngGrid;
pub use web_mercator::WebMercatorGrid;

use crate::error::RasterGridError;
use crate::types::{Bounds, Compression, Crs, DataType, DestinationProfile, GeoTransform, TileId};
use anyhow::{Context, Result};

/// Geographic grid ids with a fixed entry in the registry. Web-mercator grids
/// are addressed as `zoom_0` .. `zoom_22`.
pub const KNOWN_GRIDS: [&str; 6] = ["1/4000", "3/33600", "10/40000", "8/32000", "90/27008", "90/9984"];

/// One of the supported tiling schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grid {
	LatLng(LatLngGrid),
	WebMercator(WebMercatorGrid),
}

/// Look up a grid by its registry id, e.g. `1/4000` or `zoom_14`.
pub fn grid_factory(grid_name: &str) -> Result<Grid> {
	if let Some(zoom) = grid_name.strip_prefix("zoom_") {
		let zoom: u8 = zoom.parse().with_context(|| format!("unknown grid name: {grid_name}"))?;
		return Ok(Grid::WebMercator(WebMercatorGrid::new(zoom)?));
	}
	let grid = match grid_name {
		"1/4000" => LatLngGrid::new(1, 4000),
		"3/33600" => LatLngGrid::new(3, 33600),
		"10/40000" => LatLngGrid::new(10, 40000),
		"8/32000" => LatLngGrid::new(8, 32000),
		"90/27008" => LatLngGrid::new(90, 27008),
		"90/9984" => LatLngGrid::new(90, 9984),
		_ => {
			return Err(RasterGridError::Validation(format!("unknown grid name: {grid_name}")).into());
		}
	}?;
	Ok(Grid::LatLng(grid))
}

impl Grid {
	pub fn name(&self) -> String {
		match self {
			Grid::LatLng(g) => g.name(),
			Grid::WebMercator(g) => g.name(),
		}
	}

	pub fn crs(&self) -> Crs {
		match self {
			Grid::LatLng(_) => Crs::Epsg4326,
			Grid::WebMercator(_) => Crs::Epsg3857,
		}
	}

	pub fn x_res(&self) -> f64 {
		match self {
			Grid::LatLng(g) => g.x_res(),
			Grid::WebMercator(g) => g.x_res(),
		}
	}

	pub fn y_res(&self) -> f64 {
		match self {
			Grid::LatLng(g) => g.y_res(),
			Grid::WebMercator(g) => g.y_res(),
		}
	}

	pub fn tile_width(&self) -> u64 {
		match self {
			Grid::LatLng(g) => g.tile_width(),
			Grid::WebMercator(g) => g.tile_width(),
		}
	}

	pub fn tile_height(&self) -> u64 {
		match self {
			Grid::LatLng(g) => g.tile_height(),
			Grid::WebMercator(g) => g.tile_height(),
		}
	}

	pub fn block_shape(&self) -> (u64, u64) {
		match self {
			Grid::LatLng(g) => g.block_shape(),
			Grid::WebMercator(g) => g.block_shape(),
		}
	}

	/// Snap a `(y, x)` point onto the pixel grid, toward the north-west.
	/// Idempotent.
	pub fn snap(&self, y: f64, x: f64) -> (f64, f64) {
		match self {
			Grid::LatLng(g) => g.snap(y, x),
			Grid::WebMercator(g) => g.snap(y, x),
		}
	}

	/// Tile id of the cell containing the point, or
	/// [`RasterGridError::InvalidCoordinate`] outside the grid's domain.
	pub fn tile_id_of(&self, y: f64, x: f64) -> Result<TileId> {
		match self {
			Grid::LatLng(g) => g.tile_id_of(y, x),
			Grid::WebMercator(g) => g.tile_id_of(y, x),
		}
	}

	/// North-west corner `(x, y)` of a tile in grid CRS units.
	pub fn origin_of(&self, tile_id: &TileId) -> Result<(f64, f64)> {
		match self {
			Grid::LatLng(g) => g.origin_of(tile_id),
			Grid::WebMercator(g) => g.origin_of(tile_id),
		}
	}

	pub fn tile_bounds(&self, tile_id: &TileId) -> Result<Bounds> {
		match self {
			Grid::LatLng(g) => g.tile_bounds(tile_id),
			Grid::WebMercator(g) => g.tile_bounds(tile_id),
		}
	}

	/// Every tile id of the grid, in a deterministic total order.
	pub fn tile_ids(&self) -> Vec<TileId> {
		match self {
			Grid::LatLng(g) => g.tile_ids(),
			Grid::WebMercator(g) => g.tile_ids(),
		}
	}

	/// Tile ids of the cells overlapping a geographic extent, as a cheap
	/// candidate pre-selection for seeding.
	pub fn tile_ids_in_geographic_bounds(&self, bounds: &Bounds) -> Vec<TileId> {
		match self {
			Grid::LatLng(g) => g.tile_ids_in_bounds(bounds),
			Grid::WebMercator(g) => g.tile_ids_in_bounds(&WebMercatorGrid::from_geographic(bounds)),
		}
	}

	/// Tile extent in geographic (EPSG:4326) degrees, for comparison with
	/// manifest footprints.
	pub fn tile_geographic_bounds(&self, tile_id: &TileId) -> Result<Bounds> {
		let bounds = self.tile_bounds(tile_id)?;
		Ok(match self {
			Grid::LatLng(_) => bounds,
			Grid::WebMercator(_) => WebMercatorGrid::to_geographic(&bounds),
		})
	}

	/// Full world extent of the grid's CRS, used to clamp reprojected source
	/// bounds.
	pub fn world_bounds(&self) -> Bounds {
		match self {
			Grid::LatLng(_) => Bounds {
				west: -180.0,
				south: -90.0,
				east: 180.0,
				north: 90.0,
			},
			Grid::WebMercator(_) => {
				let edge = std::f64::consts::PI * 6_378_137.0;
				Bounds {
					west: -edge,
					south: -edge,
					east: edge,
					north: edge,
				}
			}
		}
	}

	/// The output profile of one tile: grid-sized, origin at the cell's
	/// north-west corner.
	pub fn destination_profile(
		&self,
		tile_id: &TileId,
		dtype: DataType,
		nodata: Option<f64>,
		compression: Compression,
		nbits: Option<u8>,
	) -> Result<DestinationProfile> {
		let (west, north) = self.origin_of(tile_id)?;
		let (block_x_size, block_y_size) = self.block_shape();
		Ok(DestinationProfile {
			crs: self.crs(),
			transform: GeoTransform::from_origin(west, north, self.x_res(), self.y_res()),
			width: self.tile_width(),
			height: self.tile_height(),
			dtype,
			nodata,
			block_x_size,
			block_y_size,
			compression,
			nbits,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_factory_known_grids() {
		for name in KNOWN_GRIDS {
			let grid = grid_factory(name).unwrap();
			assert_eq!(grid.name(), name);
			assert_eq!(grid.crs(), Crs::Epsg4326);
		}
	}

	#[test]
	fn test_factory_zoom_grids() {
		let grid = grid_factory("zoom_14").unwrap();
		assert_eq!(grid.name(), "zoom_14");
		assert_eq!(grid.crs(), Crs::Epsg3857);
	}

	#[test]
	fn test_factory_unknown() {
		assert!(grid_factory("2/1000").is_err());
		assert!(grid_factory("zoom_x").is_err());
	}

	#[test]
	fn test_grid_round_trip_property() {
		// tile_id_of(origin_of(t)) == t for every enumerated tile id
		for name in ["90/9984", "zoom_10"] {
			let grid = grid_factory(name).unwrap();
			for tile_id in grid.tile_ids() {
				let (x, y) = grid.origin_of(&tile_id).unwrap();
				assert_eq!(grid.tile_id_of(y, x).unwrap(), tile_id, "grid {name}");
			}
		}
	}

	#[test]
	fn test_tile_ids_in_geographic_bounds() {
		let grid = grid_factory("1/4000").unwrap();
		let ids = grid.tile_ids_in_geographic_bounds(&Bounds::new(9.9, 9.1, 11.2, 10.4).unwrap());
		// columns 9..12, rows 10..11 of one-degree cells
		assert_eq!(ids.len(), 6);
		assert!(ids.contains(&TileId::from("10N_010E")));
		assert!(ids.contains(&TileId::from("11N_011E")));

		let zoom = grid_factory("zoom_14").unwrap();
		let ids = zoom.tile_ids_in_geographic_bounds(&Bounds::new(-1.0, -1.0, 1.0, 1.0).unwrap());
		assert!(ids.contains(&TileId::from("031R_031C")));
		assert!(ids.len() <= 4);
	}

	#[test]
	fn test_destination_profile_shape() {
		let grid = grid_factory("1/4000").unwrap();
		let profile = grid
			.destination_profile(&TileId::from("10N_010E"), DataType::Uint8, Some(0.0), Compression::Lzw, None)
			.unwrap();
		assert_eq!(profile.width, 4000);
		assert_eq!(profile.height, 4000);
		assert_eq!(profile.transform.as_tuple(), (0.00025, 0.0, 10.0, 0.0, -0.00025, 10.0));
		assert_eq!(profile.bounds().as_tuple(), (10.0, 9.0, 11.0, 10.0));
	}
}
