use crate::error::RasterGridError;
use crate::types::{Bounds, TileId};
use anyhow::{ensure, Result};

/// Web-mercator world circumference in meters (2πR, R = 6,378,137 m).
const EARTH_CIRCUMFERENCE: f64 = 2.0 * std::f64::consts::PI * 6_378_137.0;

/// Half the mercator world extent; the world spans ±`WORLD_EDGE` meters.
const WORLD_EDGE: f64 = EARTH_CIRCUMFERENCE / 2.0;

/// Output tiles never exceed this many pixels per side; at high zooms the
/// world is cut into several tiles of exactly this size.
const MAX_TILE_PIXELS: u64 = 65_536;

const SNAP_EPSILON: f64 = 1e-9;

/// Web-mercator (EPSG:3857) tiling scheme derived from a zoom level.
///
/// The pixel size is the standard `2πR / (256 · 2^zoom)`. Tile ids encode the
/// row/column of the cell counted from the north-west corner of the world,
/// e.g. `030R_034C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebMercatorGrid {
	zoom: u8,
}

impl WebMercatorGrid {
	pub fn new(zoom: u8) -> Result<WebMercatorGrid> {
		ensure!(zoom <= 22, "zoom ({zoom}) must be <= 22");
		Ok(WebMercatorGrid { zoom })
	}

	pub fn name(&self) -> String {
		format!("zoom_{}", self.zoom)
	}

	/// Meters per pixel.
	pub fn x_res(&self) -> f64 {
		EARTH_CIRCUMFERENCE / (256.0 * 2f64.powi(self.zoom as i32))
	}

	pub fn y_res(&self) -> f64 {
		self.x_res()
	}

	/// World width in pixels at this zoom.
	fn world_pixels(&self) -> u64 {
		256u64 << self.zoom
	}

	/// Output tile edge length in pixels.
	pub fn tile_width(&self) -> u64 {
		self.world_pixels().min(MAX_TILE_PIXELS)
	}

	pub fn tile_height(&self) -> u64 {
		self.tile_width()
	}

	pub fn block_shape(&self) -> (u64, u64) {
		(256, 256)
	}

	/// Number of tiles per world side.
	pub fn tiles_per_side(&self) -> u64 {
		self.world_pixels() / self.tile_width()
	}

	/// World size of one tile in meters.
	fn tile_span(&self) -> f64 {
		self.tile_width() as f64 * self.x_res()
	}

	/// Snap toward the north-west pixel boundary: `y` is ceiled, `x` floored
	/// onto the pixel grid (both in meters).
	pub fn snap(&self, y: f64, x: f64) -> (f64, f64) {
		let res = self.x_res();
		let y = (y / res - SNAP_EPSILON).ceil() * res;
		let x = (x / res + SNAP_EPSILON).floor() * res;
		(y, x)
	}

	pub fn tile_id_of(&self, y: f64, x: f64) -> Result<TileId> {
		ensure!(
			x.abs() <= WORLD_EDGE && y.abs() <= WORLD_EDGE,
			RasterGridError::InvalidCoordinate(format!("point ({x}, {y}) is outside the mercator domain"))
		);
		let span = self.tile_span();
		let last = self.tiles_per_side() as i64 - 1;
		// a touch of slack so exact tile corners land in their own cell
		let col = ((((x + WORLD_EDGE) / span) + SNAP_EPSILON).floor() as i64).clamp(0, last);
		let row = ((((WORLD_EDGE - y) / span) + SNAP_EPSILON).floor() as i64).clamp(0, last);
		Ok(self.format_id(row as u64, col as u64))
	}

	fn format_id(&self, row: u64, col: u64) -> TileId {
		TileId::new(format!("{row:03}R_{col:03}C"))
	}

	/// North-west corner `(x, y)` of the tile, in meters.
	pub fn origin_of(&self, tile_id: &TileId) -> Result<(f64, f64)> {
		let (row, col) = self.parse_id(tile_id)?;
		let span = self.tile_span();
		Ok((-WORLD_EDGE + col as f64 * span, WORLD_EDGE - row as f64 * span))
	}

	fn parse_id(&self, tile_id: &TileId) -> Result<(u64, u64)> {
		let id = tile_id.as_str();
		let invalid = || RasterGridError::InvalidCoordinate(format!("malformed tile id: {id}"));
		let (row_part, col_part) = id.split_once('_').ok_or_else(invalid)?;
		let row: u64 = row_part.strip_suffix('R').ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
		let col: u64 = col_part.strip_suffix('C').ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
		ensure!(
			row < self.tiles_per_side() && col < self.tiles_per_side(),
			RasterGridError::InvalidCoordinate(format!(
				"tile id {id} is outside grid {} ({} tiles per side)",
				self.name(),
				self.tiles_per_side()
			))
		);
		Ok((row, col))
	}

	pub fn tile_bounds(&self, tile_id: &TileId) -> Result<Bounds> {
		let (west, north) = self.origin_of(tile_id)?;
		let span = self.tile_span();
		Bounds::new(west, north - span, west + span, north)
	}

	pub fn tile_ids(&self) -> Vec<TileId> {
		let side = self.tiles_per_side();
		let mut ids = Vec::with_capacity((side * side) as usize);
		for row in 0..side {
			for col in 0..side {
				ids.push(self.format_id(row, col));
			}
		}
		ids
	}

	/// Tile ids of the cells overlapping `bounds` (mercator meters), in
	/// row-major order. A cheap bounding-box pre-selection; precise
	/// footprint intersection happens downstream.
	pub fn tile_ids_in_bounds(&self, bounds: &Bounds) -> Vec<TileId> {
		let span = self.tile_span();
		let last = self.tiles_per_side() as i64 - 1;
		let clamp = |value: f64| (value.floor() as i64).clamp(0, last) as u64;
		let col_min = clamp((bounds.west + WORLD_EDGE) / span);
		let col_max = clamp((bounds.east + WORLD_EDGE) / span);
		let row_min = clamp((WORLD_EDGE - bounds.north) / span);
		let row_max = clamp((WORLD_EDGE - bounds.south) / span);
		let mut ids = Vec::new();
		for row in row_min..=row_max {
			for col in col_min..=col_max {
				ids.push(self.format_id(row, col));
			}
		}
		ids
	}

	/// Convert a geographic (EPSG:4326) extent to mercator meters, clamping
	/// latitudes to the projection's valid domain.
	pub fn from_geographic(bounds: &Bounds) -> Bounds {
		const RADIUS: f64 = 6_378_137.0;
		const MAX_LAT: f64 = 85.051_128_779_806_59;
		let x = |lng: f64| RADIUS * lng.clamp(-180.0, 180.0).to_radians();
		let y = |lat: f64| {
			let phi = lat.clamp(-MAX_LAT, MAX_LAT).to_radians();
			RADIUS * (std::f64::consts::FRAC_PI_4 + phi / 2.0).tan().ln()
		};
		Bounds {
			west: x(bounds.west),
			south: y(bounds.south),
			east: x(bounds.east),
			north: y(bounds.north),
		}
	}

	/// Convert a mercator extent to geographic (EPSG:4326) degrees.
	pub fn to_geographic(bounds: &Bounds) -> Bounds {
		const RADIUS: f64 = 6_378_137.0;
		let lng = |x: f64| (x / RADIUS).to_degrees();
		let lat = |y: f64| ((y / RADIUS).exp().atan() * 2.0 - std::f64::consts::FRAC_PI_2).to_degrees();
		Bounds {
			west: lng(bounds.west),
			south: lat(bounds.south),
			east: lng(bounds.east),
			north: lat(bounds.north),
		}
	}
}
