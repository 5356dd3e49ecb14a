use crate::error::RasterGridError;
use crate::types::{Bounds, TileId};
use anyhow::{ensure, Result};

/// Floating point slack when snapping coordinates onto pixel boundaries, so
/// that values which are a grid multiple up to rounding noise stay put.
const SNAP_EPSILON: f64 = 1e-9;

/// Geographic (EPSG:4326) tiling scheme: square tiles of `step` degrees with
/// `pixels` pixels per side.
///
/// Tile ids encode the north-west corner of the cell, e.g. `10N_010E` for the
/// cell spanning 9°N..10°N and 10°E..11°E.
///
/// # Examples
/// ```
/// use rastergrid_core::LatLngGrid;
///
/// let grid = LatLngGrid::new(1, 4000).unwrap();
/// assert_eq!(grid.x_res(), 0.00025);
/// assert_eq!(grid.tile_id_of(10.5, 9.5).unwrap().as_str(), "10N_010E");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatLngGrid {
	step: u32,
	pixels: u32,
}

impl LatLngGrid {
	pub fn new(step: u32, pixels: u32) -> Result<LatLngGrid> {
		ensure!(step > 0 && step <= 180, "grid step ({step}) must be in 1..=180 degrees");
		ensure!(pixels > 0, "pixels per step must be > 0");
		Ok(LatLngGrid { step, pixels })
	}

	pub fn name(&self) -> String {
		format!("{}/{}", self.step, self.pixels)
	}

	pub fn x_res(&self) -> f64 {
		self.step as f64 / self.pixels as f64
	}

	pub fn y_res(&self) -> f64 {
		self.x_res()
	}

	pub fn tile_width(&self) -> u64 {
		self.pixels as u64
	}

	pub fn tile_height(&self) -> u64 {
		self.pixels as u64
	}

	pub fn block_shape(&self) -> (u64, u64) {
		(400, 400)
	}

	/// Highest tile north edge representable by this grid. 90 for steps that
	/// divide 90 evenly, otherwise the largest multiple of `step` below it.
	fn max_north(&self) -> i32 {
		(90 / self.step as i32) * self.step as i32
	}

	/// Snap toward the north-west: latitude is ceiled, longitude floored onto
	/// the pixel grid.
	pub fn snap(&self, lat: f64, lng: f64) -> (f64, f64) {
		let y_res = self.y_res();
		let x_res = self.x_res();
		let lat = (lat / y_res - SNAP_EPSILON).ceil() * y_res;
		let lng = (lng / x_res + SNAP_EPSILON).floor() * x_res;
		(lat, lng)
	}

	/// Tile id of the grid cell containing the point `(lng, lat)`.
	pub fn tile_id_of(&self, lat: f64, lng: f64) -> Result<TileId> {
		ensure!(
			(-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng),
			RasterGridError::InvalidCoordinate(format!("point ({lng}, {lat}) is outside the geographic domain"))
		);
		let step = self.step as f64;
		let mut north = (lat / step).ceil() as i32 * self.step as i32;
		let mut west = (lng / step).floor() as i32 * self.step as i32;
		// points on the southern / eastern world edge belong to the last cell
		if north == -self.max_north() {
			north += self.step as i32;
		}
		if west == 180 {
			west -= self.step as i32;
		}
		ensure!(
			north <= self.max_north() && north > -self.max_north(),
			RasterGridError::InvalidCoordinate(format!("latitude {lat} is outside grid {}", self.name()))
		);
		Ok(self.format_id(north, west))
	}

	fn format_id(&self, north: i32, west: i32) -> TileId {
		let ns = if north >= 0 { 'N' } else { 'S' };
		let ew = if west >= 0 { 'E' } else { 'W' };
		TileId::new(format!("{:02}{}_{:03}{}", north.abs(), ns, west.abs(), ew))
	}

	/// North-west corner `(west, north)` of the tile, in degrees.
	pub fn origin_of(&self, tile_id: &TileId) -> Result<(f64, f64)> {
		let (north, west) = self.parse_id(tile_id)?;
		Ok((west as f64, north as f64))
	}

	fn parse_id(&self, tile_id: &TileId) -> Result<(i32, i32)> {
		let id = tile_id.as_str();
		let invalid = || RasterGridError::InvalidCoordinate(format!("malformed tile id: {id}"));
		ensure!(id.is_ascii(), invalid());
		let (lat_part, lng_part) = id.split_once('_').ok_or_else(invalid)?;
		ensure!(lat_part.len() == 3 && lng_part.len() == 4, invalid());

		let lat_value: i32 = lat_part[..2].parse().map_err(|_| invalid())?;
		let north = match &lat_part[2..] {
			"N" => lat_value,
			"S" => -lat_value,
			_ => return Err(invalid().into()),
		};
		let lng_value: i32 = lng_part[..3].parse().map_err(|_| invalid())?;
		let west = match &lng_part[3..] {
			"E" => lng_value,
			"W" => -lng_value,
			_ => return Err(invalid().into()),
		};
		Ok((north, west))
	}

	pub fn tile_bounds(&self, tile_id: &TileId) -> Result<Bounds> {
		let (west, north) = self.origin_of(tile_id)?;
		let step = self.step as f64;
		Bounds::new(west, north - step, west + step, north)
	}

	/// All tile ids of the grid in row-major order (north to south, west to
	/// east).
	pub fn tile_ids(&self) -> Vec<TileId> {
		self.ids_in_range(self.max_north(), -self.max_north(), -180, 180)
	}

	/// Tile ids of the cells overlapping `bounds` (degrees), in the same
	/// row-major order. A cheap bounding-box pre-selection; precise
	/// footprint intersection happens downstream.
	pub fn tile_ids_in_bounds(&self, bounds: &Bounds) -> Vec<TileId> {
		let step = self.step as f64;
		let max_north = self.max_north();
		let top = ((bounds.north / step).ceil() as i32 * self.step as i32).min(max_north);
		let bottom = ((bounds.south / step).floor() as i32 * self.step as i32).max(-max_north);
		let left = ((bounds.west / step).floor() as i32 * self.step as i32).max(-180);
		let right = ((bounds.east / step).ceil() as i32 * self.step as i32).min(180);
		self.ids_in_range(top, bottom, left, right)
	}

	fn ids_in_range(&self, top: i32, bottom: i32, left: i32, right: i32) -> Vec<TileId> {
		let step = self.step as i32;
		let mut ids = Vec::new();
		let mut north = top;
		while north > bottom {
			let mut west = left;
			while west < right {
				ids.push(self.format_id(north, west));
				west += step;
			}
			north -= step;
		}
		ids
	}
}
