//! Super-window planning: cut the destination block grid into memory-sized
//! read/process/write units.

use rastergrid_core::{Bounds, DestinationProfile, GlobalResourceState, Grid, Window};

/// Maximum number of destination blocks a super-window may span, derived
/// from the per-super-window memory budget. Always a perfect square so
/// super-windows tile the block grid cleanly.
pub fn max_blocks(profile: &DestinationProfile, resources: &GlobalResourceState, has_calc: bool) -> u64 {
	let bytes_per_block = profile.block_byte_size();
	let memory = resources.memory_per_super_window(has_calc);
	let per_side = ((memory as f64 / bytes_per_block as f64).sqrt().floor() as u64).max(1);
	per_side * per_side
}

/// Blocks per super-window side: `sqrt(max_blocks)`.
pub fn block_count(profile: &DestinationProfile, resources: &GlobalResourceState, has_calc: bool) -> u64 {
	(max_blocks(profile, resources, has_calc) as f64).sqrt() as u64
}

/// Source extent snapped onto the grid at both the NW and the SE corner,
/// the way every destination transform is derived.
pub fn snap_bounds(grid: &Grid, bounds: &Bounds) -> Bounds {
	let (north, west) = grid.snap(bounds.north, bounds.west);
	let (south, east) = grid.snap(bounds.south, bounds.east);
	Bounds { west, south, east, north }
}

/// Pixel-space projection of the (snapped) source bounds clipped to the
/// tile, rounded outward to whole pixels. `None` when the source does not
/// reach into the tile.
pub fn intersecting_window(profile: &DestinationProfile, src_bounds: &Bounds) -> Option<Window> {
	let clipped = profile.bounds().intersected(src_bounds);
	if clipped.is_empty() {
		return None;
	}
	let (col_off, row_off, width, height) = profile.transform.window_from_bounds(&clipped);
	let window = Window::snapped(col_off, row_off, width, height).ok()?;
	window.intersection(&Window::new(0, 0, profile.width, profile.height))
}

/// Row-major super-windows of `block_count x block_count` blocks, each
/// clipped to the intersecting window. Empty intersections are dropped.
pub fn plan(profile: &DestinationProfile, intersecting: &Window, block_count: u64) -> Vec<Window> {
	let block_count = block_count.max(1);
	let x_blocks = profile.width.div_ceil(profile.block_x_size);
	let y_blocks = profile.height.div_ceil(profile.block_y_size);

	let mut windows = Vec::new();
	let mut block_row = 0;
	while block_row < y_blocks {
		let rows = (y_blocks - block_row).min(block_count);
		let mut block_col = 0;
		while block_col < x_blocks {
			let cols = (x_blocks - block_col).min(block_count);
			let super_window = Window::new(
				(block_col * profile.block_x_size) as i64,
				(block_row * profile.block_y_size) as i64,
				(cols * profile.block_x_size).min(profile.width - block_col * profile.block_x_size),
				(rows * profile.block_y_size).min(profile.height - block_row * profile.block_y_size),
			);
			if let Some(window) = super_window.intersection(intersecting) {
				windows.push(window);
			}
			block_col += block_count;
		}
		block_row += block_count;
	}
	windows
}

#[cfg(test)]
mod tests {
	use super::*;
	use rastergrid_core::{grid_factory, Compression, DataType, EnvSettings, Environment, TileId};

	fn profile() -> DestinationProfile {
		grid_factory("1/4000")
			.unwrap()
			.destination_profile(&TileId::from("10N_010E"), DataType::Uint8, Some(0.0), Compression::Lzw, None)
			.unwrap()
	}

	fn resources(cores: usize, max_mem: u64) -> GlobalResourceState {
		GlobalResourceState::new(
			&EnvSettings {
				environment: Environment::Test,
				aws_region: "us-east-1".to_string(),
				endpoint_url: None,
				cores,
				max_mem,
			},
			false,
		)
	}

	#[test]
	fn test_max_blocks_is_perfect_square() {
		// 3 cores -> 2 workers, divisor 8; 1 GiB -> 64 MiB per super-window;
		// 160000 bytes per block -> sqrt(419.4) -> 20^2
		let resources = resources(3, 1 << 30);
		let blocks = max_blocks(&profile(), &resources, false);
		assert_eq!(blocks, 400);
		assert_eq!(block_count(&profile(), &resources, false), 20);
	}

	#[test]
	fn test_max_blocks_never_zero() {
		let resources = resources(3, 1024);
		assert_eq!(max_blocks(&profile(), &resources, false), 1);
	}

	#[test]
	fn test_intersecting_window_full_coverage() {
		let profile = profile();
		let src = Bounds::new(0.0, 0.0, 20.0, 20.0).unwrap();
		let window = intersecting_window(&profile, &src).unwrap();
		assert_eq!(window, Window::new(0, 0, 4000, 4000));
	}

	#[test]
	fn test_intersecting_window_partial() {
		let profile = profile();
		// eastern half of the 10..11 / 9..10 tile
		let src = Bounds::new(10.5, 9.0, 12.0, 10.0).unwrap();
		let window = intersecting_window(&profile, &src).unwrap();
		assert_eq!(window, Window::new(2000, 0, 2000, 4000));
	}

	#[test]
	fn test_intersecting_window_disjoint() {
		let profile = profile();
		let src = Bounds::new(50.0, 50.0, 51.0, 51.0).unwrap();
		assert_eq!(intersecting_window(&profile, &src), None);
	}

	#[test]
	fn test_plan_covers_intersection_in_row_major_order() {
		let profile = profile();
		let intersecting = Window::new(0, 0, 4000, 4000);
		// 10 blocks per side, super-windows of 4x4 blocks
		let windows = plan(&profile, &intersecting, 4);
		assert_eq!(windows.len(), 9);
		assert_eq!(windows[0], Window::new(0, 0, 1600, 1600));
		assert_eq!(windows[1], Window::new(1600, 0, 1600, 1600));
		assert_eq!(windows[2], Window::new(3200, 0, 800, 1600));
		assert_eq!(windows[8], Window::new(3200, 3200, 800, 800));

		// full coverage, no overlap
		let total: u64 = windows.iter().map(|w| w.size()).sum();
		assert_eq!(total, 4000 * 4000);
	}

	#[test]
	fn test_plan_drops_empty_intersections() {
		let profile = profile();
		// only the north-west 100x100 pixels have source data
		let intersecting = Window::new(0, 0, 100, 100);
		let windows = plan(&profile, &intersecting, 4);
		assert_eq!(windows, vec![Window::new(0, 0, 100, 100)]);
	}

	#[test]
	fn test_snapped_source_extent_to_pixel_window() {
		// a 0.1 x 0.1 degree source extent at 0.00025 degree pixels maps to
		// an exact 400x400 pixel window with its origin at the NW corner
		let grid = grid_factory("1/4000").unwrap();
		let snapped = snap_bounds(&grid, &Bounds::new(9.1, 9.1, 9.2, 9.2).unwrap());
		let transform = rastergrid_core::GeoTransform::from_origin(snapped.west, snapped.north, grid.x_res(), grid.y_res());
		let (a, b, c, d, e, f) = transform.as_tuple();
		approx::assert_abs_diff_eq!(a, 0.00025, epsilon = 1e-12);
		assert_eq!(b, 0.0);
		approx::assert_abs_diff_eq!(c, 9.1, epsilon = 1e-9);
		assert_eq!(d, 0.0);
		approx::assert_abs_diff_eq!(e, -0.00025, epsilon = 1e-12);
		approx::assert_abs_diff_eq!(f, 9.2, epsilon = 1e-9);
		let width = (snapped.width() / grid.x_res()).round() as u64;
		let height = (snapped.height() / grid.y_res()).round() as u64;
		assert_eq!((width, height), (400, 400));
	}

	#[test]
	fn test_snap_bounds_is_idempotent() {
		let grid = grid_factory("1/4000").unwrap();
		let bounds = Bounds::new(10.00011, 9.00011, 10.99989, 9.99989).unwrap();
		let snapped = snap_bounds(&grid, &bounds);
		assert_eq!(snap_bounds(&grid, &snapped), snapped);
		// west floored, north ceiled onto the 0.00025 grid
		assert!((snapped.west - 10.0).abs() < 1e-9 || snapped.west <= bounds.west);
	}
}
