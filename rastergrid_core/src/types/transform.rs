use crate::types::{Bounds, Window};
use std::fmt::{self, Debug};

/// North-up affine transform mapping pixel space to world space.
///
/// The six coefficients follow the conventional `(a, b, c, d, e, f)` layout:
/// `x = a * col + b * row + c`, `y = d * col + e * row + f`. Only axis-aligned
/// transforms are supported (`b = d = 0`, `e < 0` for north-up rasters).
///
/// # Examples
/// ```
/// use rastergrid_core::GeoTransform;
///
/// let transform = GeoTransform::from_origin(9.1, 9.2, 0.00025, 0.00025);
/// assert_eq!(transform.as_tuple(), (0.00025, 0.0, 9.1, 0.0, -0.00025, 9.2));
/// ```
#[derive(Clone, Copy, PartialEq)]
pub struct GeoTransform {
	pub x_res: f64,
	pub y_res: f64,
	pub west: f64,
	pub north: f64,
}

impl GeoTransform {
	/// Build a transform from the raster's north-west corner and pixel size.
	/// `y_res` is given positive; rows run southward.
	pub fn from_origin(west: f64, north: f64, x_res: f64, y_res: f64) -> GeoTransform {
		GeoTransform { x_res, y_res, west, north }
	}

	/// Coefficients in `(a, b, c, d, e, f)` order.
	pub fn as_tuple(&self) -> (f64, f64, f64, f64, f64, f64) {
		(self.x_res, 0.0, self.west, 0.0, -self.y_res, self.north)
	}

	/// Coefficients in GDAL order:
	/// `[origin_x, pixel_width, 0, origin_y, 0, -pixel_height]`.
	pub fn to_gdal(&self) -> [f64; 6] {
		[self.west, self.x_res, 0.0, self.north, 0.0, -self.y_res]
	}

	/// World extent covered by `window` under this transform.
	pub fn window_bounds(&self, window: &Window) -> Bounds {
		let west = self.west + window.col_off as f64 * self.x_res;
		let north = self.north - window.row_off as f64 * self.y_res;
		Bounds {
			west,
			south: north - window.height as f64 * self.y_res,
			east: west + window.width as f64 * self.x_res,
			north,
		}
	}

	/// Transform of the sub-raster that starts at `window`'s offset.
	#[must_use]
	pub fn window_transform(&self, window: &Window) -> GeoTransform {
		GeoTransform {
			x_res: self.x_res,
			y_res: self.y_res,
			west: self.west + window.col_off as f64 * self.x_res,
			north: self.north - window.row_off as f64 * self.y_res,
		}
	}

	/// Fractional pixel window covering `bounds` under this transform, as
	/// `(col_off, row_off, width, height)`. Snap with
	/// [`Window::snapped`](crate::Window::snapped) before using it for reads.
	pub fn window_from_bounds(&self, bounds: &Bounds) -> (f64, f64, f64, f64) {
		let col_off = (bounds.west - self.west) / self.x_res;
		let row_off = (self.north - bounds.north) / self.y_res;
		let width = bounds.width() / self.x_res;
		let height = bounds.height() / self.y_res;
		(col_off, row_off, width, height)
	}
}

impl Debug for GeoTransform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let (a, b, c, d, e, ff) = self.as_tuple();
		write!(f, "GeoTransform({a}, {b}, {c}, {d}, {e}, {ff})")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;

	#[test]
	fn test_from_origin() {
		let t = GeoTransform::from_origin(9.1, 9.2, 0.00025, 0.00025);
		assert_eq!(t.as_tuple(), (0.00025, 0.0, 9.1, 0.0, -0.00025, 9.2));
		assert_eq!(t.to_gdal(), [9.1, 0.00025, 0.0, 9.2, 0.0, -0.00025]);
	}

	#[test]
	fn test_window_bounds_round_trip() {
		let t = GeoTransform::from_origin(10.0, 10.0, 0.25, 0.25);
		let window = Window::new(4, 8, 16, 12);
		let bounds = t.window_bounds(&window);
		assert_abs_diff_eq!(bounds.west, 11.0);
		assert_abs_diff_eq!(bounds.north, 8.0);
		assert_abs_diff_eq!(bounds.east, 15.0);
		assert_abs_diff_eq!(bounds.south, 5.0);

		let (col_off, row_off, width, height) = t.window_from_bounds(&bounds);
		assert_abs_diff_eq!(col_off, 4.0);
		assert_abs_diff_eq!(row_off, 8.0);
		assert_abs_diff_eq!(width, 16.0);
		assert_abs_diff_eq!(height, 12.0);
	}

	#[test]
	fn test_window_transform() {
		let t = GeoTransform::from_origin(10.0, 10.0, 0.5, 0.5);
		let sub = t.window_transform(&Window::new(2, 4, 8, 8));
		assert_abs_diff_eq!(sub.west, 11.0);
		assert_abs_diff_eq!(sub.north, 8.0);
		assert_eq!(sub.x_res, 0.5);
	}
}
