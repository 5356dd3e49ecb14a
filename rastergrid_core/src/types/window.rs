use anyhow::{ensure, Result};
use std::fmt::{self, Debug};

/// A rectangular pixel region of a raster: column/row offset plus width and
/// height. Offsets may be negative for windows that start left of / above the
/// raster; width and height are always positive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
	pub col_off: i64,
	pub row_off: i64,
	pub width: u64,
	pub height: u64,
}

impl Window {
	pub fn new(col_off: i64, row_off: i64, width: u64, height: u64) -> Window {
		Window {
			col_off,
			row_off,
			width,
			height,
		}
	}

	/// Snap a fractional window outward to whole pixels: offsets are floored,
	/// the far edges are ceiled.
	pub fn snapped(col_off: f64, row_off: f64, width: f64, height: f64) -> Result<Window> {
		ensure!(width > 0.0 && height > 0.0, "cannot snap an empty window ({width}x{height})");
		let left = col_off.floor();
		let top = row_off.floor();
		let right = (col_off + width).ceil();
		let bottom = (row_off + height).ceil();
		Ok(Window {
			col_off: left as i64,
			row_off: top as i64,
			width: (right - left) as u64,
			height: (bottom - top) as u64,
		})
	}

	pub fn col_end(&self) -> i64 {
		self.col_off + self.width as i64
	}

	pub fn row_end(&self) -> i64 {
		self.row_off + self.height as i64
	}

	/// Number of pixels covered.
	pub fn size(&self) -> u64 {
		self.width * self.height
	}

	/// Overlap of two windows, or `None` when they do not overlap. Windows
	/// that merely share an edge do not overlap.
	pub fn intersection(&self, other: &Window) -> Option<Window> {
		let left = self.col_off.max(other.col_off);
		let top = self.row_off.max(other.row_off);
		let right = self.col_end().min(other.col_end());
		let bottom = self.row_end().min(other.row_end());
		if left >= right || top >= bottom {
			return None;
		}
		Some(Window {
			col_off: left,
			row_off: top,
			width: (right - left) as u64,
			height: (bottom - top) as u64,
		})
	}

	/// Smallest window covering both.
	#[must_use]
	pub fn union(&self, other: &Window) -> Window {
		let left = self.col_off.min(other.col_off);
		let top = self.row_off.min(other.row_off);
		let right = self.col_end().max(other.col_end());
		let bottom = self.row_end().max(other.row_end());
		Window {
			col_off: left,
			row_off: top,
			width: (right - left) as u64,
			height: (bottom - top) as u64,
		}
	}
}

impl Debug for Window {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"Window(col_off={}, row_off={}, width={}, height={})",
			self.col_off, self.row_off, self.width, self.height
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_snapped_rounds_outward() {
		let window = Window::snapped(3.2, 1.9, 10.3, 4.2).unwrap();
		assert_eq!(window, Window::new(3, 1, 11, 6));
	}

	#[test]
	fn test_snapped_exact_stays() {
		let window = Window::snapped(4.0, 2.0, 8.0, 8.0).unwrap();
		assert_eq!(window, Window::new(4, 2, 8, 8));
	}

	#[test]
	fn test_snapped_rejects_empty() {
		assert!(Window::snapped(0.0, 0.0, 0.0, 4.0).is_err());
	}

	#[test]
	fn test_intersection() {
		let a = Window::new(0, 0, 10, 10);
		let b = Window::new(5, 5, 10, 10);
		assert_eq!(a.intersection(&b), Some(Window::new(5, 5, 5, 5)));
	}

	#[test]
	fn test_intersection_disjoint() {
		let a = Window::new(0, 0, 10, 10);
		let b = Window::new(20, 0, 10, 10);
		assert_eq!(a.intersection(&b), None);
	}

	#[test]
	fn test_intersection_touching_edge_is_empty() {
		let a = Window::new(0, 0, 10, 10);
		let b = Window::new(10, 0, 10, 10);
		assert_eq!(a.intersection(&b), None);
	}

	#[test]
	fn test_union() {
		let a = Window::new(0, 0, 10, 10);
		let b = Window::new(20, 5, 10, 10);
		assert_eq!(a.union(&b), Window::new(0, 0, 30, 15));
	}

	#[test]
	fn test_negative_offsets() {
		let a = Window::new(-5, -5, 10, 10);
		let b = Window::new(0, 0, 10, 10);
		assert_eq!(a.intersection(&b), Some(Window::new(0, 0, 5, 5)));
	}
}
