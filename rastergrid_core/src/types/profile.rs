use crate::types::{Bounds, DataType, GeoTransform};
use std::fmt::{self, Display};

/// Coordinate reference system of a grid. Only the two systems used by the
/// known grids are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
	/// Geographic, WGS 84.
	Epsg4326,
	/// Web-mercator.
	Epsg3857,
}

impl Crs {
	pub fn epsg(&self) -> u32 {
		match self {
			Crs::Epsg4326 => 4326,
			Crs::Epsg3857 => 3857,
		}
	}

	pub fn authority(&self) -> String {
		format!("EPSG:{}", self.epsg())
	}
}

/// GeoTIFF compression of an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	Lzw,
	Deflate,
}

impl Compression {
	pub fn as_gdal_option(&self) -> &'static str {
		match self {
			Compression::Lzw => "LZW",
			Compression::Deflate => "DEFLATE",
		}
	}
}

impl Display for Compression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_gdal_option())
	}
}

/// Everything needed to create one output tile file: georeferencing, shape,
/// band layout and storage options.
///
/// Invariants: `width`/`height` equal the grid's tile size in pixels and the
/// transform's origin is the tile's north-west corner. A profile is fixed
/// during tile initialization and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationProfile {
	pub crs: Crs,
	pub transform: GeoTransform,
	pub width: u64,
	pub height: u64,
	pub dtype: DataType,
	pub nodata: Option<f64>,
	pub block_x_size: u64,
	pub block_y_size: u64,
	pub compression: Compression,
	pub nbits: Option<u8>,
}

impl DestinationProfile {
	pub fn has_nodata(&self) -> bool {
		self.nodata.is_some()
	}

	/// World extent of the tile.
	pub fn bounds(&self) -> Bounds {
		self.transform.window_bounds(&crate::Window::new(0, 0, self.width, self.height))
	}

	/// Bytes of one internal block at the output data type.
	pub fn block_byte_size(&self) -> u64 {
		self.block_x_size * self.block_y_size * self.dtype.item_size() as u64
	}

	#[must_use]
	pub fn with_compression(&self, compression: Compression) -> DestinationProfile {
		DestinationProfile { compression, ..self.clone() }
	}
}
