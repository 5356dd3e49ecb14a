//! Layer model: the validated description of one dataset version to process.

use anyhow::{Context, Result};
use rastergrid_core::{Compression, DataType, DestinationProfile, Grid, RasterGridError, TileId};
use regex::Regex;
use serde::{Deserialize, Deserializer};

/// Version strings must look like `v20191122`, `v1.6` or `v2.1.3`.
const VERSION_PATTERN: &str = r"^v[0-9]{1,8}(\.[0-9]{0,3}){0,2}$";

/// Kind of source data behind a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
	Raster,
	/// Tree-cover-density style rasters; processed like plain rasters.
	TcdRaster,
	Vector,
}

impl SourceType {
	pub fn from_str(value: &str) -> Result<SourceType> {
		Ok(match value {
			"raster" => SourceType::Raster,
			"tcd_raster" => SourceType::TcdRaster,
			"vector" => SourceType::Vector,
			_ => {
				return Err(RasterGridError::Validation(format!("unknown source type: {value}")).into());
			}
		})
	}

	pub fn is_raster(&self) -> bool {
		matches!(self, SourceType::Raster | SourceType::TcdRaster)
	}
}

/// Resampling method applied when warping source pixels onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
	#[default]
	Nearest,
	Bilinear,
	Cubic,
	CubicSpline,
	Lanczos,
	Average,
	Mode,
	Min,
	Max,
	Med,
	Q1,
	Q3,
}

impl Resampling {
	/// The matching `GDALResampleAlg` constant.
	pub fn as_gdal(&self) -> gdal_sys::GDALResampleAlg::Type {
		use gdal_sys::GDALResampleAlg::*;
		use Resampling::*;
		match self {
			Nearest => GRA_NearestNeighbour,
			Bilinear => GRA_Bilinear,
			Cubic => GRA_Cubic,
			CubicSpline => GRA_CubicSpline,
			Lanczos => GRA_Lanczos,
			Average => GRA_Average,
			Mode => GRA_Mode,
			Min => GRA_Min,
			Max => GRA_Max,
			Med => GRA_Med,
			Q1 => GRA_Q1,
			Q3 => GRA_Q3,
		}
	}
}

/// Output flavor of a tile. The primary `raster` output is LZW compressed;
/// the post-processing hook may add the DEFLATE `geotiff` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
	Raster,
	Geotiff,
}

impl OutputFormat {
	/// Path segment of this format in the remote key layout.
	pub fn key_segment(&self) -> &'static str {
		match self {
			OutputFormat::Raster => "raster",
			OutputFormat::Geotiff => "geotiff",
		}
	}

	pub fn compression(&self) -> Compression {
		match self {
			OutputFormat::Raster => Compression::Lzw,
			OutputFormat::Geotiff => Compression::Deflate,
		}
	}
}

/// Deserialized layer document, before validation. `no_data` accepts a JSON
/// number or the string `"nan"`.
#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
	pub dataset: String,
	pub version: String,
	pub pixel_meaning: String,
	pub source_type: SourceType,
	pub data_type: DataType,
	#[serde(default)]
	pub nbits: Option<u8>,
	#[serde(default, deserialize_with = "deserialize_nodata")]
	pub no_data: Option<f64>,
	pub grid: String,
	#[serde(default)]
	pub resampling: Resampling,
	#[serde(default)]
	pub source_uri: Option<String>,
	#[serde(default)]
	pub calc: Option<String>,
	#[serde(default)]
	pub order: Option<String>,
	#[serde(default)]
	pub symbology: Option<serde_json::Value>,
	#[serde(default)]
	pub compute_stats: bool,
	#[serde(default)]
	pub compute_histogram: bool,
	#[serde(default)]
	pub process_locally: bool,
}

fn deserialize_nodata<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Number(f64),
		Text(String),
	}
	match Option::<Raw>::deserialize(deserializer)? {
		None => Ok(None),
		Some(Raw::Number(value)) => Ok(Some(value)),
		Some(Raw::Text(text)) if text.eq_ignore_ascii_case("nan") => Ok(Some(f64::NAN)),
		Some(Raw::Text(text)) => Err(serde::de::Error::custom(format!("invalid no_data value: {text:?}"))),
	}
}

/// A validated layer bound to its grid. Construction is the only place the
/// spec invariants are checked; afterwards the layer is immutable.
#[derive(Debug, Clone)]
pub struct Layer {
	pub spec: LayerSpec,
	pub grid: Grid,
}

impl Layer {
	pub fn new(spec: LayerSpec) -> Result<Layer> {
		let grid = rastergrid_core::grid_factory(&spec.grid)?;
		let layer = Layer { spec, grid };
		layer.validate()?;
		Ok(layer)
	}

	fn validate(&self) -> Result<()> {
		let fail = |message: String| -> Result<()> { Err(RasterGridError::Validation(message).into()) };

		let version_re = Regex::new(VERSION_PATTERN).expect("version pattern is valid");
		if !version_re.is_match(&self.spec.version) {
			return fail(format!("version ({}) does not match pattern {VERSION_PATTERN}", self.spec.version));
		}
		if let Some(nodata) = self.spec.no_data {
			self
				.spec
				.data_type
				.validate_nodata(nodata)
				.map_err(|err| RasterGridError::Validation(err.to_string()))
				.context("no_data is incompatible with data_type")?;
		}
		if self.spec.calc.is_some() && !self.spec.source_type.is_raster() {
			return fail("calc expressions are only supported for raster sources".to_string());
		}
		if self.spec.source_type == SourceType::Vector {
			return fail("vector sources are not supported by this build; provide a raster manifest".to_string());
		}
		if self.spec.source_uri.is_none() {
			return fail("raster layers require a source_uri manifest".to_string());
		}
		Ok(())
	}

	pub fn has_calc(&self) -> bool {
		self.spec.calc.is_some()
	}

	/// Destination profile of one tile in the given output format.
	pub fn destination_profile(&self, tile_id: &TileId, format: OutputFormat) -> Result<DestinationProfile> {
		self.grid.destination_profile(
			tile_id,
			self.spec.data_type,
			self.spec.no_data,
			format.compression(),
			self.spec.nbits,
		)
	}

	/// Remote key of one tile file:
	/// `{dataset}/{version}/{format}/{grid}/{pixel_meaning}/{tile_id}.tif`.
	pub fn remote_key(&self, tile_id: &TileId, format: OutputFormat) -> String {
		format!(
			"{}/{}/{}/{}/{}/{}.tif",
			self.spec.dataset,
			self.spec.version,
			format.key_segment(),
			self.grid.name(),
			self.spec.pixel_meaning,
			tile_id
		)
	}
}
