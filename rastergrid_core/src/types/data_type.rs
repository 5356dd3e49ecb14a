use anyhow::{bail, ensure, Result};
use serde::Deserialize;
use std::fmt::{self, Display};

/// Pixel data type of an output raster band.
///
/// Names follow the conventional lowercase raster vocabulary (`uint8`,
/// `float32`, ...) used in layer definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
	Uint8,
	Uint16,
	Int16,
	Uint32,
	Int32,
	Float32,
	Float64,
}

impl DataType {
	/// Size of one pixel in bytes; drives the memory accounting of the
	/// transform engine.
	pub fn item_size(&self) -> usize {
		use DataType::*;
		match self {
			Uint8 => 1,
			Uint16 | Int16 => 2,
			Uint32 | Int32 | Float32 => 4,
			Float64 => 8,
		}
	}

	pub fn is_float(&self) -> bool {
		matches!(self, DataType::Float32 | DataType::Float64)
	}

	/// Inclusive value range representable by this type.
	pub fn range(&self) -> (f64, f64) {
		use DataType::*;
		match self {
			Uint8 => (0.0, u8::MAX as f64),
			Uint16 => (0.0, u16::MAX as f64),
			Int16 => (i16::MIN as f64, i16::MAX as f64),
			Uint32 => (0.0, u32::MAX as f64),
			Int32 => (i32::MIN as f64, i32::MAX as f64),
			Float32 => (f64::MIN, f64::MAX),
			Float64 => (f64::MIN, f64::MAX),
		}
	}

	/// Check that `nodata` can be stored losslessly in this type.
	///
	/// Integer types require a whole number inside the type's range; NaN is
	/// only valid for floating point types.
	pub fn validate_nodata(&self, nodata: f64) -> Result<()> {
		if nodata.is_nan() {
			ensure!(self.is_float(), "NaN nodata requires a floating point data type, not {self}");
			return Ok(());
		}
		if !self.is_float() {
			ensure!(
				nodata.fract() == 0.0,
				"nodata ({nodata}) must be a whole number for data type {self}"
			);
			let (min, max) = self.range();
			ensure!(
				nodata >= min && nodata <= max,
				"nodata ({nodata}) is out of range for data type {self}"
			);
		}
		Ok(())
	}

	pub fn as_str(&self) -> &'static str {
		use DataType::*;
		match self {
			Uint8 => "uint8",
			Uint16 => "uint16",
			Int16 => "int16",
			Uint32 => "uint32",
			Int32 => "int32",
			Float32 => "float32",
			Float64 => "float64",
		}
	}

	pub fn from_str(value: &str) -> Result<DataType> {
		use DataType::*;
		Ok(match value {
			"uint8" => Uint8,
			"uint16" => Uint16,
			"int16" => Int16,
			"uint32" => Uint32,
			"int32" => Int32,
			"float32" => Float32,
			"float64" => Float64,
			_ => bail!("unknown data type: {value}"),
		})
	}
}

impl Display for DataType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case(DataType::Uint8, 1)]
	#[case(DataType::Int16, 2)]
	#[case(DataType::Uint32, 4)]
	#[case(DataType::Float32, 4)]
	#[case(DataType::Float64, 8)]
	fn test_item_size(#[case] dtype: DataType, #[case] size: usize) {
		assert_eq!(dtype.item_size(), size);
	}

	#[test]
	fn test_string_round_trip() {
		for name in ["uint8", "uint16", "int16", "uint32", "int32", "float32", "float64"] {
			assert_eq!(DataType::from_str(name).unwrap().as_str(), name);
		}
		assert!(DataType::from_str("complex64").is_err());
	}

	#[test]
	fn test_validate_nodata() {
		DataType::Uint8.validate_nodata(0.0).unwrap();
		DataType::Uint8.validate_nodata(255.0).unwrap();
		assert!(DataType::Uint8.validate_nodata(256.0).is_err());
		assert!(DataType::Uint8.validate_nodata(-1.0).is_err());
		assert!(DataType::Int16.validate_nodata(0.5).is_err());
		assert!(DataType::Uint8.validate_nodata(f64::NAN).is_err());
		DataType::Float32.validate_nodata(f64::NAN).unwrap();
		DataType::Float64.validate_nodata(-9999.0).unwrap();
	}
}
