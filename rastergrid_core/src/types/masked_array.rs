use anyhow::{ensure, Result};
use ndarray::{Array2, Zip};

/// A 2-D array of `f64` samples paired with a validity mask (`true` means
/// invalid / nodata).
///
/// All elementwise combinators fold non-finite results (NaN, ±infinity, and
/// therefore division by zero) into the mask, so downstream consumers only
/// ever observe finite data or masked cells.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedArray {
	pub data: Array2<f64>,
	pub mask: Array2<bool>,
}

impl MaskedArray {
	pub fn new(data: Array2<f64>, mask: Array2<bool>) -> Result<MaskedArray> {
		ensure!(
			data.dim() == mask.dim(),
			"data shape {:?} does not match mask shape {:?}",
			data.dim(),
			mask.dim()
		);
		Ok(MaskedArray { data, mask })
	}

	/// Wrap raw data with every cell valid.
	pub fn from_data(data: Array2<f64>) -> MaskedArray {
		let mask = Array2::from_elem(data.dim(), false);
		MaskedArray { data, mask }
	}

	/// Wrap raw data, masking cells equal to `nodata` and non-finite cells.
	/// A NaN nodata masks exactly the NaN cells.
	pub fn from_nodata(data: Array2<f64>, nodata: Option<f64>) -> MaskedArray {
		let mask = match nodata {
			Some(nd) if nd.is_nan() => data.mapv(|v| v.is_nan()),
			Some(nd) => data.mapv(|v| v == nd || !v.is_finite()),
			None => data.mapv(|v| !v.is_finite()),
		};
		MaskedArray { data, mask }
	}

	/// A fully valid constant array.
	pub fn constant(value: f64, rows: usize, cols: usize) -> MaskedArray {
		MaskedArray::from_data(Array2::from_elem((rows, cols), value))
	}

	/// `(rows, cols)`
	pub fn shape(&self) -> (usize, usize) {
		self.data.dim()
	}

	/// True iff the array has a non-zero shape and at least one valid cell.
	pub fn has_data(&self) -> bool {
		let (rows, cols) = self.shape();
		rows > 0 && cols > 0 && self.mask.iter().any(|masked| !masked)
	}

	/// Number of valid cells.
	pub fn valid_count(&self) -> usize {
		self.mask.iter().filter(|masked| !**masked).count()
	}

	/// Data with every masked cell replaced by `fill`.
	pub fn filled(&self, fill: f64) -> Array2<f64> {
		let mut out = self.data.clone();
		Zip::from(&mut out).and(&self.mask).for_each(|v, &masked| {
			if masked {
				*v = fill;
			}
		});
		out
	}

	/// Apply `f` to every valid cell; non-finite results become masked.
	#[must_use]
	pub fn unary(&self, f: impl Fn(f64) -> f64) -> MaskedArray {
		let data = self.data.mapv(&f);
		let mask = Zip::from(&self.mask)
			.and(&data)
			.map_collect(|&masked, &v| masked || !v.is_finite());
		MaskedArray { data, mask }
	}

	/// Combine two arrays of the same shape cell by cell; a cell is masked in
	/// the result when it is masked in either input or when `f` produced a
	/// non-finite value.
	pub fn binary(&self, other: &MaskedArray, f: impl Fn(f64, f64) -> f64) -> Result<MaskedArray> {
		ensure!(
			self.shape() == other.shape(),
			"shape mismatch: {:?} vs {:?}",
			self.shape(),
			other.shape()
		);
		let data = Zip::from(&self.data).and(&other.data).map_collect(|&a, &b| f(a, b));
		let mask = Zip::from(&self.mask)
			.and(&other.mask)
			.and(&data)
			.map_collect(|&ma, &mb, &v| ma || mb || !v.is_finite());
		Ok(MaskedArray { data, mask })
	}

	/// Sum of the valid cells.
	pub fn sum(&self) -> f64 {
		Zip::from(&self.data)
			.and(&self.mask)
			.fold(0.0, |acc, &v, &masked| if masked { acc } else { acc + v })
	}
}
