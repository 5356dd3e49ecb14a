//! The calc sub-language: a restricted, side-effect-free arithmetic
//! expression applied per pixel during the transform.
//!
//! Expressions see the band bindings (`A` for single-band inputs), numeric
//! literals, the operators `+ - * / // % **`, comparisons, parentheses,
//! unary minus and a fixed allowlist of elementwise functions. Everything
//! else is rejected statically with
//! [`CalcInvalid`](rastergrid_core::RasterGridError::CalcInvalid) before any
//! pixel is touched.

mod eval;
mod parser;

pub use eval::{evaluate as evaluate_expr, validate, Bindings};
pub use parser::{Expr, Function};

use anyhow::Result;
use rastergrid_core::{MaskedArray, RasterGridError};

/// Parse and statically validate a calc expression against the available
/// band names. This is the gate every expression passes before execution.
pub fn compile(src: &str, binding_names: &[&str]) -> Result<Expr> {
	let expr = parser::parse(src).map_err(|message| RasterGridError::CalcInvalid(format!("{src}: {message}")))?;
	validate(&expr, binding_names)?;
	Ok(expr)
}

/// One-shot entry point: parse, validate against the binding names, then
/// evaluate. Deterministic and side-effect-free; the result has the shape of
/// the bindings.
pub fn evaluate(src: &str, bindings: &Bindings) -> Result<MaskedArray> {
	let names: Vec<&str> = bindings.keys().map(|name| name.as_str()).collect();
	let expr = compile(src, &names)?;
	eval::evaluate(&expr, bindings)
}
