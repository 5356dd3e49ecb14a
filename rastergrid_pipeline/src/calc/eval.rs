//! Evaluation of parsed calc expressions over masked arrays.
//!
//! Semantics follow elementwise array arithmetic: scalars broadcast, masks
//! propagate through every operation, and non-finite results (division by
//! zero, log of a negative, overflowing powers) fold into the mask.

use super::parser::{BinaryOp, Expr, Function};
use anyhow::Result;
use rastergrid_core::{MaskedArray, RasterGridError};
use std::collections::BTreeMap;

/// Named band arrays visible to an expression, e.g. `A` for the first band.
pub type Bindings = BTreeMap<String, MaskedArray>;

/// Intermediate value: scalars stay scalar until combined with an array.
enum Value {
	Scalar(f64),
	Array(MaskedArray),
}

impl Value {
	fn into_array(self, rows: usize, cols: usize) -> MaskedArray {
		match self {
			Value::Array(array) => array,
			Value::Scalar(value) => MaskedArray::constant(value, rows, cols),
		}
	}
}

/// Validate `expr` against the binding names: every identifier must resolve
/// and every function must be called with its exact arity. Violations are
/// [`RasterGridError::CalcInvalid`]; evaluation never starts on an invalid
/// expression.
pub fn validate(expr: &Expr, binding_names: &[&str]) -> Result<()> {
	let fail = |message: String| -> Result<()> { Err(RasterGridError::CalcInvalid(message).into()) };
	match expr {
		Expr::Number(_) => Ok(()),
		Expr::Ident(name) => {
			if binding_names.contains(&name.as_str()) {
				Ok(())
			} else {
				fail(format!("unknown band name: {name}"))
			}
		}
		Expr::Neg(inner) => validate(inner, binding_names),
		Expr::Binary(_, left, right) => {
			validate(left, binding_names)?;
			validate(right, binding_names)
		}
		Expr::Call(function, arguments) => {
			if arguments.len() != function.arity() {
				return fail(format!(
					"{function:?} takes {} argument(s), got {}",
					function.arity(),
					arguments.len()
				));
			}
			for argument in arguments {
				validate(argument, binding_names)?;
			}
			Ok(())
		}
	}
}

/// Evaluate `expr` against `bindings`. The result has the common shape of
/// the bindings; inputs are never modified.
pub fn evaluate(expr: &Expr, bindings: &Bindings) -> Result<MaskedArray> {
	let (rows, cols) = bindings
		.values()
		.next()
		.map(|array| array.shape())
		.ok_or_else(|| RasterGridError::CalcInvalid("no band bindings provided".to_string()))?;
	Ok(eval(expr, bindings)?.into_array(rows, cols))
}

fn eval(expr: &Expr, bindings: &Bindings) -> Result<Value> {
	Ok(match expr {
		Expr::Number(value) => Value::Scalar(*value),
		Expr::Ident(name) => Value::Array(
			bindings
				.get(name)
				.ok_or_else(|| RasterGridError::CalcInvalid(format!("unknown band name: {name}")))?
				.clone(),
		),
		Expr::Neg(inner) => match eval(inner, bindings)? {
			Value::Scalar(value) => Value::Scalar(-value),
			Value::Array(array) => Value::Array(array.unary(|v| -v)),
		},
		Expr::Binary(op, left, right) => {
			let left = eval(left, bindings)?;
			let right = eval(right, bindings)?;
			apply_binary(*op, left, right)?
		}
		Expr::Call(function, arguments) => {
			let values = arguments
				.iter()
				.map(|argument| eval(argument, bindings))
				.collect::<Result<Vec<_>>>()?;
			apply_function(*function, values)?
		}
	})
}

fn boolean(value: bool) -> f64 {
	if value { 1.0 } else { 0.0 }
}

fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
	match op {
		BinaryOp::Add => |a, b| a + b,
		BinaryOp::Sub => |a, b| a - b,
		BinaryOp::Mul => |a, b| a * b,
		BinaryOp::Div => |a, b| a / b,
		BinaryOp::FloorDiv => |a, b| (a / b).floor(),
		// modulo with the sign of the divisor
		BinaryOp::Rem => |a, b| a - b * (a / b).floor(),
		BinaryOp::Pow => |a, b| a.powf(b),
		BinaryOp::Eq => |a, b| boolean(a == b),
		BinaryOp::Ne => |a, b| boolean(a != b),
		BinaryOp::Lt => |a, b| boolean(a < b),
		BinaryOp::Le => |a, b| boolean(a <= b),
		BinaryOp::Gt => |a, b| boolean(a > b),
		BinaryOp::Ge => |a, b| boolean(a >= b),
	}
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
	let f = binary_fn(op);
	Ok(match (left, right) {
		(Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(a, b)),
		(Value::Array(a), Value::Scalar(b)) => Value::Array(a.unary(|v| f(v, b))),
		(Value::Scalar(a), Value::Array(b)) => Value::Array(b.unary(|v| f(a, v))),
		(Value::Array(a), Value::Array(b)) => Value::Array(a.binary(&b, f)?),
	})
}

fn unary_math(function: Function) -> fn(f64) -> f64 {
	match function {
		Function::Abs => f64::abs,
		Function::Log => f64::ln,
		Function::Log2 => f64::log2,
		Function::Log10 => f64::log10,
		Function::Exp => f64::exp,
		Function::Sqrt => f64::sqrt,
		Function::Floor => f64::floor,
		Function::Ceil => f64::ceil,
		Function::IsNan => |v| if v.is_nan() { 1.0 } else { 0.0 },
		Function::IsFinite => |v| if v.is_finite() { 1.0 } else { 0.0 },
		Function::Minimum | Function::Maximum | Function::Where => unreachable!("not a unary function"),
	}
}

fn apply_function(function: Function, mut values: Vec<Value>) -> Result<Value> {
	Ok(match function {
		Function::Minimum | Function::Maximum => {
			let right = values.pop().expect("arity checked");
			let left = values.pop().expect("arity checked");
			let f: fn(f64, f64) -> f64 = if function == Function::Minimum { f64::min } else { f64::max };
			match (left, right) {
				(Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(a, b)),
				(Value::Array(a), Value::Scalar(b)) => Value::Array(a.unary(|v| f(v, b))),
				(Value::Scalar(a), Value::Array(b)) => Value::Array(b.unary(|v| f(a, v))),
				(Value::Array(a), Value::Array(b)) => Value::Array(a.binary(&b, f)?),
			}
		}
		Function::Where => {
			let otherwise = values.pop().expect("arity checked");
			let then = values.pop().expect("arity checked");
			let condition = values.pop().expect("arity checked");
			apply_where(condition, then, otherwise)?
		}
		_ => {
			let f = unary_math(function);
			match values.pop().expect("arity checked") {
				Value::Scalar(value) => Value::Scalar(f(value)),
				Value::Array(array) => Value::Array(array.unary(f)),
			}
		}
	})
}

/// `where(cond, a, b)`: `a` where the condition is non-zero, else `b`. The
/// result is masked where the condition is masked or the chosen branch is
/// masked.
fn apply_where(condition: Value, then: Value, otherwise: Value) -> Result<Value> {
	let (condition, then, otherwise) = match (condition, then, otherwise) {
		// all scalars: stay scalar
		(Value::Scalar(c), Value::Scalar(a), Value::Scalar(b)) => {
			return Ok(Value::Scalar(if c != 0.0 { a } else { b }));
		}
		(condition, then, otherwise) => (condition, then, otherwise),
	};

	// find the array shape among the three values
	let shape = [&condition, &then, &otherwise]
		.iter()
		.find_map(|value| match value {
			Value::Array(array) => Some(array.shape()),
			Value::Scalar(_) => None,
		})
		.expect("at least one argument is an array");

	let condition = condition.into_array(shape.0, shape.1);
	let then = then.into_array(shape.0, shape.1);
	let otherwise = otherwise.into_array(shape.0, shape.1);

	let selected = condition.binary(&then, |c, a| if c != 0.0 { a } else { f64::NAN })?;
	// cells where the condition chose `otherwise` are NaN in `selected`;
	// resolve them from the other branch, keeping its mask
	let mut result = selected.binary(&otherwise, |s, b| if s.is_nan() { b } else { s })?;
	// the mask of the untaken branch must not leak into the result
	for ((row, col), masked) in result.mask.indexed_iter_mut() {
		let taken_then = !condition.mask[[row, col]] && condition.data[[row, col]] != 0.0;
		*masked = condition.mask[[row, col]]
			|| if taken_then {
				then.mask[[row, col]]
			} else {
				otherwise.mask[[row, col]]
			};
	}
	Ok(Value::Array(result))
}
