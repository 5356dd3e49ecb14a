//! Parser for the calc sub-language: arithmetic and comparisons over band
//! identifiers, numeric literals and an allowlist of elementwise functions.
//! Anything else fails to parse; there is no attribute access, indexing or
//! free function call syntax.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace0, one_of};
use nom::combinator::{all_consuming, opt, recognize};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded};
use nom::{IResult, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
	Add,
	Sub,
	Mul,
	Div,
	FloorDiv,
	Rem,
	Pow,
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
	Abs,
	Log,
	Log2,
	Log10,
	Exp,
	Sqrt,
	Floor,
	Ceil,
	Minimum,
	Maximum,
	Where,
	IsNan,
	IsFinite,
}

impl Function {
	pub fn from_name(name: &str) -> Option<Function> {
		use Function::*;
		Some(match name {
			"abs" => Abs,
			"log" => Log,
			"log2" => Log2,
			"log10" => Log10,
			"exp" => Exp,
			"sqrt" => Sqrt,
			"floor" => Floor,
			"ceil" => Ceil,
			"minimum" => Minimum,
			"maximum" => Maximum,
			"where" => Where,
			"isnan" => IsNan,
			"isfinite" => IsFinite,
			_ => return None,
		})
	}

	pub fn arity(&self) -> usize {
		use Function::*;
		match self {
			Minimum | Maximum => 2,
			Where => 3,
			_ => 1,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
	Number(f64),
	Ident(String),
	Neg(Box<Expr>),
	Binary(BinaryOp, Box<Expr>, Box<Expr>),
	Call(Function, Vec<Expr>),
}

/// Parse a complete calc expression. Returns `Err` on any syntax the
/// sub-language does not define.
pub fn parse(src: &str) -> Result<Expr, String> {
	match all_consuming(delimited(multispace0, comparison, multispace0)).parse(src) {
		Ok((_, expr)) => Ok(expr),
		Err(err) => Err(format!("syntax error: {err}")),
	}
}

fn comparison(input: &str) -> IResult<&str, Expr> {
	let (input, first) = additive(input)?;
	let (input, rest) = opt(pair(
		ws(alt((
			tag("==").map(|_| BinaryOp::Eq),
			tag("!=").map(|_| BinaryOp::Ne),
			tag("<=").map(|_| BinaryOp::Le),
			tag(">=").map(|_| BinaryOp::Ge),
			tag("<").map(|_| BinaryOp::Lt),
			tag(">").map(|_| BinaryOp::Gt),
		))),
		additive,
	))
	.parse(input)?;
	Ok((
		input,
		match rest {
			Some((op, right)) => Expr::Binary(op, Box::new(first), Box::new(right)),
			None => first,
		},
	))
}

fn additive(input: &str) -> IResult<&str, Expr> {
	let (input, first) = multiplicative(input)?;
	let (input, rest) = many0(pair(
		ws(alt((char('+').map(|_| BinaryOp::Add), char('-').map(|_| BinaryOp::Sub)))),
		multiplicative,
	))
	.parse(input)?;
	Ok((input, fold_binary(first, rest)))
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
	let (input, first) = unary(input)?;
	let (input, rest) = many0(pair(
		ws(alt((
			tag("//").map(|_| BinaryOp::FloorDiv),
			tag("*").map(|_| BinaryOp::Mul),
			tag("/").map(|_| BinaryOp::Div),
			tag("%").map(|_| BinaryOp::Rem),
		))),
		unary,
	))
	.parse(input)?;
	Ok((input, fold_binary(first, rest)))
}

// `-a ** b` follows the usual convention: the power binds tighter than the
// unary minus, so it parses as `-(a ** b)`.
fn unary(input: &str) -> IResult<&str, Expr> {
	alt((
		preceded(ws(char('-')), unary).map(|expr| Expr::Neg(Box::new(expr))),
		power,
	))
	.parse(input)
}

fn power(input: &str) -> IResult<&str, Expr> {
	let (input, base) = atom(input)?;
	let (input, exponent) = opt(preceded(ws(tag("**")), unary)).parse(input)?;
	Ok((
		input,
		match exponent {
			Some(exponent) => Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)),
			None => base,
		},
	))
}

fn atom(input: &str) -> IResult<&str, Expr> {
	preceded(
		multispace0,
		alt((
			number,
			call_or_ident,
			delimited(ws(char('(')), comparison, ws(char(')'))),
		)),
	)
	.parse(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
	let (input, text) = recognize((
		digit1,
		opt(preceded(char('.'), digit0)),
		opt((one_of("eE"), opt(one_of("+-")), digit1)),
	))
	.parse(input)?;
	match text.parse::<f64>() {
		Ok(value) => Ok((input, Expr::Number(value))),
		Err(_) => Err(nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Float))),
	}
}

fn identifier(input: &str) -> IResult<&str, &str> {
	recognize(pair(alt((alpha1, tag("_"))), many0(alt((alphanumeric1, tag("_")))))).parse(input)
}

fn call_or_ident(input: &str) -> IResult<&str, Expr> {
	let (rest, name) = identifier(input)?;
	let (rest, arguments) = opt(delimited(
		ws(char('(')),
		separated_list0(ws(char(',')), comparison),
		ws(char(')')),
	))
	.parse(rest)?;
	match arguments {
		None => Ok((rest, Expr::Ident(name.to_string()))),
		Some(arguments) => match Function::from_name(name) {
			Some(function) => Ok((rest, Expr::Call(function, arguments))),
			// unknown function names are a hard error, not backtracking
			None => Err(nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Tag))),
		},
	}
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
	rest
		.into_iter()
		.fold(first, |left, (op, right)| Expr::Binary(op, Box::new(left), Box::new(right)))
}

fn ws<'a, O, P>(parser: P) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
	P: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
	delimited(multispace0, parser, multispace0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn num(value: f64) -> Box<Expr> {
		Box::new(Expr::Number(value))
	}

	fn ident(name: &str) -> Box<Expr> {
		Box::new(Expr::Ident(name.to_string()))
	}

	#[test]
	fn test_precedence_mul_before_add() {
		// A + (1 * 5)
		assert_eq!(
			parse("A+1*5").unwrap(),
			Expr::Binary(
				BinaryOp::Add,
				ident("A"),
				Box::new(Expr::Binary(BinaryOp::Mul, num(1.0), num(5.0)))
			)
		);
		// (A * 5) + 1
		assert_eq!(
			parse("A*5+1").unwrap(),
			Expr::Binary(
				BinaryOp::Add,
				Box::new(Expr::Binary(BinaryOp::Mul, ident("A"), num(5.0))),
				num(1.0)
			)
		);
	}

	#[test]
	fn test_power_binds_tighter_than_neg() {
		assert_eq!(
			parse("-2**2").unwrap(),
			Expr::Neg(Box::new(Expr::Binary(BinaryOp::Pow, num(2.0), num(2.0))))
		);
		assert_eq!(
			parse("2**-1").unwrap(),
			Expr::Binary(BinaryOp::Pow, num(2.0), Box::new(Expr::Neg(num(1.0))))
		);
	}

	#[test]
	fn test_floor_div_and_rem() {
		assert_eq!(
			parse("A // 2 % 3").unwrap(),
			Expr::Binary(
				BinaryOp::Rem,
				Box::new(Expr::Binary(BinaryOp::FloorDiv, ident("A"), num(2.0))),
				num(3.0)
			)
		);
	}

	#[test]
	fn test_function_calls() {
		assert_eq!(
			parse("minimum(A, 10)").unwrap(),
			Expr::Call(Function::Minimum, vec![Expr::Ident("A".to_string()), Expr::Number(10.0)])
		);
		assert_eq!(
			parse("where(A > 0, A, 0)").unwrap(),
			Expr::Call(
				Function::Where,
				vec![
					Expr::Binary(BinaryOp::Gt, ident("A"), num(0.0)),
					Expr::Ident("A".to_string()),
					Expr::Number(0.0),
				]
			)
		);
	}

	#[test]
	fn test_unknown_function_is_rejected() {
		assert!(parse("open(A)").is_err());
		assert!(parse("exec(A)").is_err());
		assert!(parse("__import__(A)").is_err());
	}

	#[test]
	fn test_unsupported_syntax_is_rejected() {
		assert!(parse("A.data").is_err());
		assert!(parse("A[0]").is_err());
		assert!(parse("A; B").is_err());
		assert!(parse("lambda x: x").is_err());
		assert!(parse("").is_err());
	}

	#[test]
	fn test_parentheses_and_whitespace() {
		assert_eq!(
			parse(" ( A + 1 ) * 5 ").unwrap(),
			Expr::Binary(
				BinaryOp::Mul,
				Box::new(Expr::Binary(BinaryOp::Add, ident("A"), num(1.0))),
				num(5.0)
			)
		);
	}

	#[test]
	fn test_scientific_notation() {
		assert_eq!(parse("1.5e3").unwrap(), Expr::Number(1500.0));
		assert_eq!(parse("2e-2").unwrap(), Expr::Number(0.02));
	}
}
