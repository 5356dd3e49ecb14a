//! Process-wide configuration, read once at startup and immutable afterwards.

use crate::error::RasterGridError;
use anyhow::{Context, Result};
use std::env;

/// Fallback memory budget when neither `MAX_MEM` nor a container limit is
/// available.
const DEFAULT_MAX_MEM: u64 = 8 * 1024 * 1024 * 1024;

/// Base fraction of the per-process budget reserved per super-window; copies
/// of an array may exist concurrently during read/calc/cast.
const BASE_DIVISOR: u64 = 8;

/// Deployment environment; selects the destination bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
	Dev,
	Staging,
	Prod,
	Test,
}

impl Environment {
	pub fn from_str(value: &str) -> Result<Environment> {
		Ok(match value {
			"dev" => Environment::Dev,
			"staging" => Environment::Staging,
			"prod" | "production" => Environment::Prod,
			"test" => Environment::Test,
			_ => {
				return Err(RasterGridError::Validation(format!("unknown environment: {value}")).into());
			}
		})
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Environment::Dev => "dev",
			Environment::Staging => "staging",
			Environment::Prod => "prod",
			Environment::Test => "test",
		}
	}

	/// Destination bucket for this environment.
	pub fn bucket(&self) -> String {
		format!("rastergrid-data-{}", self.as_str())
	}
}

/// Environment variables relevant to a run, captured once.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvSettings {
	pub environment: Environment,
	pub aws_region: String,
	pub endpoint_url: Option<String>,
	pub cores: usize,
	pub max_mem: u64,
}

impl EnvSettings {
	/// Read `ENV`, `AWS_REGION`, `ENDPOINT_URL`, `CORES` and `MAX_MEM`.
	/// Missing values fall back to dev / us-east-1 / detected cores / the
	/// container memory limit.
	pub fn from_env() -> Result<EnvSettings> {
		let environment = match env::var("ENV") {
			Ok(value) => Environment::from_str(&value)?,
			Err(_) => Environment::Dev,
		};
		let cores = match env::var("CORES") {
			Ok(value) => value.parse::<usize>().context("CORES must be a positive integer")?.max(1),
			Err(_) => num_cpus::get(),
		};
		let max_mem = match env::var("MAX_MEM") {
			Ok(value) => value.parse::<u64>().context("MAX_MEM must be a byte count")?,
			Err(_) => detect_memory_limit().unwrap_or(DEFAULT_MAX_MEM),
		};
		Ok(EnvSettings {
			environment,
			aws_region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
			endpoint_url: env::var("ENDPOINT_URL").ok(),
			cores,
			max_mem,
		})
	}
}

/// cgroup v2 (then v1) memory limit of the running container, if any.
fn detect_memory_limit() -> Option<u64> {
	for path in ["/sys/fs/cgroup/memory.max", "/sys/fs/cgroup/memory/memory.limit_in_bytes"] {
		if let Ok(content) = std::fs::read_to_string(path) {
			if let Ok(limit) = content.trim().parse::<u64>() {
				// absurdly large values mean "unlimited"
				if limit < u64::MAX / 2 {
					return Some(limit);
				}
			}
		}
	}
	None
}

/// Resource envelope of one run. Built once from [`EnvSettings`], then only
/// read; the transform engine uses it to size super-windows, the pipeline to
/// size its worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalResourceState {
	/// Physical cores available to the process.
	pub total_cores: usize,
	/// Tile-level pipeline width.
	pub workers: usize,
	/// Memory budget of one tile worker in bytes.
	pub per_process_memory: u64,
	/// Base super-window divisor.
	pub divisor: u64,
}

impl GlobalResourceState {
	/// `workers` is `ceil(cores / 2)`, or `ceil(cores / 3)` when a calc
	/// expression adds a second expensive stage.
	pub fn new(settings: &EnvSettings, has_calc: bool) -> GlobalResourceState {
		let denominator = if has_calc { 3 } else { 2 };
		let workers = settings.cores.div_ceil(denominator).max(1);
		GlobalResourceState {
			total_cores: settings.cores,
			workers,
			per_process_memory: settings.max_mem / workers as u64,
			divisor: BASE_DIVISOR,
		}
	}

	/// Sub-workers available per tile; `>= 2` enables parallel window mode.
	pub fn co_workers(&self) -> usize {
		self.total_cores / self.workers
	}

	/// Super-window divisor: the base, widened by co-workers and by the
	/// presence of a calc expression.
	pub fn divisor_for(&self, has_calc: bool) -> u64 {
		let mut divisor = self.divisor;
		let co_workers = self.co_workers() as u64;
		if co_workers >= 2 {
			divisor *= co_workers;
		}
		if has_calc {
			divisor *= self.divisor;
		}
		divisor
	}

	/// Memory available to one super-window in bytes.
	pub fn memory_per_super_window(&self, has_calc: bool) -> u64 {
		self.per_process_memory / self.divisor_for(has_calc)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings(cores: usize, max_mem: u64) -> EnvSettings {
		EnvSettings {
			environment: Environment::Test,
			aws_region: "us-east-1".to_string(),
			endpoint_url: None,
			cores,
			max_mem,
		}
	}

	#[test]
	fn test_environment_bucket() {
		assert_eq!(Environment::Test.bucket(), "rastergrid-data-test");
		assert_eq!(Environment::from_str("prod").unwrap(), Environment::Prod);
		assert!(Environment::from_str("qa").is_err());
	}

	#[test]
	fn test_worker_count() {
		assert_eq!(GlobalResourceState::new(&settings(8, 1024), false).workers, 4);
		assert_eq!(GlobalResourceState::new(&settings(8, 1024), true).workers, 3);
		assert_eq!(GlobalResourceState::new(&settings(1, 1024), false).workers, 1);
	}

	#[test]
	fn test_co_workers() {
		// 16 cores, 8 workers -> 2 co-workers per tile
		let state = GlobalResourceState::new(&settings(16, 1024), false);
		assert_eq!(state.co_workers(), 2);
		// 4 cores, 2 workers -> 2 co-workers
		let state = GlobalResourceState::new(&settings(4, 1024), false);
		assert_eq!(state.co_workers(), 2);
		// 3 cores, 2 workers -> sequential
		let state = GlobalResourceState::new(&settings(3, 1024), false);
		assert_eq!(state.co_workers(), 1);
	}

	#[test]
	fn test_divisor_widening() {
		let state = GlobalResourceState::new(&settings(4, 1 << 30), false);
		assert_eq!(state.co_workers(), 2);
		assert_eq!(state.divisor_for(false), 16);
		assert_eq!(state.divisor_for(true), 128);

		let sequential = GlobalResourceState::new(&settings(3, 1 << 30), false);
		assert_eq!(sequential.co_workers(), 1);
		assert_eq!(sequential.divisor_for(false), 8);
	}

	#[test]
	fn test_memory_per_super_window() {
		// 3 cores -> 2 workers, 1 co-worker -> plain base divisor
		let state = GlobalResourceState::new(&settings(3, 1 << 30), false);
		assert_eq!(state.per_process_memory, (1 << 30) / 2);
		assert_eq!(state.memory_per_super_window(false), (1 << 30) / 2 / 8);
	}
}
