//! Error taxonomy and the structured retry policy for remote I/O.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Failure classes of the toolchain.
///
/// The taxonomy travels inside [`anyhow`] chains; use
/// [`RasterGridError::classify`] to recover the class at a decision point
/// (e.g. the pipeline sink or the CLI exit code).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RasterGridError {
	/// Malformed layer spec or CLI arguments. Fatal before any I/O.
	#[error("validation error: {0}")]
	Validation(String),

	/// Source manifest absent. Fatal.
	#[error("manifest not found: {0}")]
	ManifestNotFound(String),

	/// Source manifest unparsable. Fatal.
	#[error("manifest malformed: {0}")]
	ManifestMalformed(String),

	/// A coordinate outside the grid's domain.
	#[error("invalid coordinate: {0}")]
	InvalidCoordinate(String),

	/// All read retries exhausted, or a non-retryable I/O class. Tile-fatal.
	#[error("source unavailable: {0}")]
	SourceUnavailable(String),

	/// Calc expression rejected by static validation. Tile-fatal.
	#[error("invalid calc expression: {0}")]
	CalcInvalid(String),

	/// Write, cast or reprojection failure. Tile-fatal.
	#[error("transform failed: {0}")]
	Transform(String),

	/// Destination write failure. Tile-fatal.
	#[error("upload failed: {0}")]
	Upload(String),
}

impl RasterGridError {
	/// The taxonomy error in `err`'s chain, if any; works for both root
	/// errors and classes attached via `.context(...)`.
	pub fn classify(err: &anyhow::Error) -> Option<&RasterGridError> {
		err.downcast_ref::<RasterGridError>()
	}

	/// True for classes that abort the whole run rather than a single tile.
	pub fn is_run_fatal(&self) -> bool {
		matches!(
			self,
			RasterGridError::Validation(_) | RasterGridError::ManifestNotFound(_) | RasterGridError::ManifestMalformed(_)
		)
	}
}

/// Messages GDAL and the storage SDKs produce for missing, unreadable or
/// unsupported files. These never recover on retry.
const TERMINAL_IO_MESSAGES: [&str; 5] = [
	"does not exist in the file system, and is not recognized as a supported dataset name",
	"The specified key does not exist",
	"No such file or directory",
	"not recognized as a supported file format",
	"Access Denied",
];

/// True when the error chain indicates a not-found / unknown-format /
/// access-denied condition that retrying cannot fix.
pub fn is_terminal_io(err: &anyhow::Error) -> bool {
	err
		.chain()
		.any(|cause| TERMINAL_IO_MESSAGES.iter().any(|msg| cause.to_string().contains(msg)))
}

/// Retryable iff not terminal.
pub fn is_transient_io(err: &anyhow::Error) -> bool {
	!is_terminal_io(err)
}

/// Exponential backoff policy for remote I/O: `base · 2^attempt`, capped.
///
/// One policy object is shared by reads and uploads; retryability is decided
/// by the predicate passed to [`RetryPolicy::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base: Duration,
	pub cap: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			max_attempts: 7,
			base: Duration::from_secs(1),
			cap: Duration::from_secs(300),
		}
	}
}

impl RetryPolicy {
	/// Wait time before retry number `attempt` (0-based).
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
		self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
	}

	/// Blocking variant of [`RetryPolicy::run`] for use inside
	/// `spawn_blocking` sections; sleeps on the current thread.
	pub fn run_blocking<T>(
		&self,
		label: &str,
		is_retryable: impl Fn(&anyhow::Error) -> bool,
		mut operation: impl FnMut() -> Result<T>,
	) -> Result<T> {
		let mut attempt = 0;
		loop {
			match operation() {
				Ok(value) => return Ok(value),
				Err(err) => {
					attempt += 1;
					if attempt >= self.max_attempts || !is_retryable(&err) {
						return Err(err);
					}
					let wait = self.backoff(attempt - 1);
					log::warn!("{label} failed (attempt {attempt}/{}), retrying in {wait:?}: {err:#}", self.max_attempts);
					std::thread::sleep(wait);
				}
			}
		}
	}

	/// Run `operation` until it succeeds, the predicate declares the error
	/// terminal, or the attempt budget is exhausted.
	pub async fn run<T, F, Fut>(
		&self,
		label: &str,
		is_retryable: impl Fn(&anyhow::Error) -> bool,
		mut operation: F,
	) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let mut attempt = 0;
		loop {
			match operation().await {
				Ok(value) => return Ok(value),
				Err(err) => {
					attempt += 1;
					if attempt >= self.max_attempts || !is_retryable(&err) {
						return Err(err);
					}
					let wait = self.backoff(attempt - 1);
					log::warn!("{label} failed (attempt {attempt}/{}), retrying in {wait:?}: {err:#}", self.max_attempts);
					tokio::time::sleep(wait).await;
				}
			}
		}
	}
}
