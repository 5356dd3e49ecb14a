//! The rastergrid processing crate: layer model, source catalog, GDAL-backed
//! raster views, the per-tile transform engine, the calc expression
//! evaluator, object storage access and the staged tile pipeline.
//!
//! The main entry point is [`pipe::Pipe`], which seeds a grid of
//! [`tile::Tile`]s for a [`layer::Layer`] and drives them through
//! filter → transform → postprocess → upload stages with bounded
//! parallelism.

pub mod calc;
pub mod catalog;
pub mod layer;
pub mod pipe;
pub mod postprocess;
pub mod source;
pub mod storage;
pub mod tile;
pub mod transform;

pub use catalog::SourceCatalog;
pub use layer::{Layer, OutputFormat, Resampling, SourceType};
pub use pipe::{Pipe, PipeResults};
pub use storage::{MemoryStore, ObjectStore, S3Store};
pub use tile::{Tile, TileStatus};
