//! Core types for the rastergrid toolchain: grids and tile ids, pixel
//! windows and geo transforms, masked arrays, resource accounting and the
//! error taxonomy. This crate touches no raster data and no network.

pub mod cancel;
pub mod config;
pub mod error;
pub mod grid;
pub mod types;

pub use cancel::CancelFlag;
pub use config::{EnvSettings, Environment, GlobalResourceState};
pub use error::{RasterGridError, RetryPolicy};
pub use grid::{grid_factory, Grid, LatLngGrid, WebMercatorGrid, KNOWN_GRIDS};
pub use types::*;
