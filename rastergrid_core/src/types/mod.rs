//! Plain value types shared across the toolchain.

mod bounds;
mod data_type;
mod masked_array;
mod profile;
mod tile_id;
mod transform;
mod window;

pub use bounds::Bounds;
pub use data_type::DataType;
pub use masked_array::MaskedArray;
pub use profile::{Compression, Crs, DestinationProfile};
pub use tile_id::TileId;
pub use transform::GeoTransform;
pub use window::Window;
