//! I/O adapters for rasters, vectors and the observation service

pub mod raster;
pub mod vector;
pub mod observation;

pub use raster::RasterAccessor;
pub use vector::VectorStore;
pub use observation::{ObservationClient, ObservationConfig};
