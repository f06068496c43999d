//! lakewqp: lake water-quality statistics from satellite products
//!
//! Crops Sentinel-3 / Landsat-8 water-quality-parameter rasters to lake
//! polygons, computes zonal statistics, rejects statistical outliers, merges
//! basin mosaics and reshapes the statistics into observation-service
//! time-series payloads.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BatchSummary, FeatureMap, GeoTransform, RasterDataset, SkipKind, SkippedItem, WqpError, WqpResult,
};

pub use crate::core::{
    BasinOrder, Cropper, MosaicMerger, OutlierRejector, PayloadBuilder, PipelineConfig, StatsFormatter,
    WqpPipeline, ZonalStatsEngine,
};
pub use io::{ObservationClient, RasterAccessor, VectorStore};
