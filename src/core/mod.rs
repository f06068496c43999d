//! Core water-quality processing modules

pub mod product;
pub mod geometry;
pub mod crop;
pub mod zonal;
pub mod outliers;
pub mod mosaic;
pub mod format;
pub mod timeseries;
pub mod pipeline;

// Re-export main types
pub use product::ProductMetadata;
pub use geometry::{NamedPolygon, PolygonMask};
pub use crop::{Crop, Cropper};
pub use zonal::{SampleLocation, SamplePoint, StatBlock, Statistic, ZonalStatsEngine, DEFAULT_STATISTICS};
pub use outliers::{
    FeatureRejection, OutlierBounds, OutlierMethod, OutlierRejector, OutlierReport, RejectionOutcome,
    RejectionPolicy,
};
pub use mosaic::{BasinOrder, MosaicMerger};
pub use format::{FlatStatsRecord, StatEntries, StatValue, StatsFormatter};
pub use timeseries::{Lake, LongFormRow, LongFormTable, PayloadBuilder, RowPolicy, StatisticKind, WqpKind};
pub use pipeline::{PipelineConfig, ProductResult, WqpPipeline};
