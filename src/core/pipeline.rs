/*!
 * Per-product processing pipeline
 *
 * One WQP raster goes through crop → zonal statistics → outlier rejection →
 * clean-statistics recomputation → mosaics → CSV export. Per-feature problems
 * never abort the product; they end up in the returned `BatchSummary`.
 */

use crate::core::crop::{Crop, Cropper};
use crate::core::format::StatsFormatter;
use crate::core::geometry::NamedPolygon;
use crate::core::mosaic::{BasinOrder, MosaicMerger};
use crate::core::outliers::{FeatureRejection, OutlierRejector, OutlierReport, RejectionPolicy};
use crate::core::product::ProductMetadata;
use crate::core::timeseries::RowPolicy;
use crate::core::zonal::{Statistic, StatBlock, ZonalStatsEngine, DEFAULT_STATISTICS};
use crate::io::raster::RasterAccessor;
use crate::types::{BatchSummary, FeatureMap, RasterDataset, SkippedItem, WqpResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Zonal statistics to compute
    pub statistics: Vec<String>,
    /// Nodata override for the statistics (raster nodata when absent)
    pub nodata: Option<f64>,
    /// Attribute holding the lake/basin name in the vector file
    pub name_field: String,
    /// IQR, 2Sigma or 3Sigma; absolute limits only when absent
    pub outlier_method: Option<String>,
    pub min_lower: Option<f64>,
    pub max_upper: Option<f64>,
    pub basin_order: BasinOrder,
    pub output_dir: PathBuf,
    /// Clean statistics table, relative to `output_dir`
    pub stats_file: String,
    /// Outlier report table, relative to `output_dir`
    pub outliers_file: String,
    pub row_policy: RowPolicy,
    /// Write clean/outlier mosaics
    pub write_mosaics: bool,
    /// Write every feature's masked crop
    pub write_crops: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            statistics: DEFAULT_STATISTICS.iter().map(|s| s.to_string()).collect(),
            nodata: None,
            name_field: "name".to_string(),
            outlier_method: Some("IQR".to_string()),
            min_lower: None,
            max_upper: None,
            basin_order: BasinOrder::default(),
            output_dir: PathBuf::from("output"),
            stats_file: "wqp_stats.csv".to_string(),
            outliers_file: "wqp_outliers.csv".to_string(),
            row_policy: RowPolicy::default(),
            write_mosaics: true,
            write_crops: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> WqpResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        log::debug!("Loaded pipeline configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.output_dir.join(&self.stats_file)
    }

    pub fn outliers_path(&self) -> PathBuf {
        self.output_dir.join(&self.outliers_file)
    }
}

/// Everything produced for one product
#[derive(Debug, Clone)]
pub struct ProductResult {
    pub metadata: ProductMetadata,
    pub crops: FeatureMap<Crop>,
    /// Statistics of the cropped raster before rejection
    pub raw_stats: FeatureMap<StatBlock>,
    /// Statistics after outlier removal (raw block when a feature was not rejected)
    pub clean_stats: FeatureMap<StatBlock>,
    pub rejections: FeatureMap<FeatureRejection>,
    pub summary: BatchSummary,
}

impl ProductResult {
    pub fn reports(&self) -> FeatureMap<OutlierReport> {
        self.rejections.map(|r| r.report.clone())
    }

    /// One entry per input feature, `None` where no rejection was made
    pub fn report_table(&self) -> FeatureMap<Option<OutlierReport>> {
        self.raw_stats
            .keys()
            .map(|name| (name.to_string(), self.rejections.get(name).map(|r| r.report.clone())))
            .collect()
    }

    pub fn clean_rasters(&self) -> FeatureMap<RasterDataset> {
        self.rejections.map(|r| r.clean.clone())
    }

    pub fn outlier_rasters(&self) -> FeatureMap<RasterDataset> {
        self.rejections.map(|r| r.outliers.clone())
    }
}

/// Drives products through the processing stages
pub struct WqpPipeline {
    config: PipelineConfig,
    requested: Vec<Statistic>,
}

impl WqpPipeline {
    pub fn new(config: PipelineConfig) -> WqpResult<Self> {
        let requested = Statistic::parse_list(&config.statistics)?;
        Ok(Self { config, requested })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process an in-memory raster
    pub fn process_product(
        &self,
        metadata: ProductMetadata,
        raster: &RasterDataset,
        polygons: &[NamedPolygon],
    ) -> WqpResult<ProductResult> {
        log::info!("Processing product {}", metadata.name);
        let mut summary = BatchSummary::default();

        let (crops, skipped) = Cropper::crop_by_features(raster, polygons);
        summary.extend(skipped);

        let raw_stats =
            ZonalStatsEngine::compute_stats(raster, polygons, &self.requested, self.config.nodata)?;

        let policy = RejectionPolicy::parse(
            self.config.outlier_method.as_deref(),
            self.config.min_lower,
            self.config.max_upper,
        );
        let rejections = match policy {
            Ok(policy) => {
                let outcome = OutlierRejector::new(policy).process(&crops, &raw_stats, &raster.crs);
                summary.extend(outcome.skipped);
                outcome.rejections
            }
            Err(e) => {
                // statistics are still exported without rejection
                log::warn!("Outlier rejection disabled: {}", e);
                summary.extend(crops.keys().map(|name| SkippedItem::from_error(name, &e)));
                FeatureMap::new()
            }
        };

        let clean_stats = self.clean_statistics(polygons, &raw_stats, &rejections)?;

        log::info!(
            "Product {}: {} crops, {} rejections, {} skipped item(s)",
            metadata.name,
            crops.len(),
            rejections.len(),
            summary.skipped.len()
        );

        Ok(ProductResult {
            metadata,
            crops,
            raw_stats,
            clean_stats,
            rejections,
            summary,
        })
    }

    fn clean_statistics(
        &self,
        polygons: &[NamedPolygon],
        raw_stats: &FeatureMap<StatBlock>,
        rejections: &FeatureMap<FeatureRejection>,
    ) -> WqpResult<FeatureMap<StatBlock>> {
        let mut clean_stats = FeatureMap::new();
        for (name, raw) in raw_stats.iter() {
            let rejection = rejections.get(name);
            let polygon = polygons.iter().find(|p| p.name == name);
            let block = match (rejection, polygon) {
                (Some(rejection), Some(polygon)) => {
                    let stats = ZonalStatsEngine::compute_stats(
                        &rejection.clean,
                        std::slice::from_ref(polygon),
                        &self.requested,
                        None,
                    )?;
                    stats.get(name).cloned().unwrap_or_else(|| raw.clone())
                }
                _ => raw.clone(),
            };
            clean_stats.insert(name, block);
        }
        Ok(clean_stats)
    }

    /// Append the clean statistics and outlier reports of a product to the CSV tables
    pub fn export_tables(&self, result: &ProductResult) -> WqpResult<()> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let stats = StatsFormatter::flatten(&result.metadata, &result.clean_stats);
        StatsFormatter::append_stats_file(&[stats], self.config.stats_path())?;

        if !result.rejections.is_empty() {
            let outliers = StatsFormatter::flatten(&result.metadata, &result.report_table());
            StatsFormatter::append_stats_file(&[outliers], self.config.outliers_path())?;
        }
        Ok(())
    }

    /// Write `<product>_clean.tif` and `<product>_outliers.tif` mosaics
    pub fn export_mosaics(&self, result: &ProductResult) -> WqpResult<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let name = &result.metadata.name;
        let mut written = Vec::new();

        let layers = [("clean", result.clean_rasters()), ("outliers", result.outlier_rasters())];
        for (suffix, rasters) in layers {
            let path = self.config.output_dir.join(format!("{}_{}.tif", name, suffix));
            if let Some(path) = MosaicMerger::merge_and_export(&rasters, &self.config.basin_order, path)? {
                written.push(path);
            }
        }
        Ok(written)
    }

    /// Write every feature's masked crop as `<product>_<feature>.tif`
    pub fn export_crops(&self, result: &ProductResult, crs: &str) -> WqpResult<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let mut written = Vec::new();
        for (feature, crop) in result.crops.iter() {
            let path = self
                .config
                .output_dir
                .join(format!("{}_{}.tif", result.metadata.name, feature));
            RasterAccessor::write_dataset(&crop.to_dataset(1, crs)?, &path)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Open, process and export one WQP file
    pub fn run_file<P: AsRef<Path>>(&self, path: P, polygons: &[NamedPolygon]) -> WqpResult<ProductResult> {
        let metadata = ProductMetadata::from_path(path.as_ref())?;
        let raster = RasterAccessor::open(path.as_ref())?;
        let result = self.process_product(metadata, &raster, polygons)?;

        self.export_tables(&result)?;
        if self.config.write_mosaics {
            self.export_mosaics(&result)?;
        }
        if self.config.write_crops {
            self.export_crops(&result, &raster.crs)?;
        }
        Ok(result)
    }

    /// Run every file; a failing file is recorded in the summary and the batch continues
    pub fn run_batch<P: AsRef<Path>>(
        &self,
        paths: &[P],
        polygons: &[NamedPolygon],
    ) -> (Vec<ProductResult>, BatchSummary) {
        let mut results = Vec::new();
        let mut summary = BatchSummary::default();

        for path in paths {
            match self.run_file(path, polygons) {
                Ok(result) => {
                    summary.extend(result.summary.skipped.iter().cloned());
                    results.push(result);
                }
                Err(e) => {
                    log::error!("Failed to process {}: {}", path.as_ref().display(), e);
                    summary.push(SkippedItem::from_error(path.as_ref().display().to_string(), &e));
                }
            }
        }

        log::info!(
            "Batch completed: {} product(s) processed, {} skipped item(s)",
            results.len(),
            summary.skipped.len()
        );
        (results, summary)
    }
}
