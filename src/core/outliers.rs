/*!
 * Outlier rejection on per-lake crops
 *
 * For every feature with statistics, lower/upper bounds are derived with one
 * of the rejection methods (IQR, 2-sigma, 3-sigma) or taken from caller
 * supplied limits, then the crop is split into:
 * - a clean raster: pixels at or outside the bounds removed,
 * - an outlier raster: zero pixels and pixels strictly inside the bounds removed.
 *
 * Features are processed independently; with the `parallel` feature they are
 * distributed over the rayon pool and reassembled in feature order.
 */

use crate::core::crop::Crop;
use crate::core::format::{StatEntries, StatValue};
use crate::core::zonal::StatBlock;
use crate::types::{FeatureMap, RasterDataset, SkippedItem, WqpError, WqpImage, WqpResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Statistical rule used to derive the bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutlierMethod {
    /// P25 - 1.5 IQR, P75 + 1.5 IQR
    Iqr,
    /// mean ± 2 std
    TwoSigma,
    /// mean ± 3 std
    ThreeSigma,
}

impl OutlierMethod {
    pub fn name(&self) -> &'static str {
        match self {
            OutlierMethod::Iqr => "IQR",
            OutlierMethod::TwoSigma => "2Sigma",
            OutlierMethod::ThreeSigma => "3Sigma",
        }
    }

    /// Bounds from a feature's statistics
    pub fn bounds(&self, feature: &str, stats: &StatBlock) -> WqpResult<OutlierBounds> {
        let missing = |what: &str| WqpError::MissingStatistics {
            feature: feature.to_string(),
            detail: format!("{} requires {}", self.name(), what),
        };

        let bounds = match self {
            OutlierMethod::Iqr => {
                let p25 = stats.percentile(25.0).ok_or_else(|| missing("percentile_25"))?;
                let p75 = stats.percentile(75.0).ok_or_else(|| missing("percentile_75"))?;
                let iqr = p75 - p25;
                OutlierBounds {
                    lower: p25 - 1.5 * iqr,
                    upper: p75 + 1.5 * iqr,
                }
            }
            OutlierMethod::TwoSigma | OutlierMethod::ThreeSigma => {
                let k = if *self == OutlierMethod::TwoSigma { 2.0 } else { 3.0 };
                let mean = stats.mean.ok_or_else(|| missing("mean"))?;
                let std = stats.std.ok_or_else(|| missing("std"))?;
                OutlierBounds {
                    lower: mean - k * std,
                    upper: mean + k * std,
                }
            }
        };
        Ok(bounds)
    }
}

impl std::fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for OutlierMethod {
    type Err = WqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "IQR" => Ok(OutlierMethod::Iqr),
            "2SIGMA" => Ok(OutlierMethod::TwoSigma),
            "3SIGMA" => Ok(OutlierMethod::ThreeSigma),
            _ => Err(WqpError::InvalidOutlierMethod(s.to_string())),
        }
    }
}

/// Exclusive bounds of the valid range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierBounds {
    pub lower: f64,
    pub upper: f64,
}

impl OutlierBounds {
    /// Raise `lower` to `min_lower` and lower `upper` to `max_upper` where they are more extreme
    pub fn clamped(self, min_lower: Option<f64>, max_upper: Option<f64>) -> Self {
        let mut bounds = self;
        if let Some(floor) = min_lower {
            if bounds.lower < floor {
                bounds.lower = floor;
            }
        }
        if let Some(ceiling) = max_upper {
            if bounds.upper > ceiling {
                bounds.upper = ceiling;
            }
        }
        bounds
    }
}

/// Method plus optional absolute limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RejectionPolicy {
    pub method: Option<OutlierMethod>,
    pub min_lower: Option<f64>,
    pub max_upper: Option<f64>,
}

impl RejectionPolicy {
    /// Without a method both limits are required and become the bounds
    pub fn new(
        method: Option<OutlierMethod>,
        min_lower: Option<f64>,
        max_upper: Option<f64>,
    ) -> WqpResult<Self> {
        if method.is_none() && (min_lower.is_none() || max_upper.is_none()) {
            return Err(WqpError::InvalidPolicy(
                "min_lower and max_upper are required when no method is selected".to_string(),
            ));
        }
        Ok(Self {
            method,
            min_lower,
            max_upper,
        })
    }

    /// Build from a method name as found in configuration
    pub fn parse(method: Option<&str>, min_lower: Option<f64>, max_upper: Option<f64>) -> WqpResult<Self> {
        let method = method.map(OutlierMethod::from_str).transpose()?;
        Self::new(method, min_lower, max_upper)
    }

    pub fn bounds(&self, feature: &str, stats: &StatBlock) -> WqpResult<OutlierBounds> {
        let bounds = match (self.method, self.min_lower, self.max_upper) {
            (Some(method), _, _) => method.bounds(feature, stats)?,
            (None, Some(lower), Some(upper)) => OutlierBounds { lower, upper },
            _ => {
                return Err(WqpError::InvalidPolicy(
                    "min_lower and max_upper are required when no method is selected".to_string(),
                ))
            }
        };
        Ok(bounds.clamped(self.min_lower, self.max_upper))
    }
}

/// Accounting of one feature's rejection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierReport {
    pub method: Option<OutlierMethod>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub count_lower: usize,
    pub count_upper: usize,
    pub count_valid: usize,
    pub count_total: usize,
    pub perc_valid: f64,
    pub perc_outliers: f64,
}

/// Column names of an outlier report, in output order
pub const REPORT_COLUMNS: [&str; 9] = [
    "Method",
    "lowerBound",
    "upperBound",
    "countLower",
    "countUpper",
    "countValid",
    "countTotal",
    "percValid",
    "percOutliers",
];

impl StatEntries for OutlierReport {
    fn entries(&self) -> Vec<(String, StatValue)> {
        let method = self
            .method
            .map_or(StatValue::Null, |m| StatValue::Text(m.name().to_string()));
        let values = [
            method,
            StatValue::from(self.lower_bound),
            StatValue::from(self.upper_bound),
            StatValue::from(self.count_lower),
            StatValue::from(self.count_upper),
            StatValue::from(self.count_valid),
            StatValue::from(self.count_total),
            StatValue::from(self.perc_valid),
            StatValue::from(self.perc_outliers),
        ];
        REPORT_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .zip(values)
            .collect()
    }
}

/// Features without a rejection keep their columns, with empty cells
impl StatEntries for Option<OutlierReport> {
    fn entries(&self) -> Vec<(String, StatValue)> {
        match self {
            Some(report) => report.entries(),
            None => REPORT_COLUMNS
                .iter()
                .map(|c| (c.to_string(), StatValue::Null))
                .collect(),
        }
    }
}

/// Clean and outlier layers of one feature plus their accounting
#[derive(Debug, Clone)]
pub struct FeatureRejection {
    pub report: OutlierReport,
    pub clean: RasterDataset,
    pub outliers: RasterDataset,
}

/// Result of a rejection run over all features
#[derive(Debug, Clone, Default)]
pub struct RejectionOutcome {
    pub rejections: FeatureMap<FeatureRejection>,
    pub skipped: Vec<SkippedItem>,
}

impl RejectionOutcome {
    pub fn reports(&self) -> FeatureMap<OutlierReport> {
        self.rejections.map(|r| r.report.clone())
    }

    pub fn clean_rasters(&self) -> FeatureMap<RasterDataset> {
        self.rejections.map(|r| r.clean.clone())
    }

    pub fn outlier_rasters(&self) -> FeatureMap<RasterDataset> {
        self.rejections.map(|r| r.outliers.clone())
    }
}

/// Pixels at or outside the bounds become NaN
pub fn clean_layer(pixels: &WqpImage, bounds: &OutlierBounds) -> WqpImage {
    pixels.mapv(|v| {
        let x = v as f64;
        if x <= bounds.lower || x >= bounds.upper {
            f32::NAN
        } else {
            v
        }
    })
}

/// Zero pixels and pixels strictly inside the bounds become NaN
pub fn outlier_layer(pixels: &WqpImage, bounds: &OutlierBounds) -> WqpImage {
    pixels.mapv(|v| {
        let x = v as f64;
        if v == 0.0 || (x > bounds.lower && x < bounds.upper) {
            f32::NAN
        } else {
            v
        }
    })
}

fn count_present(pixels: &WqpImage) -> usize {
    pixels.iter().filter(|v| !v.is_nan()).count()
}

/// Reject outliers of a single feature.
///
/// Fails with `MissingStatistics` when the feature has no valid pixel or the
/// method's statistics are absent.
pub fn reject_feature(
    feature: &str,
    crop: &Crop,
    stats: &StatBlock,
    policy: &RejectionPolicy,
    crs: &str,
) -> WqpResult<FeatureRejection> {
    if !stats.has_data() {
        return Err(WqpError::MissingStatistics {
            feature: feature.to_string(),
            detail: "no valid pixels".to_string(),
        });
    }

    let bounds = policy.bounds(feature, stats)?;
    let pixels = crop.band(1)?;

    let clean = clean_layer(&pixels, &bounds);
    let outliers = outlier_layer(&pixels, &bounds);

    let count_total = count_present(&pixels);
    let count_valid = count_present(&clean);
    let count_lower = outliers.iter().filter(|&&v| (v as f64) < bounds.lower).count();
    let count_upper = outliers.iter().filter(|&&v| (v as f64) > bounds.upper).count();

    let (perc_valid, perc_outliers) = if count_valid > 0 {
        let perc_valid = count_valid as f64 / count_total as f64;
        (perc_valid, 1.0 - perc_valid)
    } else {
        (0.0, 0.0)
    };

    log::debug!(
        "{}: bounds ({:.4}, {:.4}), valid {}/{}, lower {}, upper {}",
        feature,
        bounds.lower,
        bounds.upper,
        count_valid,
        count_total,
        count_lower,
        count_upper
    );

    Ok(FeatureRejection {
        report: OutlierReport {
            method: policy.method,
            lower_bound: bounds.lower,
            upper_bound: bounds.upper,
            count_lower,
            count_upper,
            count_valid,
            count_total,
            perc_valid,
            perc_outliers,
        },
        clean: RasterDataset::from_band(clean, crop.transform, crs)?,
        outliers: RasterDataset::from_band(outliers, crop.transform, crs)?,
    })
}

/// Runs outlier rejection over every cropped feature
pub struct OutlierRejector {
    policy: RejectionPolicy,
}

impl OutlierRejector {
    pub fn new(policy: RejectionPolicy) -> Self {
        Self { policy }
    }

    /// Reject outliers for each crop that has statistics; failures are reported per feature
    pub fn process(
        &self,
        crops: &FeatureMap<Crop>,
        stats: &FeatureMap<StatBlock>,
        crs: &str,
    ) -> RejectionOutcome {
        log::info!(
            "Rejecting outliers for {} features (method: {})",
            crops.len(),
            self.policy.method.map_or("limits".to_string(), |m| m.to_string())
        );

        let jobs: Vec<(&str, &Crop)> = crops.iter().collect();
        let results = self.run_jobs(&jobs, stats, crs);

        let mut outcome = RejectionOutcome::default();
        for (name, result) in results {
            match result {
                Ok(rejection) => outcome.rejections.insert(name, rejection),
                Err(e) => {
                    log::warn!("{}", e);
                    outcome.skipped.push(SkippedItem::from_error(name, &e));
                }
            }
        }

        log::info!(
            "Outlier rejection completed: {} processed, {} skipped",
            outcome.rejections.len(),
            outcome.skipped.len()
        );
        outcome
    }

    fn run_one(&self, name: &str, crop: &Crop, stats: &FeatureMap<StatBlock>, crs: &str) -> WqpResult<FeatureRejection> {
        let block = stats.get(name).ok_or_else(|| WqpError::MissingStatistics {
            feature: name.to_string(),
            detail: "no statistics computed".to_string(),
        })?;
        reject_feature(name, crop, block, &self.policy, crs)
    }

    #[cfg(feature = "parallel")]
    fn run_jobs(
        &self,
        jobs: &[(&str, &Crop)],
        stats: &FeatureMap<StatBlock>,
        crs: &str,
    ) -> Vec<(String, WqpResult<FeatureRejection>)> {
        use rayon::prelude::*;

        jobs.par_iter()
            .map(|(name, crop)| (name.to_string(), self.run_one(name, crop, stats, crs)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn run_jobs(
        &self,
        jobs: &[(&str, &Crop)],
        stats: &FeatureMap<StatBlock>,
        crs: &str,
    ) -> Vec<(String, WqpResult<FeatureRejection>)> {
        jobs.iter()
            .map(|(name, crop)| (name.to_string(), self.run_one(name, crop, stats, crs)))
            .collect()
    }
}
