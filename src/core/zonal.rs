//! Zonal statistics over lake polygons
//!
//! For every polygon the pixels of band 1 whose centre lies inside the
//! polygon are collected; NaN and nodata pixels are excluded. Percentiles use
//! linear interpolation between the closest ranks and `std` is the
//! population standard deviation.

use crate::core::format::{StatEntries, StatValue};
use crate::core::geometry::{NamedPolygon, PolygonMask};
use crate::io::raster::RasterAccessor;
use crate::io::vector::VectorStore;
use crate::types::{FeatureMap, RasterDataset, SkippedItem, WqpError, WqpResult};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;

/// Statistic that can be requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Statistic {
    Count,
    Min,
    Max,
    Mean,
    Sum,
    Std,
    Median,
    Majority,
    Minority,
    Unique,
    Range,
    Nodata,
    Nan,
    /// Percentile in [0, 100], written `percentile_<q>`
    Percentile(f64),
}

/// Statistics computed when none are requested explicitly
pub const DEFAULT_STATISTICS: &[&str] = &[
    "count",
    "min",
    "max",
    "mean",
    "std",
    "median",
    "percentile_25",
    "percentile_75",
];

impl Statistic {
    /// Output order of the non-percentile statistics
    const ORDER: [Statistic; 13] = [
        Statistic::Min,
        Statistic::Max,
        Statistic::Mean,
        Statistic::Count,
        Statistic::Sum,
        Statistic::Std,
        Statistic::Median,
        Statistic::Majority,
        Statistic::Minority,
        Statistic::Unique,
        Statistic::Range,
        Statistic::Nodata,
        Statistic::Nan,
    ];

    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> WqpResult<Vec<Statistic>> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }

    pub fn name(&self) -> String {
        match self {
            Statistic::Count => "count".to_string(),
            Statistic::Min => "min".to_string(),
            Statistic::Max => "max".to_string(),
            Statistic::Mean => "mean".to_string(),
            Statistic::Sum => "sum".to_string(),
            Statistic::Std => "std".to_string(),
            Statistic::Median => "median".to_string(),
            Statistic::Majority => "majority".to_string(),
            Statistic::Minority => "minority".to_string(),
            Statistic::Unique => "unique".to_string(),
            Statistic::Range => "range".to_string(),
            Statistic::Nodata => "nodata".to_string(),
            Statistic::Nan => "nan".to_string(),
            Statistic::Percentile(q) => format!("percentile_{}", q),
        }
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Statistic {
    type Err = WqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stat = match s {
            "count" => Statistic::Count,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "mean" => Statistic::Mean,
            "sum" => Statistic::Sum,
            "std" => Statistic::Std,
            "median" => Statistic::Median,
            "majority" => Statistic::Majority,
            "minority" => Statistic::Minority,
            "unique" => Statistic::Unique,
            "range" => Statistic::Range,
            "nodata" => Statistic::Nodata,
            "nan" => Statistic::Nan,
            other => {
                let q = other
                    .strip_prefix("percentile_")
                    .and_then(|q| q.parse::<f64>().ok())
                    .ok_or_else(|| WqpError::InvalidStatistic(other.to_string()))?;
                if !(0.0..=100.0).contains(&q) {
                    return Err(WqpError::InvalidStatistic(other.to_string()));
                }
                Statistic::Percentile(q)
            }
        };
        Ok(stat)
    }
}

/// Descriptive statistics of one feature.
///
/// Every value is `None` when the feature has no valid pixel, except the
/// pixel counts (`count`, `nodata`, `nan`) which are then zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatBlock {
    pub count: Option<u64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub sum: Option<f64>,
    pub std: Option<f64>,
    pub median: Option<f64>,
    pub majority: Option<f64>,
    pub minority: Option<f64>,
    pub unique: Option<u64>,
    pub range: Option<f64>,
    pub nodata: Option<u64>,
    pub nan: Option<u64>,
    /// (q, value) pairs in request order
    pub percentiles: Vec<(f64, Option<f64>)>,
    #[serde(skip)]
    requested: Vec<Statistic>,
    #[serde(skip)]
    valid_pixels: usize,
}

impl StatBlock {
    /// Compute the requested statistics from the valid pixel values
    pub fn from_values(
        mut values: Vec<f64>,
        nodata_count: u64,
        nan_count: u64,
        requested: &[Statistic],
    ) -> Self {
        let mut block = StatBlock {
            requested: requested.to_vec(),
            valid_pixels: values.len(),
            ..Default::default()
        };
        let wants = |s: Statistic| requested.contains(&s);

        if wants(Statistic::Count) {
            block.count = Some(values.len() as u64);
        }
        if wants(Statistic::Nodata) {
            block.nodata = Some(nodata_count);
        }
        if wants(Statistic::Nan) {
            block.nan = Some(nan_count);
        }

        for stat in requested {
            if let Statistic::Percentile(q) = stat {
                block.percentiles.push((*q, None));
            }
        }

        if values.is_empty() {
            return block;
        }

        values.sort_by(|a, b| a.total_cmp(b));
        let n = values.len() as f64;
        let sum: f64 = values.iter().sum();
        let mean = sum / n;
        let min = values[0];
        let max = values[values.len() - 1];

        if wants(Statistic::Min) {
            block.min = Some(min);
        }
        if wants(Statistic::Max) {
            block.max = Some(max);
        }
        if wants(Statistic::Mean) {
            block.mean = Some(mean);
        }
        if wants(Statistic::Sum) {
            block.sum = Some(sum);
        }
        if wants(Statistic::Std) {
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            block.std = Some(var.sqrt());
        }
        if wants(Statistic::Median) {
            block.median = Some(percentile_sorted(&values, 50.0));
        }
        if wants(Statistic::Range) {
            block.range = Some(max - min);
        }

        if wants(Statistic::Majority) || wants(Statistic::Minority) || wants(Statistic::Unique) {
            let counts = value_counts(&values);
            if wants(Statistic::Unique) {
                block.unique = Some(counts.len() as u64);
            }
            // ties resolve to the smallest value
            if wants(Statistic::Majority) {
                let best = counts.iter().fold(None::<(f64, u64)>, |acc, &(v, c)| match acc {
                    Some((_, bc)) if bc >= c => acc,
                    _ => Some((v, c)),
                });
                block.majority = best.map(|(v, _)| v);
            }
            if wants(Statistic::Minority) {
                let best = counts.iter().fold(None::<(f64, u64)>, |acc, &(v, c)| match acc {
                    Some((_, bc)) if bc <= c => acc,
                    _ => Some((v, c)),
                });
                block.minority = best.map(|(v, _)| v);
            }
        }

        for (q, value) in block.percentiles.iter_mut() {
            *value = Some(percentile_sorted(&values, *q));
        }

        block
    }

    /// Value of `percentile_<q>` if it was requested and defined
    pub fn percentile(&self, q: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|(p, _)| (*p - q).abs() < 1e-9)
            .and_then(|(_, v)| *v)
    }

    /// True when the feature had at least one valid pixel
    pub fn has_data(&self) -> bool {
        self.count.map_or(false, |c| c > 0)
            || self.min.is_some()
            || self.mean.is_some()
            || self.median.is_some()
            || self.percentiles.iter().any(|(_, v)| v.is_some())
    }
}

impl StatBlock {
    fn entry(&self, stat: Statistic) -> (String, StatValue) {
        let value = match stat {
            Statistic::Count => StatValue::from(self.count),
            Statistic::Min => StatValue::from(self.min),
            Statistic::Max => StatValue::from(self.max),
            Statistic::Mean => StatValue::from(self.mean),
            Statistic::Sum => StatValue::from(self.sum),
            Statistic::Std => StatValue::from(self.std),
            Statistic::Median => StatValue::from(self.median),
            Statistic::Majority => StatValue::from(self.majority),
            Statistic::Minority => StatValue::from(self.minority),
            Statistic::Unique => StatValue::from(self.unique),
            Statistic::Range => StatValue::from(self.range),
            Statistic::Nodata => StatValue::from(self.nodata),
            Statistic::Nan => StatValue::from(self.nan),
            Statistic::Percentile(q) => StatValue::from(self.percentile(q)),
        };
        (stat.name(), value)
    }
}

impl StatEntries for StatBlock {
    /// Fixed order (percentiles between `range` and `nodata`) for features with
    /// valid pixels; request order for empty features
    fn entries(&self) -> Vec<(String, StatValue)> {
        if self.valid_pixels == 0 {
            return self.requested.iter().map(|&stat| self.entry(stat)).collect();
        }

        let mut out = Vec::new();
        for stat in Statistic::ORDER {
            if stat == Statistic::Nodata {
                out.extend(self.percentiles.iter().map(|(q, _)| self.entry(Statistic::Percentile(*q))));
            }
            if self.requested.contains(&stat) {
                out.push(self.entry(stat));
            }
        }
        out
    }
}

/// Percentile of an ascending, non-empty slice with linear interpolation
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// (value, occurrences) of an ascending slice, ascending by value
fn value_counts(sorted: &[f64]) -> Vec<(f64, u64)> {
    let mut counts: Vec<(f64, u64)> = Vec::new();
    for &v in sorted {
        match counts.last_mut() {
            Some((last, n)) if *last == v => *n += 1,
            _ => counts.push((v, 1)),
        }
    }
    counts
}

/// A location to sample from a raster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleLocation {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// Pixel value read at a sample location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePoint {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub row: usize,
    pub col: usize,
    pub value: f32,
}

/// Zonal statistics and point sampling
pub struct ZonalStatsEngine;

impl ZonalStatsEngine {
    /// Statistics of band 1 for every polygon.
    ///
    /// `nodata` overrides the raster's own nodata value when given.
    pub fn compute_stats(
        raster: &RasterDataset,
        polygons: &[NamedPolygon],
        requested: &[Statistic],
        nodata: Option<f64>,
    ) -> WqpResult<FeatureMap<StatBlock>> {
        log::info!(
            "Computing {} statistics for {} features",
            requested.len(),
            polygons.len()
        );

        let band = raster.band(1)?;
        let nodata = nodata.or(raster.nodata).filter(|nd| !nd.is_nan());
        let mut results = FeatureMap::new();

        for polygon in polygons {
            let mut values = Vec::new();
            let mut nodata_count = 0u64;
            let mut nan_count = 0u64;

            if let Some(mask) =
                PolygonMask::build(polygon, &raster.transform, raster.width(), raster.height())
            {
                for ((r, c), &inside) in mask.inside.indexed_iter() {
                    if !inside {
                        continue;
                    }
                    let value = band[[mask.row_off + r, mask.col_off + c]];
                    if value.is_nan() {
                        nan_count += 1;
                    } else if nodata.map_or(false, |nd| value as f64 == nd) {
                        nodata_count += 1;
                    } else if value.is_finite() {
                        values.push(value as f64);
                    }
                }
            } else {
                log::debug!("Feature {} does not overlap the raster", polygon.name);
            }

            if values.is_empty() {
                log::warn!("No valid pixels for feature {}", polygon.name);
            }

            let block = StatBlock::from_values(values, nodata_count, nan_count, requested);
            results.insert(polygon.name.clone(), block);
        }

        Ok(results)
    }

    /// Statistics of band 1 of the raster at `raster_path` for every polygon of
    /// the vector file, features named by `name_field`
    pub fn compute_stats_from_paths<V: AsRef<Path>, R: AsRef<Path>>(
        vector_path: V,
        name_field: &str,
        raster_path: R,
        requested: &[Statistic],
        nodata: Option<f64>,
    ) -> WqpResult<FeatureMap<StatBlock>> {
        let polygons = VectorStore::load_polygons(vector_path, name_field)?;
        let raster = RasterAccessor::open(raster_path)?;
        Self::compute_stats(&raster, &polygons, requested, nodata)
    }

    /// Read band 1 at each location; locations outside the raster are dropped
    pub fn extract_sample_points(
        raster: &RasterDataset,
        locations: &[SampleLocation],
    ) -> WqpResult<(Vec<SamplePoint>, Vec<SkippedItem>)> {
        let band = raster.band(1)?;
        let (height, width) = band.dim();
        let mut points = Vec::new();
        let mut skipped = Vec::new();

        for loc in locations {
            let (row, col) = raster.transform.index(loc.x, loc.y);
            if row < 0 || col < 0 || row >= height as i64 || col >= width as i64 {
                let err = WqpError::OutOfBoundsPoint {
                    id: loc.id.clone(),
                    row,
                    col,
                };
                log::warn!("{} , {} coordinates are out of the image", loc.x, loc.y);
                skipped.push(SkippedItem::from_error(loc.id.clone(), &err));
                continue;
            }

            let (row, col) = (row as usize, col as usize);
            points.push(SamplePoint {
                id: loc.id.clone(),
                x: loc.x,
                y: loc.y,
                row,
                col,
                value: band[[row, col]],
            });
        }

        log::info!(
            "Extracted {} sample points ({} outside the raster)",
            points.len(),
            skipped.len()
        );
        Ok((points, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::tests::square;
    use crate::types::{DataType, GeoTransform, SkipKind};
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn stats(names: &[&str]) -> Vec<Statistic> {
        Statistic::parse_list(names).unwrap()
    }

    #[test]
    fn test_parse_statistics() {
        assert_eq!("percentile_25".parse::<Statistic>().unwrap(), Statistic::Percentile(25.0));
        assert_eq!(Statistic::Percentile(25.0).name(), "percentile_25");
        assert_eq!(Statistic::Percentile(2.5).name(), "percentile_2.5");
        assert!("percentile_x".parse::<Statistic>().is_err());
        assert!("percentile_101".parse::<Statistic>().is_err());
        assert!("variance".parse::<Statistic>().is_err());
    }

    #[test]
    fn test_stat_block_values() {
        let block = StatBlock::from_values(
            vec![5.0, 1.0, 3.0, 2.0, 4.0, 100.0],
            0,
            0,
            &stats(&["count", "min", "max", "mean", "std", "median", "range", "percentile_25", "percentile_75"]),
        );

        assert_eq!(block.count, Some(6));
        assert_eq!(block.min, Some(1.0));
        assert_eq!(block.max, Some(100.0));
        assert_relative_eq!(block.mean.unwrap(), 115.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(block.std.unwrap(), 36.1728, epsilon = 1e-3);
        assert_relative_eq!(block.median.unwrap(), 3.5);
        assert_eq!(block.range, Some(99.0));
        assert_relative_eq!(block.percentile(25.0).unwrap(), 2.25);
        assert_relative_eq!(block.percentile(75.0).unwrap(), 4.75);
        assert!(block.sum.is_none());
    }

    #[test]
    fn test_majority_minority_unique() {
        let block = StatBlock::from_values(
            vec![2.0, 2.0, 3.0, 7.0, 7.0, 9.0],
            0,
            0,
            &stats(&["majority", "minority", "unique"]),
        );
        assert_eq!(block.majority, Some(2.0));
        assert_eq!(block.minority, Some(3.0));
        assert_eq!(block.unique, Some(4));
    }

    #[test]
    fn test_empty_block() {
        let block = StatBlock::from_values(vec![], 3, 1, &stats(&["count", "min", "mean", "nodata", "nan", "percentile_75"]));
        assert_eq!(block.count, Some(0));
        assert_eq!(block.nodata, Some(3));
        assert_eq!(block.nan, Some(1));
        assert!(block.min.is_none());
        assert!(!block.has_data());
        assert_eq!(block.percentiles, vec![(75.0, None)]);
    }

    #[test]
    fn test_entries_order() {
        let block = StatBlock::from_values(vec![1.0], 0, 0, &stats(&["percentile_75", "count", "min"]));
        let names: Vec<String> = block.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["min", "count", "percentile_75"]);
    }

    #[test]
    fn test_percentiles_precede_pixel_counts() {
        let requested = stats(&["nan", "percentile_25", "nodata", "range", "count"]);
        let block = StatBlock::from_values(vec![1.0, 2.0, 3.0], 1, 0, &requested);
        let names: Vec<String> = block.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["count", "range", "percentile_25", "nodata", "nan"]);

        // an empty feature keeps the requested order
        let empty = StatBlock::from_values(vec![], 1, 0, &requested);
        let names: Vec<String> = empty.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["nan", "percentile_25", "nodata", "range", "count"]);
        assert_eq!(empty.entries()[1].1, StatValue::Null);
    }

    fn test_raster() -> RasterDataset {
        let mut data = Array3::from_shape_fn((1, 4, 4), |(_, r, c)| (r * 4 + c + 1) as f32);
        data[[0, 0, 0]] = -1.0;
        data[[0, 0, 1]] = f32::NAN;
        RasterDataset::new(
            data,
            GeoTransform::new(0.0, 4.0, 1.0, -1.0),
            "EPSG:4326",
            Some(-1.0),
            DataType::Float32,
        )
        .unwrap()
    }

    #[test]
    fn test_compute_stats_per_feature() {
        let raster = test_raster();
        let polygons = vec![
            square("top", 0.0, 2.0, 4.0, 4.0),
            square("nowhere", 10.0, 10.0, 12.0, 12.0),
        ];

        let result = ZonalStatsEngine::compute_stats(
            &raster,
            &polygons,
            &stats(&["count", "min", "max", "nodata", "nan"]),
            None,
        )
        .unwrap();

        let top = result.get("top").unwrap();
        // rows 0-1: values 1..8 minus nodata (1 -> -1) and NaN (2)
        assert_eq!(top.count, Some(6));
        assert_eq!(top.min, Some(3.0));
        assert_eq!(top.max, Some(8.0));
        assert_eq!(top.nodata, Some(1));
        assert_eq!(top.nan, Some(1));

        let nowhere = result.get("nowhere").unwrap();
        assert_eq!(nowhere.count, Some(0));
        assert!(nowhere.min.is_none());
    }

    #[test]
    fn test_nodata_override() {
        let raster = test_raster();
        let result = ZonalStatsEngine::compute_stats(
            &raster,
            &[square("all", 0.0, 0.0, 4.0, 4.0)],
            &stats(&["count", "min"]),
            Some(16.0),
        )
        .unwrap();
        let all = result.get("all").unwrap();
        // -1 becomes a valid value once the override replaces the raster nodata
        assert_eq!(all.count, Some(14));
        assert_eq!(all.min, Some(-1.0));
    }

    #[test]
    fn test_extract_sample_points() {
        let raster = test_raster();
        let locations = vec![
            SampleLocation { id: "p1".into(), x: 2.5, y: 1.5 },
            SampleLocation { id: "p2".into(), x: -3.0, y: 1.0 },
            SampleLocation { id: "p3".into(), x: 0.5, y: 3.5 },
        ];

        let (points, skipped) = ZonalStatsEngine::extract_sample_points(&raster, &locations).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!((points[0].row, points[0].col), (2, 2));
        assert_eq!(points[0].value, 11.0);
        assert_eq!(points[1].value, -1.0);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].kind, SkipKind::OutOfBoundsPoint);
        assert_eq!(skipped[0].item, "p2");
    }
}
