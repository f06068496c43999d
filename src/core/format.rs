//! Flattening of per-feature statistics into tabular records and CSV I/O

use crate::core::product::ProductMetadata;
use crate::core::timeseries::{LongFormRow, LongFormTable};
use crate::types::{FeatureMap, WqpError, WqpResult};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

/// Metadata columns, always first and in this order
pub const METADATA_COLUMNS: [&str; 6] = ["name", "path", "sensor", "typology", "crs", "date"];

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One cell of a flattened statistics record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Null,
    Integer(u64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for StatValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatValue::Null => Ok(()),
            StatValue::Integer(v) => write!(f, "{}", v),
            StatValue::Float(v) if v.is_nan() => Ok(()),
            StatValue::Float(v) => write!(f, "{}", v),
            StatValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<Option<f64>> for StatValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(StatValue::Null, StatValue::Float)
    }
}

impl From<Option<u64>> for StatValue {
    fn from(value: Option<u64>) -> Self {
        value.map_or(StatValue::Null, StatValue::Integer)
    }
}

impl From<f64> for StatValue {
    fn from(value: f64) -> Self {
        StatValue::Float(value)
    }
}

impl From<usize> for StatValue {
    fn from(value: usize) -> Self {
        StatValue::Integer(value as u64)
    }
}

/// Per-feature result that can be flattened into `<statistic>_<feature>` columns
pub trait StatEntries {
    /// (statistic name, value) pairs in output order
    fn entries(&self) -> Vec<(String, StatValue)>;
}

/// One row of the exported statistics table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatStatsRecord {
    pub metadata: ProductMetadata,
    /// `<statistic>_<feature>` columns in encounter order
    pub stats: Vec<(String, StatValue)>,
}

impl FlatStatsRecord {
    pub fn columns(&self) -> Vec<String> {
        METADATA_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.stats.iter().map(|(k, _)| k.clone()))
            .collect()
    }

    /// Cell values as written to CSV, aligned with `columns()`
    pub fn values(&self) -> Vec<String> {
        let meta = &self.metadata;
        let mut row = vec![
            meta.name.clone(),
            meta.path.clone(),
            meta.sensor.clone(),
            meta.typology.clone(),
            meta.crs.clone(),
            meta.date.format(DATE_FORMAT).to_string(),
        ];
        row.extend(self.stats.iter().map(|(_, v)| v.to_string()));
        row
    }

    pub fn get(&self, column: &str) -> Option<&StatValue> {
        self.stats.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }
}

/// Builds flat records from per-feature statistics
pub struct StatsFormatter;

impl StatsFormatter {
    /// Flatten `{feature: {stat: value}}` into `{stat_feature: value}` tagged with metadata.
    ///
    /// Works for zonal statistic blocks and outlier reports alike.
    pub fn flatten<T: StatEntries>(
        metadata: &ProductMetadata,
        stats_by_feature: &FeatureMap<T>,
    ) -> FlatStatsRecord {
        let mut stats = Vec::new();
        for (feature, block) in stats_by_feature.iter() {
            for (stat, value) in block.entries() {
                stats.push((format!("{}_{}", stat, feature), value));
            }
        }

        log::debug!("Flattened {} columns for {}", stats.len(), metadata.name);
        FlatStatsRecord {
            metadata: metadata.clone(),
            stats,
        }
    }

    /// Append records to a CSV file; the header is written only when the file is new
    pub fn append_stats_file<P: AsRef<Path>>(records: &[FlatStatsRecord], path: P) -> WqpResult<()> {
        let path = path.as_ref();
        let Some(first) = records.first() else {
            return Ok(());
        };

        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);

        if !exists {
            writer.write_record(first.columns())?;
        }
        for record in records {
            writer.write_record(record.values())?;
        }
        writer.flush()?;

        log::info!(
            "{} {} record(s) to {}",
            if exists { "Appended" } else { "Wrote" },
            records.len(),
            path.display()
        );
        Ok(())
    }

    /// Read an exported statistics CSV back as a long-form table
    pub fn read_stats_table<P: AsRef<Path>>(path: P) -> WqpResult<LongFormTable> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path.as_ref())?;
        let headers = reader.headers()?.clone();

        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| WqpError::InvalidFormat(format!("Missing column '{}'", name)))
        };
        let date_idx = column("date")?;
        let typology_idx = column("typology")?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let date_str = record.get(date_idx).unwrap_or_default();
            let date = parse_date(date_str)?;
            let typology = record.get(typology_idx).unwrap_or_default().to_string();

            let mut values = HashMap::new();
            for (i, header) in headers.iter().enumerate() {
                if METADATA_COLUMNS.contains(&header) {
                    continue;
                }
                let value = record
                    .get(i)
                    .and_then(|cell| cell.trim().parse::<f64>().ok())
                    .filter(|v| v.is_finite());
                values.insert(header.to_string(), value);
            }
            rows.push(LongFormRow { date, typology, values });
        }

        log::info!("Read {} rows from {}", rows.len(), path.as_ref().display());
        Ok(LongFormTable { rows })
    }
}

fn parse_date(value: &str) -> WqpResult<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .map_err(WqpError::from)
}
