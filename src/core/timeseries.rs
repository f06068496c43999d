//! Observation-service time-series payloads
//!
//! A long-form statistics table (one row per product: date, typology and
//! `<statistic>_<basin>` columns) is reshaped into the `DataArray` value rows
//! of an istSOS observation, using a sample observation fetched from the
//! service as template.

use crate::types::{SkippedItem, WqpError, WqpResult};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

const URN_PREFIX: &str = "urn:ogc:def:procedure:x-istsos:1.0:";
const TIME_DEFINITION: &str = "urn:ogc:def:parameter:x-istsos:1.0:time:iso8601";

/// Water-quality parameter carried by a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WqpKind {
    Chl,
    Turb,
    Temp,
}

/// `field` entry of a DataArray
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
}

impl WqpKind {
    pub const ALL: [WqpKind; 3] = [WqpKind::Chl, WqpKind::Turb, WqpKind::Temp];

    /// Token used in procedure names
    pub fn token(&self) -> &'static str {
        match self {
            WqpKind::Chl => "CHL",
            WqpKind::Turb => "TURB",
            WqpKind::Temp => "TEMP",
        }
    }

    /// Typology of the products holding this parameter
    pub fn typology(&self) -> &'static str {
        match self {
            WqpKind::Chl => "CHL",
            WqpKind::Turb => "TSM",
            WqpKind::Temp => "LSWT",
        }
    }

    pub fn definition(&self) -> FieldDefinition {
        let (name, definition, uom) = match self {
            WqpKind::Chl => ("water-Chl-a", "urn:ogc:def:parameter:x-istsos:1.0:water:Chl:a", "mg/m3"),
            WqpKind::Turb => ("water-TSS", "urn:ogc:def:parameter:x-istsos:1.0:water:TSS", "g/m3"),
            WqpKind::Temp => (
                "water-temperature",
                "urn:ogc:def:parameter:x-istsos:1.0:water:temperature",
                "\u{00b0}C",
            ),
        };
        FieldDefinition {
            name: name.to_string(),
            definition: definition.to_string(),
            uom: Some(uom.to_string()),
        }
    }

    /// Parameters named by a procedure, in canonical order
    pub fn from_procedure(procedure: &str) -> Vec<WqpKind> {
        let tokens: Vec<&str> = procedure.split('_').collect();
        Self::ALL
            .into_iter()
            .filter(|kind| tokens.contains(&kind.token()))
            .collect()
    }
}

fn time_definition() -> FieldDefinition {
    FieldDefinition {
        name: "Time".to_string(),
        definition: TIME_DEFINITION.to_string(),
        uom: None,
    }
}

/// Statistic a procedure publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatisticKind {
    Mean,
    Percentile25,
    Percentile75,
    Std,
}

impl StatisticKind {
    /// Column prefix in the statistics table
    pub fn column_prefix(&self) -> &'static str {
        match self {
            StatisticKind::Mean => "mean",
            StatisticKind::Percentile25 => "percentile_25",
            StatisticKind::Percentile75 => "percentile_75",
            StatisticKind::Std => "std",
        }
    }

    /// Statistic implied by a procedure name suffix (`_1Q`, `_3Q`, `_SD`, none for mean)
    pub fn from_procedure(procedure: &str) -> Self {
        match procedure.rsplit('_').next() {
            Some("1Q") => StatisticKind::Percentile25,
            Some("3Q") => StatisticKind::Percentile75,
            Some("SD") => StatisticKind::Std,
            _ => StatisticKind::Mean,
        }
    }

    /// Basin (feature) name encoded in a procedure
    pub fn basin(&self, procedure: &str) -> WqpResult<String> {
        let tokens: Vec<&str> = procedure.split('_').collect();
        if tokens.contains(&"MA") {
            return Ok("MA".to_string());
        }

        let n = tokens.len();
        let range = match self {
            StatisticKind::Mean => n.checked_sub(2).map(|start| start..n),
            _ => n.checked_sub(3).map(|start| start..n - 1),
        };
        range
            .map(|r| tokens[r].join("_"))
            .ok_or_else(|| WqpError::InvalidFormat(format!("Cannot derive basin from procedure {}", procedure)))
    }
}

impl FromStr for StatisticKind {
    type Err = WqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(StatisticKind::Mean),
            "percentile_25" => Ok(StatisticKind::Percentile25),
            "percentile_75" => Ok(StatisticKind::Percentile75),
            "std" => Ok(StatisticKind::Std),
            other => Err(WqpError::InvalidStatistic(other.to_string())),
        }
    }
}

/// What to do with a date where a selected parameter has no value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RowPolicy {
    /// Drop the whole row
    #[default]
    DropIncomplete,
    /// Emit the row with the values that are available
    KeepPartial,
}

/// Lakes with registered satellite procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lake {
    Como,
    Lugano,
    Maggiore,
}

impl Lake {
    /// Procedure identifiers registered for the lake
    pub fn procedures(&self) -> Vec<String> {
        let basins: &[&str] = match self {
            Lake::Como => &["CO_E", "CO_N", "CO_W"],
            Lake::Lugano => &["LUG_N", "LUG_S"],
            Lake::Maggiore => &["MA"],
        };

        let mut procedures = Vec::new();
        for group in ["CHL_TURB", "TEMP"] {
            for suffix in ["", "_1Q", "_3Q", "_SD"] {
                for basin in basins {
                    procedures.push(format!("SATELLITE_{}_{}{}", group, basin, suffix));
                }
            }
        }
        procedures
    }
}

impl FromStr for Lake {
    type Err = WqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "COMO" => Ok(Lake::Como),
            "LUGANO" => Ok(Lake::Lugano),
            "MAGGIORE" => Ok(Lake::Maggiore),
            other => Err(WqpError::InvalidFormat(format!("Unknown lake '{}'", other))),
        }
    }
}

/// One product's statistics in long form
#[derive(Debug, Clone, PartialEq)]
pub struct LongFormRow {
    pub date: NaiveDateTime,
    pub typology: String,
    /// `<statistic>_<basin>` → value, `None` when empty
    pub values: HashMap<String, Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LongFormTable {
    pub rows: Vec<LongFormRow>,
}

impl LongFormTable {
    fn value(&self, date: &NaiveDateTime, typology: &str, column: &str) -> Option<f64> {
        self.rows
            .iter()
            .find(|r| r.date == *date && r.typology == typology)
            .and_then(|r| r.values.get(column).copied().flatten())
            .filter(|v| v.is_finite())
    }
}

/// ISO 8601 UTC timestamp with `Z` suffix
pub fn format_timestamp(date: &NaiveDateTime) -> String {
    date.and_utc().format("%Y-%m-%dT%H:%M:%S%.fZ").to_string()
}

/// Reshapes statistics tables into observation payloads
pub struct PayloadBuilder;

impl PayloadBuilder {
    /// Value rows `[timestamp, value per parameter]`, one per date, ascending
    pub fn value_rows(
        table: &LongFormTable,
        wqps: &[WqpKind],
        basin: &str,
        statistic: StatisticKind,
        policy: RowPolicy,
    ) -> (Vec<Value>, Vec<SkippedItem>) {
        let column = format!("{}_{}", statistic.column_prefix(), basin);
        let typologies: Vec<&str> = wqps.iter().map(|k| k.typology()).collect();
        let dates: BTreeSet<NaiveDateTime> = table
            .rows
            .iter()
            .filter(|r| typologies.contains(&r.typology.as_str()))
            .map(|r| r.date)
            .collect();

        let mut rows = Vec::new();
        let mut skipped = Vec::new();

        for date in dates {
            let timestamp = format_timestamp(&date);
            let mut row = vec![Value::String(timestamp.clone())];
            let mut complete = true;

            for typology in &typologies {
                match table.value(&date, typology, &column) {
                    Some(v) => row.push(json!(v)),
                    None => {
                        let err = WqpError::MissingTimeSeriesValue {
                            date: timestamp.clone(),
                            typology: typology.to_string(),
                            column: column.clone(),
                        };
                        log::warn!("{}", err);
                        skipped.push(SkippedItem::from_error(timestamp.clone(), &err));
                        complete = false;
                    }
                }
            }

            if complete || policy == RowPolicy::KeepPartial {
                rows.push(Value::Array(row));
            }
        }

        (rows, skipped)
    }

    /// Fill a sample observation with the table's values for one procedure
    pub fn build_payload(
        table: &LongFormTable,
        sample_template: &Value,
        procedure: &str,
        statistic: StatisticKind,
        policy: RowPolicy,
    ) -> WqpResult<(Value, Vec<SkippedItem>)> {
        let wqps = WqpKind::from_procedure(procedure);
        if wqps.is_empty() {
            return Err(WqpError::InvalidFormat(format!(
                "Procedure {} names no water-quality parameter",
                procedure
            )));
        }
        let basin = statistic.basin(procedure)?;
        log::info!(
            "Building payload for {} (parameters {:?}, basin {}, statistic {})",
            procedure,
            wqps,
            basin,
            statistic.column_prefix()
        );

        let mut payload = sample_template.clone();
        let root = payload
            .as_object_mut()
            .ok_or_else(|| WqpError::InvalidFormat("Sample observation is not a JSON object".to_string()))?;

        let begin = table.rows.iter().map(|r| r.date).min();
        let end = table.rows.iter().map(|r| r.date).max();
        if let (Some(begin), Some(end)) = (begin, end) {
            root.insert(
                "samplingTime".to_string(),
                json!({
                    "beginPosition": format_timestamp(&begin),
                    "endPosition": format_timestamp(&end),
                }),
            );
        }
        root.insert("procedure".to_string(), json!(format!("{}{}", URN_PREFIX, procedure)));

        let dimension = (wqps.len() + 1).to_string();
        let mut components = vec![json!(TIME_DEFINITION)];
        components.extend(wqps.iter().map(|k| json!(k.definition().definition)));
        let mut fields = vec![serde_json::to_value(time_definition())?];
        for kind in &wqps {
            fields.push(serde_json::to_value(kind.definition())?);
        }

        let observed = object_entry(root, "observedProperty");
        object_entry(observed, "CompositePhenomenon").insert("dimension".to_string(), json!(dimension));
        observed.insert("component".to_string(), Value::Array(components));

        let (values, skipped) = Self::value_rows(table, &wqps, &basin, statistic, policy);
        let data_array = object_entry(object_entry(root, "result"), "DataArray");
        data_array.insert("elementCount".to_string(), json!(dimension));
        data_array.insert("field".to_string(), Value::Array(fields));
        data_array.insert("values".to_string(), Value::Array(values));

        Ok((payload, skipped))
    }
}

/// Nested object under `key`, replacing any non-object value
fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(inner) => inner,
        _ => unreachable!("entry was just made an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 7, day).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    fn row(day: u32, typology: &str, column: &str, value: Option<f64>) -> LongFormRow {
        LongFormRow {
            date: date(day),
            typology: typology.to_string(),
            values: HashMap::from([(column.to_string(), value)]),
        }
    }

    #[test]
    fn test_wqps_from_procedure() {
        assert_eq!(WqpKind::from_procedure("SATELLITE_CHL_TURB_MA"), vec![WqpKind::Chl, WqpKind::Turb]);
        assert_eq!(WqpKind::from_procedure("SATELLITE_TEMP_CO_E_SD"), vec![WqpKind::Temp]);
    }

    #[test]
    fn test_basin_derivation() {
        assert_eq!(StatisticKind::Mean.basin("SATELLITE_CHL_TURB_MA").unwrap(), "MA");
        assert_eq!(StatisticKind::Std.basin("SATELLITE_CHL_TURB_MA_SD").unwrap(), "MA");
        assert_eq!(StatisticKind::Mean.basin("SATELLITE_CHL_TURB_CO_E").unwrap(), "CO_E");
        assert_eq!(StatisticKind::Percentile25.basin("SATELLITE_TEMP_LUG_N_1Q").unwrap(), "LUG_N");
        assert_eq!(StatisticKind::from_procedure("SATELLITE_TEMP_LUG_N_3Q"), StatisticKind::Percentile75);
        assert_eq!(StatisticKind::from_procedure("SATELLITE_TEMP_LUG_N"), StatisticKind::Mean);
    }

    #[test]
    fn test_lake_procedures() {
        let como = Lake::Como.procedures();
        assert_eq!(como.len(), 24);
        assert_eq!(como[0], "SATELLITE_CHL_TURB_CO_E");
        assert_eq!(como[3], "SATELLITE_CHL_TURB_CO_E_1Q");
        assert_eq!(como[23], "SATELLITE_TEMP_CO_W_SD");
        assert_eq!(Lake::Maggiore.procedures().len(), 8);
        assert_eq!("lugano".parse::<Lake>().unwrap(), Lake::Lugano);
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(&date(3)), "2021-07-03T10:00:00Z");
    }

    #[test]
    fn test_row_policies() {
        let table = LongFormTable {
            rows: vec![
                row(1, "CHL", "mean_MA", Some(2.0)),
                row(1, "TSM", "mean_MA", Some(0.5)),
                row(2, "CHL", "mean_MA", Some(3.0)),
            ],
        };
        let wqps = [WqpKind::Chl, WqpKind::Turb];

        let (rows, skipped) =
            PayloadBuilder::value_rows(&table, &wqps, "MA", StatisticKind::Mean, RowPolicy::DropIncomplete);
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped.len(), 1);

        let (rows, _) =
            PayloadBuilder::value_rows(&table, &wqps, "MA", StatisticKind::Mean, RowPolicy::KeepPartial);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], json!(["2021-07-02T10:00:00Z", 3.0]));
    }

    #[test]
    fn test_build_payload_rejects_non_object_template() {
        let table = LongFormTable::default();
        let err = PayloadBuilder::build_payload(
            &table,
            &json!([]),
            "SATELLITE_CHL_TURB_MA",
            StatisticKind::Mean,
            RowPolicy::DropIncomplete,
        )
        .unwrap_err();
        assert!(matches!(err, WqpError::InvalidFormat(_)));
    }
}
