use chrono::NaiveDate;
use lakewqp::core::format::{StatValue, StatsFormatter};
use lakewqp::core::product::ProductMetadata;
use lakewqp::core::timeseries::{Lake, PayloadBuilder, RowPolicy, StatisticKind};
use lakewqp::core::StatEntries;
use lakewqp::FeatureMap;
use serde_json::{json, Value};
use tempfile::TempDir;

struct BasinStats {
    mean: f64,
    percentile_25: f64,
}

impl StatEntries for BasinStats {
    fn entries(&self) -> Vec<(String, StatValue)> {
        vec![
            ("mean".to_string(), StatValue::Float(self.mean)),
            ("percentile_25".to_string(), StatValue::Float(self.percentile_25)),
        ]
    }
}

fn product(typology: &str, date: &str) -> ProductMetadata {
    ProductMetadata::from_path(format!("/data/S3A_{}_32632_{}_x.tif", typology, date)).unwrap()
}

fn sample_template() -> Value {
    json!({
        "name": "SATELLITE_CHL_TURB_MA",
        "procedure": "urn:ogc:def:procedure:x-istsos:1.0:OLD",
        "samplingTime": {"beginPosition": "", "endPosition": ""},
        "observedProperty": {
            "CompositePhenomenon": {"id": "comp_1", "dimension": "0"},
            "component": []
        },
        "featureOfInterest": {"name": "MA"},
        "result": {"DataArray": {"elementCount": "0", "field": [], "values": []}}
    })
}

/// Write the statistics of two dates × two typologies for basin MA
fn write_stats_table(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("wqp_stats.csv");
    let rows = [
        ("CHL", "20210716T100000", 3.5, 2.0),
        ("TSM", "20210716T100000", 1.25, 1.0),
        ("CHL", "20210715T095958", 4.0, 3.0),
        ("TSM", "20210715T095958", 0.75, 0.5),
    ];
    for (typology, date, mean, p25) in rows {
        let mut stats = FeatureMap::new();
        stats.insert("MA", BasinStats { mean, percentile_25: p25 });
        let record = StatsFormatter::flatten(&product(typology, date), &stats);
        StatsFormatter::append_stats_file(&[record], &path).unwrap();
    }
    path
}

#[test]
fn test_payload_two_dates_chl_turb() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let table = StatsFormatter::read_stats_table(write_stats_table(&dir)).unwrap();
    assert_eq!(table.rows.len(), 4);

    let (payload, skipped) = PayloadBuilder::build_payload(
        &table,
        &sample_template(),
        "SATELLITE_CHL_TURB_MA",
        StatisticKind::Mean,
        RowPolicy::DropIncomplete,
    )
    .unwrap();

    assert!(skipped.is_empty());
    assert_eq!(
        payload["result"]["DataArray"]["values"],
        json!([
            ["2021-07-15T09:59:58Z", 4.0, 0.75],
            ["2021-07-16T10:00:00Z", 3.5, 1.25]
        ])
    );
    assert_eq!(payload["samplingTime"]["beginPosition"], "2021-07-15T09:59:58Z");
    assert_eq!(payload["samplingTime"]["endPosition"], "2021-07-16T10:00:00Z");
    assert_eq!(payload["procedure"], "urn:ogc:def:procedure:x-istsos:1.0:SATELLITE_CHL_TURB_MA");
    assert_eq!(payload["observedProperty"]["CompositePhenomenon"]["dimension"], "3");
    assert_eq!(payload["observedProperty"]["CompositePhenomenon"]["id"], "comp_1");
    assert_eq!(payload["result"]["DataArray"]["elementCount"], "3");
    assert_eq!(
        payload["observedProperty"]["component"],
        json!([
            "urn:ogc:def:parameter:x-istsos:1.0:time:iso8601",
            "urn:ogc:def:parameter:x-istsos:1.0:water:Chl:a",
            "urn:ogc:def:parameter:x-istsos:1.0:water:TSS"
        ])
    );

    let fields = payload["result"]["DataArray"]["field"].as_array().unwrap();
    assert_eq!(fields.len(), 3);
    assert_eq!(fields[0], json!({"name": "Time", "definition": "urn:ogc:def:parameter:x-istsos:1.0:time:iso8601"}));
    assert_eq!(fields[1]["uom"], "mg/m3");
    assert_eq!(fields[2]["name"], "water-TSS");

    // untouched template keys survive
    assert_eq!(payload["featureOfInterest"]["name"], "MA");
}

#[test]
fn test_payload_percentile_procedure() {
    let dir = TempDir::new().unwrap();
    let table = StatsFormatter::read_stats_table(write_stats_table(&dir)).unwrap();

    let procedure = "SATELLITE_CHL_TURB_MA_1Q";
    let statistic = StatisticKind::from_procedure(procedure);
    assert_eq!(statistic, StatisticKind::Percentile25);

    let (payload, _) =
        PayloadBuilder::build_payload(&table, &sample_template(), procedure, statistic, RowPolicy::DropIncomplete)
            .unwrap();
    assert_eq!(payload["result"]["DataArray"]["values"][0], json!(["2021-07-15T09:59:58Z", 3.0, 0.5]));
}

#[test]
fn test_payload_missing_typology() {
    let dir = TempDir::new().unwrap();
    let table = StatsFormatter::read_stats_table(write_stats_table(&dir)).unwrap();

    // no LSWT rows: TEMP procedures have no dates at all
    let (payload, skipped) = PayloadBuilder::build_payload(
        &table,
        &sample_template(),
        "SATELLITE_TEMP_MA",
        StatisticKind::Mean,
        RowPolicy::KeepPartial,
    )
    .unwrap();
    assert!(skipped.is_empty());
    assert_eq!(payload["result"]["DataArray"]["values"], json!([]));
    assert_eq!(payload["result"]["DataArray"]["elementCount"], "2");
}

#[test]
fn test_every_lake_procedure_resolves() {
    for lake in ["COMO", "LUGANO", "MAGGIORE"] {
        let lake: Lake = lake.parse().unwrap();
        for procedure in lake.procedures() {
            let statistic = StatisticKind::from_procedure(&procedure);
            let basin = statistic.basin(&procedure).unwrap();
            assert!(!basin.is_empty(), "{}", procedure);
            assert!(!basin.ends_with("1Q") && !basin.ends_with("SD"), "{} -> {}", procedure, basin);
        }
    }

    let date = NaiveDate::from_ymd_opt(2021, 7, 15).unwrap().and_hms_opt(0, 0, 0).unwrap();
    assert_eq!(lakewqp::core::timeseries::format_timestamp(&date), "2021-07-15T00:00:00Z");
}
