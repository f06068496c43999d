use lakewqp::core::pipeline::{PipelineConfig, WqpPipeline};
use lakewqp::core::{Cropper, Statistic, StatsFormatter, ZonalStatsEngine, DEFAULT_STATISTICS};
use lakewqp::io::{RasterAccessor, VectorStore};
use lakewqp::{GeoTransform, SkipKind};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LAKES_GEOJSON: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "properties": {"name": "Lugano"},
     "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [4, 0], [4, 4], [0, 4], [0, 0]]]}},
    {"type": "Feature", "properties": {"name": "Como"},
     "geometry": {"type": "MultiPolygon", "coordinates": [[[[4, 0], [8, 0], [8, 4], [4, 4], [4, 0]]]]}},
    {"type": "Feature", "properties": {"name": "Station"},
     "geometry": {"type": "Point", "coordinates": [1, 1]}},
    {"type": "Feature", "properties": {"name": "Maggiore"},
     "geometry": {"type": "Polygon", "coordinates": [[[50, 50], [60, 50], [60, 60], [50, 60], [50, 50]]]}}
  ]
}"#;

fn write_product(dir: &Path, name: &str, spike: f32) -> PathBuf {
    let mut band = Array2::from_shape_fn((4, 8), |(r, c)| 1.0 + (r * 8 + c) as f32 / 4.0);
    band[[1, 1]] = spike;
    band[[3, 7]] = f32::NAN;
    let path = dir.join(name);
    RasterAccessor::write_single_band(&band, &GeoTransform::new(0.0, 4.0, 1.0, -1.0), "", &path).unwrap();
    path
}

fn setup() -> (TempDir, PathBuf) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let vector = dir.path().join("lakes.geojson");
    std::fs::write(&vector, LAKES_GEOJSON).unwrap();
    (dir, vector)
}

#[test]
fn test_load_polygons_skips_points() {
    let (_dir, vector) = setup();
    let polygons = VectorStore::load_polygons(&vector, "name").unwrap();
    let names: Vec<&str> = polygons.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Lugano", "Como", "Maggiore"]);

    let points = VectorStore::load_points(&vector, "name").unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].id, "Station");
}

#[test]
fn test_crop_by_vector_file() {
    let (dir, vector) = setup();
    let product = write_product(dir.path(), "S3A_CHL_32632_20210715T095958_x.tif", 90.0);
    let raster = RasterAccessor::open(&product).unwrap();

    let (crops, skipped) = Cropper::crop_by_vector(&raster, &vector, "name").unwrap();
    assert_eq!(crops.keys().collect::<Vec<_>>(), vec!["Lugano", "Como"]);
    assert_eq!(crops.get("Como").unwrap().dim(), (4, 4));
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].kind, SkipKind::FeatureNotOverlapping);
    assert_eq!(skipped[0].item, "Maggiore");

    assert!(Cropper::crop_by_vector(&raster, dir.path().join("missing.geojson"), "name").is_err());
}

#[test]
fn test_compute_stats_from_paths() {
    let (dir, vector) = setup();
    let product = write_product(dir.path(), "S3A_CHL_32632_20210715T095958_x.tif", 90.0);
    let requested = Statistic::parse_list(DEFAULT_STATISTICS).unwrap();

    let stats = ZonalStatsEngine::compute_stats_from_paths(&vector, "name", &product, &requested, None).unwrap();
    assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["Lugano", "Como", "Maggiore"]);

    let lugano = stats.get("Lugano").unwrap();
    assert_eq!(lugano.count, Some(16));
    assert_eq!(lugano.max, Some(90.0));
    // the NaN pixel in the bottom-right corner belongs to Como
    assert_eq!(stats.get("Como").unwrap().count, Some(15));
    assert!(!stats.get("Maggiore").unwrap().has_data());
}

#[test]
fn test_run_batch_end_to_end() {
    let (dir, vector) = setup();
    let out = dir.path().join("out");
    let products = vec![
        write_product(dir.path(), "S3A_CHL_32632_20210715T095958_x.tif", 90.0),
        write_product(dir.path(), "S3B_CHL_32632_20210716T094512_x.tif", 120.0),
        dir.path().join("S3A_CHL_32632_20210717T095000_missing.tif"),
    ];

    let config = PipelineConfig {
        output_dir: out.clone(),
        ..Default::default()
    };
    let pipeline = WqpPipeline::new(config).unwrap();
    let polygons = VectorStore::load_polygons(&vector, "name").unwrap();

    let (results, summary) = pipeline.run_batch(&products, &polygons);
    assert_eq!(results.len(), 2);
    // one missing file, plus Maggiore outside the raster twice
    assert_eq!(summary.count(SkipKind::FeatureNotOverlapping), 2);
    assert_eq!(summary.count(SkipKind::Other), 1);

    let first = &results[0];
    let lugano = first.reports().get("Lugano").cloned().unwrap();
    assert_eq!(lugano.count_upper, 1);
    assert_eq!(first.clean_stats.get("Lugano").unwrap().count, Some(15));

    // statistics tables: one header plus one row per product
    let stats = std::fs::read_to_string(out.join("wqp_stats.csv")).unwrap();
    assert_eq!(stats.lines().count(), 3);
    let table = StatsFormatter::read_stats_table(out.join("wqp_stats.csv")).unwrap();
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[1].typology, "CHL");
    assert!(table.rows[0].values.get("mean_Lugano").copied().flatten().is_some());

    let outliers = std::fs::read_to_string(out.join("wqp_outliers.csv")).unwrap();
    assert_eq!(outliers.lines().count(), 3);

    // mosaics cover both lakes
    let clean = RasterAccessor::open(out.join("S3A_CHL_32632_20210715T095958_x_clean.tif")).unwrap();
    assert_eq!((clean.height(), clean.width()), (4, 8));
    let band = clean.band(1).unwrap();
    assert!(band[[1, 1]].is_nan());
    assert!(band[[3, 7]].is_nan());
    assert!((band[[0, 0]] - 1.0).abs() < 1e-6);

    let spikes = RasterAccessor::open(out.join("S3A_CHL_32632_20210715T095958_x_outliers.tif")).unwrap();
    assert_eq!(spikes.band(1).unwrap()[[1, 1]], 90.0);
}

#[test]
fn test_config_file_drives_pipeline() {
    let (dir, vector) = setup();
    let out = dir.path().join("limits");
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        format!(
            r#"{{"outlier_method": null, "min_lower": 2.0, "max_upper": 8.0, "write_mosaics": false, "output_dir": "{}"}}"#,
            out.display()
        ),
    )
    .unwrap();

    let pipeline = WqpPipeline::new(PipelineConfig::from_file(&config_path).unwrap()).unwrap();
    let polygons = VectorStore::load_polygons(&vector, "name").unwrap();
    let product = write_product(dir.path(), "S3A_TSM_32632_20210715T095958_x.tif", 90.0);

    let result = pipeline.run_file(&product, &polygons).unwrap();
    for (_, report) in result.reports().iter() {
        assert_eq!(report.method, None);
        assert_eq!((report.lower_bound, report.upper_bound), (2.0, 8.0));
    }
    assert!(out.join("wqp_stats.csv").exists());
    assert!(!out.join("S3A_TSM_32632_20210715T095958_x_clean.tif").exists());
}
