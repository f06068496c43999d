//! Python bindings (`python` feature)

use crate::core::geometry::NamedPolygon;
use crate::core::timeseries::{PayloadBuilder, RowPolicy, StatisticKind};
use crate::core::{PipelineConfig, StatsFormatter, WqpPipeline};
use crate::io::VectorStore;
use crate::types::WqpError;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use serde_json::{json, Value};

fn to_py_err(e: WqpError) -> PyErr {
    match e {
        WqpError::InvalidOutlierMethod(_)
        | WqpError::InvalidPolicy(_)
        | WqpError::InvalidStatistic(_)
        | WqpError::Metadata(_) => PyErr::new::<PyValueError, _>(e.to_string()),
        other => PyErr::new::<PyRuntimeError, _>(other.to_string()),
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyPipeline>()?;
    m.add_function(wrap_pyfunction!(build_payload, m)?)?;
    Ok(())
}

/// Python wrapper for WqpPipeline bound to one lake vector file
#[pyclass(name = "Pipeline")]
struct PyPipeline {
    inner: WqpPipeline,
    polygons: Vec<NamedPolygon>,
}

#[pymethods]
impl PyPipeline {
    #[new]
    #[pyo3(signature = (vector_path, config_path=None))]
    fn new(vector_path: String, config_path: Option<String>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => PipelineConfig::from_file(path).map_err(to_py_err)?,
            None => PipelineConfig::default(),
        };
        let polygons = VectorStore::load_polygons(&vector_path, &config.name_field).map_err(to_py_err)?;
        let inner = WqpPipeline::new(config).map_err(to_py_err)?;
        Ok(PyPipeline { inner, polygons })
    }

    /// Process one WQP file; returns a JSON summary
    fn run_file(&self, path: String) -> PyResult<String> {
        let result = self.inner.run_file(&path, &self.polygons).map_err(to_py_err)?;
        let reports: serde_json::Map<String, Value> = result
            .reports()
            .iter()
            .map(|(name, report)| (name.to_string(), json!(report)))
            .collect();
        Ok(json!({
            "product": result.metadata.name,
            "reports": reports,
            "skipped": result.summary.skipped,
        })
        .to_string())
    }

    fn features(&self) -> Vec<String> {
        self.polygons.iter().map(|p| p.name.clone()).collect()
    }

    fn __repr__(&self) -> String {
        format!("Pipeline(features={})", self.polygons.len())
    }
}

/// Observation payload for `procedure` from an exported statistics CSV and a JSON sample
#[pyfunction]
#[pyo3(signature = (stats_csv, sample_json, procedure, keep_partial=false))]
fn build_payload(stats_csv: String, sample_json: String, procedure: String, keep_partial: bool) -> PyResult<String> {
    let table = StatsFormatter::read_stats_table(&stats_csv).map_err(to_py_err)?;
    let sample: Value = serde_json::from_str(&sample_json).map_err(|e| to_py_err(e.into()))?;
    let policy = if keep_partial {
        RowPolicy::KeepPartial
    } else {
        RowPolicy::DropIncomplete
    };
    let statistic = StatisticKind::from_procedure(&procedure);
    let (payload, _) =
        PayloadBuilder::build_payload(&table, &sample, &procedure, statistic, policy).map_err(to_py_err)?;
    Ok(payload.to_string())
}
