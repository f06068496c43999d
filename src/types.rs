use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Real-valued pixel data
pub type WqpReal = f32;

/// 2D pixel array (row x col)
pub type WqpImage = Array2<WqpReal>;

/// 3D banded pixel array (band x row x col)
pub type WqpCube = Array3<WqpReal>;

/// Affine geotransform in GDAL coefficient order.
///
/// ```text
/// x = top_left_x + col * pixel_width + row * rotation_x
/// y = top_left_y + col * rotation_y  + row * pixel_height
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn new(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    pub fn from_gdal(coeffs: [f64; 6]) -> Self {
        Self {
            top_left_x: coeffs[0],
            pixel_width: coeffs[1],
            rotation_x: coeffs[2],
            top_left_y: coeffs[3],
            rotation_y: coeffs[4],
            pixel_height: coeffs[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Geographic coordinates of a (fractional) pixel position
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Geographic coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Fractional (col, row) of a geographic position. NaN for a degenerate transform.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det.abs() < 1e-12 {
            return (f64::NAN, f64::NAN);
        }

        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;

        let col = (self.pixel_height * dx - self.rotation_x * dy) / det;
        let row = (-self.rotation_y * dx + self.pixel_width * dy) / det;

        (col, row)
    }

    /// Integer (row, col) index containing a geographic position (floor semantics)
    pub fn index(&self, x: f64, y: f64) -> (i64, i64) {
        let (col, row) = self.geo_to_pixel(x, y);
        (row.floor() as i64, col.floor() as i64)
    }

    /// Same transform re-anchored at pixel (row_off, col_off)
    pub fn shifted(&self, row_off: usize, col_off: usize) -> Self {
        let (x, y) = self.apply(col_off as f64, row_off as f64);
        Self {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }

    pub fn is_north_up(&self) -> bool {
        self.rotation_x.abs() < 1e-12 && self.rotation_y.abs() < 1e-12 && self.pixel_height < 0.0
    }

    /// Extent covered by a grid of the given size
    pub fn extent(&self, width: usize, height: usize) -> Extent {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(width as f64, 0.0),
            self.apply(0.0, height as f64),
            self.apply(width as f64, height as f64),
        ];

        let mut extent = Extent {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            extent.min_x = extent.min_x.min(x);
            extent.min_y = extent.min_y.min(y);
            extent.max_x = extent.max_x.max(x);
            extent.max_y = extent.max_y.max(y);
        }
        extent
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, -1.0)
    }
}

/// Axis-aligned geographic extent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn intersects(&self, other: &Extent) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// Pixel data type of the source raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
    Unknown,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::UInt32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Georeferenced raster held in memory
#[derive(Debug, Clone)]
pub struct RasterDataset {
    /// Pixel values (band x row x col)
    pub data: WqpCube,
    pub transform: GeoTransform,
    /// Coordinate reference system as WKT or authority string
    pub crs: String,
    pub nodata: Option<f64>,
    pub dtype: DataType,
}

impl RasterDataset {
    pub fn new(
        data: WqpCube,
        transform: GeoTransform,
        crs: impl Into<String>,
        nodata: Option<f64>,
        dtype: DataType,
    ) -> WqpResult<Self> {
        let (bands, rows, cols) = data.dim();
        if bands == 0 || rows == 0 || cols == 0 {
            return Err(WqpError::InvalidFormat(format!(
                "Raster grid must be non-empty, got {}x{}x{}",
                bands, rows, cols
            )));
        }

        Ok(Self {
            data,
            transform,
            crs: crs.into(),
            nodata,
            dtype,
        })
    }

    /// Single-band float32 dataset with NaN as nodata
    pub fn from_band(band: WqpImage, transform: GeoTransform, crs: impl Into<String>) -> WqpResult<Self> {
        Self::new(
            band.insert_axis(Axis(0)),
            transform,
            crs,
            Some(f64::NAN),
            DataType::Float32,
        )
    }

    pub fn band_count(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// View of a band, 1-based like GDAL
    pub fn band(&self, band: usize) -> WqpResult<ArrayView2<'_, WqpReal>> {
        if band == 0 || band > self.band_count() {
            return Err(WqpError::InvalidFormat(format!(
                "Band {} out of range (raster has {} bands)",
                band,
                self.band_count()
            )));
        }
        Ok(self.data.index_axis(Axis(0), band - 1))
    }

    pub fn extent(&self) -> Extent {
        self.transform.extent(self.width(), self.height())
    }

    /// True when the value is a real observation for this raster
    pub fn is_valid(&self, value: WqpReal) -> bool {
        is_valid_value(value, self.nodata)
    }
}

/// Finite and different from the nodata sentinel
pub fn is_valid_value(value: WqpReal, nodata: Option<f64>) -> bool {
    if !value.is_finite() {
        return false;
    }
    match nodata {
        Some(nd) if !nd.is_nan() => (value as f64) != nd,
        _ => true,
    }
}

/// Insertion-ordered map keyed by feature name.
///
/// Feature order follows the vector source and drives the column order of
/// exported tables.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> FeatureMap<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Insert or replace; a replaced entry keeps its position
    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> FeatureMap<U> {
        FeatureMap {
            entries: self.entries.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
        }
    }
}

impl<T> Default for FeatureMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(String, T)> for FeatureMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut map = FeatureMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<T> IntoIterator for FeatureMap<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Category of a non-fatal, skipped item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipKind {
    FeatureNotOverlapping,
    MissingStatistics,
    InvalidOutlierMethod,
    OutOfBoundsPoint,
    MissingTimeSeriesValue,
    Other,
}

/// One feature, point or date that was left out of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub kind: SkipKind,
    pub item: String,
    pub message: String,
}

impl SkippedItem {
    pub fn from_error(item: impl Into<String>, error: &WqpError) -> Self {
        Self {
            kind: error.skip_kind(),
            item: item.into(),
            message: error.to_string(),
        }
    }
}

/// Everything a batch skipped, handed back to the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub skipped: Vec<SkippedItem>,
}

impl BatchSummary {
    pub fn push(&mut self, item: SkippedItem) {
        self.skipped.push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = SkippedItem>) {
        self.skipped.extend(items);
    }

    pub fn count(&self, kind: SkipKind) -> usize {
        self.skipped.iter().filter(|s| s.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Error types for water-quality processing
#[derive(Debug, thiserror::Error)]
pub enum WqpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Feature {feature} does not overlay the raster layer")]
    FeatureNotOverlapping { feature: String },

    #[error("Missing statistics for feature {feature}: {detail}")]
    MissingStatistics { feature: String, detail: String },

    #[error("Invalid outlier method '{0}' (expected IQR, 2Sigma or 3Sigma)")]
    InvalidOutlierMethod(String),

    #[error("Invalid rejection policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid statistic '{0}'")]
    InvalidStatistic(String),

    #[error("Point {id} at row {row}, col {col} is outside the raster")]
    OutOfBoundsPoint { id: String, row: i64, col: i64 },

    #[error("Missing value: {date} : {typology} : {column}")]
    MissingTimeSeriesValue {
        date: String,
        typology: String,
        column: String,
    },

    #[error("Authentication token has expired")]
    ExpiredCredential,

    #[error("Observation service error: {0}")]
    Service(String),
}

impl WqpError {
    pub fn skip_kind(&self) -> SkipKind {
        match self {
            WqpError::FeatureNotOverlapping { .. } => SkipKind::FeatureNotOverlapping,
            WqpError::MissingStatistics { .. } => SkipKind::MissingStatistics,
            WqpError::InvalidOutlierMethod(_) => SkipKind::InvalidOutlierMethod,
            WqpError::OutOfBoundsPoint { .. } => SkipKind::OutOfBoundsPoint,
            WqpError::MissingTimeSeriesValue { .. } => SkipKind::MissingTimeSeriesValue,
            _ => SkipKind::Other,
        }
    }
}

/// Result type for water-quality operations
pub type WqpResult<T> = Result<T, WqpError>;
