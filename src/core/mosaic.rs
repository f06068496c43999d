use crate::io::raster::RasterAccessor;
use crate::types::{Extent, FeatureMap, GeoTransform, RasterDataset, WqpError, WqpImage, WqpResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Canonical order in which basin rasters are merged; earlier basins win overlaps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasinOrder(pub Vec<String>);

impl BasinOrder {
    pub fn new<S: Into<String>>(basins: impl IntoIterator<Item = S>) -> Self {
        Self(basins.into_iter().map(Into::into).collect())
    }

    /// Entries of `rasters` named in this order, in this order
    pub fn select<'a, T>(&self, rasters: &'a FeatureMap<T>) -> Vec<(&'a str, &'a T)> {
        self.0
            .iter()
            .filter_map(|basin| {
                rasters
                    .iter()
                    .find(|(name, _)| *name == basin.as_str())
            })
            .collect()
    }
}

impl Default for BasinOrder {
    fn default() -> Self {
        Self::new(["Lugano", "Como", "Maggiore"])
    }
}

/// Output grid shared by all merged rasters
#[derive(Debug, Clone, Copy)]
struct MosaicGrid {
    transform: GeoTransform,
    width: usize,
    height: usize,
}

impl MosaicGrid {
    fn covering(inputs: &[(&str, &RasterDataset)]) -> WqpResult<Self> {
        let (_, first) = inputs[0];
        let res_x = first.transform.pixel_width;
        let res_y = first.transform.pixel_height.abs();

        let mut extent: Option<Extent> = None;
        for (name, raster) in inputs {
            if !raster.transform.is_north_up() {
                return Err(WqpError::Processing(format!(
                    "Cannot merge rotated or south-up raster '{}'",
                    name
                )));
            }
            let e = raster.extent();
            extent = Some(extent.map_or(e, |acc| acc.union(&e)));
        }
        let extent = extent.ok_or_else(|| WqpError::Processing("No rasters to merge".to_string()))?;

        let width = ((extent.max_x - extent.min_x) / res_x).round().max(1.0) as usize;
        let height = ((extent.max_y - extent.min_y) / res_y).round().max(1.0) as usize;

        Ok(Self {
            transform: GeoTransform::new(extent.min_x, extent.max_y, res_x, -res_y),
            width,
            height,
        })
    }
}

/// Merges per-basin clean rasters into one regional mosaic
pub struct MosaicMerger;

impl MosaicMerger {
    /// Merge band 1 of the basins listed in `order`.
    ///
    /// Extent is the union of the inputs at the resolution of the first one.
    /// Each cell takes the first valid non-zero value in basin order, so zero is
    /// treated like nodata; unfilled cells are NaN. Returns `None` when no basin
    /// participates.
    pub fn merge(
        rasters: &FeatureMap<RasterDataset>,
        order: &BasinOrder,
    ) -> WqpResult<Option<RasterDataset>> {
        let inputs = order.select(rasters);
        if inputs.is_empty() {
            log::info!("No basin rasters to merge");
            return Ok(None);
        }

        let grid = MosaicGrid::covering(&inputs)?;
        log::debug!(
            "Mosaic grid {}x{} at ({}, {}), {} inputs",
            grid.height,
            grid.width,
            grid.transform.top_left_x,
            grid.transform.top_left_y,
            inputs.len()
        );

        let mut mosaic: WqpImage = Array2::from_elem((grid.height, grid.width), f32::NAN);
        let mut filled = Array2::from_elem((grid.height, grid.width), false);

        for (name, raster) in &inputs {
            let band = raster.band(1)?;
            let (rows, cols) = band.dim();
            let mut written = 0usize;

            for ((r, c), cell) in mosaic.indexed_iter_mut() {
                if filled[[r, c]] {
                    continue;
                }
                let (x, y) = grid.transform.pixel_center(r, c);
                let (src_row, src_col) = raster.transform.index(x, y);
                if src_row < 0 || src_col < 0 || src_row >= rows as i64 || src_col >= cols as i64 {
                    continue;
                }
                let value = band[[src_row as usize, src_col as usize]];
                if value != 0.0 && raster.is_valid(value) {
                    *cell = value;
                    filled[[r, c]] = true;
                    written += 1;
                }
            }
            log::debug!("{}: {} cells written to mosaic", name, written);
        }

        let crs = inputs[0].1.crs.clone();
        Ok(Some(RasterDataset::from_band(mosaic, grid.transform, crs)?))
    }

    /// Merge and write a single-band float32 GeoTIFF; nothing is written for empty input
    pub fn merge_and_export<P: AsRef<Path>>(
        rasters: &FeatureMap<RasterDataset>,
        order: &BasinOrder,
        out_path: P,
    ) -> WqpResult<Option<PathBuf>> {
        match Self::merge(rasters, order)? {
            Some(mosaic) => {
                RasterAccessor::write_dataset(&mosaic, out_path.as_ref())?;
                log::info!("Mosaic written to {}", out_path.as_ref().display());
                Ok(Some(out_path.as_ref().to_path_buf()))
            }
            None => Ok(None),
        }
    }
}
