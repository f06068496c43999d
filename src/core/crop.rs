use crate::core::geometry::{NamedPolygon, PolygonMask};
use crate::types::{
    FeatureMap, GeoTransform, RasterDataset, SkippedItem, WqpCube, WqpError, WqpImage, WqpResult,
};
use crate::io::vector::VectorStore;
use ndarray::{s, Axis};
use std::path::Path;

/// Raster subset masked to one polygon; NaN outside the polygon
#[derive(Debug, Clone)]
pub struct Crop {
    /// Pixel values (band x row x col)
    pub data: WqpCube,
    /// Transform anchored at the crop's upper-left pixel
    pub transform: GeoTransform,
}

impl Crop {
    /// Copy of a band, 1-based
    pub fn band(&self, band: usize) -> WqpResult<WqpImage> {
        let bands = self.data.dim().0;
        if band == 0 || band > bands {
            return Err(WqpError::InvalidFormat(format!(
                "Band {} out of range (crop has {} bands)",
                band, bands
            )));
        }
        Ok(self.data.index_axis(Axis(0), band - 1).to_owned())
    }

    pub fn dim(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    /// Single-band float32 dataset of one band of the crop
    pub fn to_dataset(&self, band: usize, crs: &str) -> WqpResult<RasterDataset> {
        RasterDataset::from_band(self.band(band)?, self.transform, crs)
    }
}

/// Masks rasters to lake polygons
pub struct Cropper;

impl Cropper {
    /// Crop every band of `raster` to `polygon`.
    ///
    /// Pixels whose centre is outside the polygon, and source nodata pixels,
    /// become NaN. Fails with `FeatureNotOverlapping` when the polygon's
    /// extent misses the raster or it covers no pixel centre.
    pub fn crop_feature(raster: &RasterDataset, polygon: &NamedPolygon) -> WqpResult<Crop> {
        let mask = PolygonMask::build(polygon, &raster.transform, raster.width(), raster.height())
            .filter(PolygonMask::covers_any)
            .ok_or_else(|| WqpError::FeatureNotOverlapping {
                feature: polygon.name.clone(),
            })?;

        let window = raster.data.slice(s![
            ..,
            mask.row_off..mask.row_off + mask.rows(),
            mask.col_off..mask.col_off + mask.cols()
        ]);

        let mut data = window.to_owned();
        for mut band in data.axis_iter_mut(Axis(0)) {
            for ((r, c), value) in band.indexed_iter_mut() {
                if !mask.inside[[r, c]] || !raster.is_valid(*value) {
                    *value = f32::NAN;
                }
            }
        }

        Ok(Crop {
            data,
            transform: raster.transform.shifted(mask.row_off, mask.col_off),
        })
    }

    /// Crop the raster by each polygon; non-overlapping features are skipped
    pub fn crop_by_features(
        raster: &RasterDataset,
        polygons: &[NamedPolygon],
    ) -> (FeatureMap<Crop>, Vec<SkippedItem>) {
        log::info!("Cropping raster by {} features", polygons.len());

        let mut crops = FeatureMap::new();
        let mut skipped = Vec::new();

        for polygon in polygons {
            match Self::crop_feature(raster, polygon) {
                Ok(crop) => {
                    log::debug!("Cropped {}: {:?}", polygon.name, crop.dim());
                    crops.insert(polygon.name.clone(), crop);
                }
                Err(e) => {
                    log::warn!("{}", e);
                    skipped.push(SkippedItem::from_error(polygon.name.clone(), &e));
                }
            }
        }

        (crops, skipped)
    }

    /// Crop the raster by the polygons of a vector file, named by `name_field`
    pub fn crop_by_vector<P: AsRef<Path>>(
        raster: &RasterDataset,
        vector_path: P,
        name_field: &str,
    ) -> WqpResult<(FeatureMap<Crop>, Vec<SkippedItem>)> {
        let polygons = VectorStore::load_polygons(vector_path, name_field)?;
        Ok(Self::crop_by_features(raster, &polygons))
    }
}
