use crate::types::{DataType, GeoTransform, RasterDataset, WqpError, WqpImage, WqpResult};
use gdal::raster::{Buffer, GdalDataType};
use gdal::{Dataset, DriverManager};
use ndarray::Array3;
use std::path::Path;

/// GDAL-backed raster reader/writer
pub struct RasterAccessor;

impl RasterAccessor {
    /// Read every band of a raster as f32 together with its georeferencing
    pub fn open<P: AsRef<Path>>(path: P) -> WqpResult<RasterDataset> {
        log::info!("Opening raster: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count() as usize;
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let crs = dataset.projection();

        log::debug!("Raster size: {}x{}, {} band(s)", width, height, band_count);
        log::debug!("Raster geotransform: {:?}", transform);

        let mut data = Vec::with_capacity(band_count * width * height);
        let mut nodata = None;
        let mut dtype = DataType::Unknown;

        for index in 1..=band_count {
            let band = dataset.rasterband(index as isize)?;
            if index == 1 {
                nodata = band.no_data_value();
                dtype = data_type_of(band.band_type());
            }
            let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
            data.extend(buffer.data);
        }

        log::debug!("Raster data type: {}", dtype);

        let cube = Array3::from_shape_vec((band_count, height, width), data)
            .map_err(|e| WqpError::Processing(format!("Failed to reshape raster data: {}", e)))?;

        RasterDataset::new(cube, transform, crs, nodata, dtype)
    }

    /// Write a single-band float32 GeoTIFF with NaN as nodata
    pub fn write_single_band<P: AsRef<Path>>(
        image: &WqpImage,
        transform: &GeoTransform,
        crs: &str,
        output_path: P,
    ) -> WqpResult<()> {
        log::info!("Saving GeoTIFF: {}", output_path.as_ref().display());

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = image.dim();

        let mut dataset = driver.create_with_band_type::<f32, _>(
            output_path.as_ref(),
            width as isize,
            height as isize,
            1,
        )?;

        dataset.set_geo_transform(&transform.to_gdal())?;
        if !crs.is_empty() {
            dataset.set_projection(crs)?;
        }

        let mut rasterband = dataset.rasterband(1)?;
        let flat_data: Vec<f32> = image.iter().cloned().collect();
        let buffer = Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        rasterband.set_no_data_value(Some(f64::NAN))?;

        Ok(())
    }

    /// Write band 1 of an in-memory dataset; a finite nodata sentinel is written as NaN
    pub fn write_dataset<P: AsRef<Path>>(raster: &RasterDataset, output_path: P) -> WqpResult<()> {
        let mut band = raster.band(1)?.to_owned();
        if let Some(nd) = raster
            .nodata
            .filter(|nd| !nd.is_nan())
            .and_then(num_traits::cast::<f64, f32>)
        {
            band.mapv_inplace(|v| if v == nd { f32::NAN } else { v });
        }
        Self::write_single_band(&band, &raster.transform, &raster.crs, output_path)
    }
}

fn data_type_of(band_type: GdalDataType) -> DataType {
    match band_type {
        GdalDataType::UInt8 => DataType::UInt8,
        GdalDataType::UInt16 => DataType::UInt16,
        GdalDataType::Int16 => DataType::Int16,
        GdalDataType::UInt32 => DataType::UInt32,
        GdalDataType::Int32 => DataType::Int32,
        GdalDataType::Float32 => DataType::Float32,
        GdalDataType::Float64 => DataType::Float64,
        _ => DataType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_write_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.tif");

        let mut image = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f32);
        image[[1, 1]] = f32::NAN;
        let transform = GeoTransform::new(500_000.0, 5_100_000.0, 300.0, -300.0);

        RasterAccessor::write_single_band(&image, &transform, "", &path).unwrap();
        let raster = RasterAccessor::open(&path).unwrap();

        assert_eq!(raster.band_count(), 1);
        assert_eq!((raster.height(), raster.width()), (3, 4));
        assert_eq!(raster.transform, transform);
        assert_eq!(raster.dtype, DataType::Float32);
        assert_eq!(raster.dtype.to_string(), "float32");
        let band = raster.band(1).unwrap();
        assert_eq!(band[[2, 3]], 11.0);
        assert!(band[[1, 1]].is_nan());
    }

    #[test]
    fn test_open_missing_file() {
        assert!(RasterAccessor::open("/nonexistent/raster.tif").is_err());
    }
}
