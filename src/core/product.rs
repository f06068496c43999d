//! Metadata encoded in water-quality product file names
//!
//! Sentinel-3 products look like `S3A_CHL_32632_20210715T095958_Oa_x.tif`
//! and Landsat-8 products like `L8_LSWT_32632_20210715_x.tif`; the sensor,
//! parameter typology, CRS token and acquisition date are taken from the
//! underscore-separated tokens of the file stem.

use crate::types::{WqpError, WqpResult};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;

const S3_DATE_FORMAT: &str = "%Y%m%dT%H%M%S";
const L8_DATE_FORMAT: &str = "%Y%m%d";

/// Source metadata attached to every exported statistics row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub name: String,
    pub path: String,
    pub sensor: String,
    pub typology: String,
    pub crs: String,
    pub date: NaiveDateTime,
}

impl ProductMetadata {
    /// Parse the metadata from a product path
    pub fn from_path<P: AsRef<Path>>(path: P) -> WqpResult<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WqpError::Metadata(format!("Invalid product path: {}", path.display())))?;
        let name = file_name.split('.').next().unwrap_or(file_name).to_string();
        let tokens: Vec<&str> = name.split('_').collect();

        let sensor = tokens[0].to_string();
        let penultimate = tokens
            .len()
            .checked_sub(2)
            .map(|i| tokens[i])
            .ok_or_else(|| WqpError::Metadata(format!("Product name too short: {}", name)))?;
        let token = |i: usize| -> WqpResult<&str> {
            tokens
                .get(i)
                .copied()
                .ok_or_else(|| WqpError::Metadata(format!("Missing token {} in product name {}", i, name)))
        };

        let (typology, crs, date) = match sensor.as_str() {
            "S3" | "S3A" | "S3B" => {
                let typology = token(1)?.to_string();
                if penultimate != "Oa" {
                    let date = NaiveDateTime::parse_from_str(penultimate, S3_DATE_FORMAT)?;
                    (typology, token(2)?.to_string(), date)
                } else {
                    let date = NaiveDateTime::parse_from_str(token(2)?, S3_DATE_FORMAT)?;
                    (typology, token(1)?.to_string(), date)
                }
            }
            "L8" => {
                if penultimate == "Oa" {
                    return Err(WqpError::Metadata(format!(
                        "Landsat-8 product name without date token: {}",
                        name
                    )));
                }
                let date = NaiveDate::parse_from_str(penultimate, L8_DATE_FORMAT)?
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| WqpError::Metadata(format!("Invalid date in {}", name)))?;
                (token(1)?.to_string(), token(2)?.to_string(), date)
            }
            other => {
                return Err(WqpError::Metadata(format!("Unsupported sensor '{}' in {}", other, name)));
            }
        };

        log::debug!(
            "Parsed product {}: sensor={}, typology={}, crs={}, date={}",
            name,
            sensor,
            typology,
            crs,
            date
        );

        Ok(Self {
            name,
            path: path.to_string_lossy().into_owned(),
            sensor,
            typology,
            crs,
            date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel3_product() {
        let meta = ProductMetadata::from_path("/data/S3A_CHL_32632_20210715T095958_x.tif").unwrap();
        assert_eq!(meta.name, "S3A_CHL_32632_20210715T095958_x");
        assert_eq!(meta.sensor, "S3A");
        assert_eq!(meta.typology, "CHL");
        assert_eq!(meta.crs, "32632");
        assert_eq!(meta.date.to_string(), "2021-07-15 09:59:58");
    }

    #[test]
    fn test_sentinel3_optical_product() {
        let meta = ProductMetadata::from_path("S3B_oa_20200301T100102_Oa_08.tif").unwrap();
        assert_eq!(meta.typology, "oa");
        assert_eq!(meta.crs, "oa");
        assert_eq!(meta.date.to_string(), "2020-03-01 10:01:02");
    }

    #[test]
    fn test_landsat8_product() {
        let meta = ProductMetadata::from_path("L8_LSWT_32632_20190601_x.tif").unwrap();
        assert_eq!(meta.sensor, "L8");
        assert_eq!(meta.typology, "LSWT");
        assert_eq!(meta.date.to_string(), "2019-06-01 00:00:00");
    }

    #[test]
    fn test_unknown_sensor() {
        let err = ProductMetadata::from_path("S2A_CHL_32632_20190601_x.tif").unwrap_err();
        assert!(matches!(err, WqpError::Metadata(_)));
    }
}
