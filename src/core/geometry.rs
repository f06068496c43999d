use crate::types::{Extent, GeoTransform};
use geo::{BoundingRect, Contains, MultiPolygon, Point, Polygon};
use ndarray::Array2;

/// Lake (or basin) polygon keyed by its feature name
#[derive(Debug, Clone, PartialEq)]
pub struct NamedPolygon {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

impl NamedPolygon {
    pub fn new(name: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            name: name.into(),
            geometry,
        }
    }

    pub fn from_polygon(name: impl Into<String>, polygon: Polygon<f64>) -> Self {
        Self::new(name, MultiPolygon(vec![polygon]))
    }

    pub fn extent(&self) -> Option<Extent> {
        self.geometry.bounding_rect().map(|rect| Extent {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
        })
    }
}

/// Pixel window of a raster plus the in-polygon mask over that window
#[derive(Debug, Clone)]
pub struct PolygonMask {
    pub row_off: usize,
    pub col_off: usize,
    /// true where the pixel centre lies inside the polygon
    pub inside: Array2<bool>,
}

impl PolygonMask {
    /// Rasterize a polygon on a grid using the pixel-centre rule.
    ///
    /// The window is the polygon's bounding box snapped outward to whole
    /// pixels and clipped to the grid. Returns `None` when the bounding box
    /// and the grid do not overlap.
    pub fn build(
        polygon: &NamedPolygon,
        transform: &GeoTransform,
        width: usize,
        height: usize,
    ) -> Option<Self> {
        let bbox = polygon.extent()?;
        if !bbox.intersects(&transform.extent(width, height)) {
            return None;
        }

        let corners = [
            transform.geo_to_pixel(bbox.min_x, bbox.min_y),
            transform.geo_to_pixel(bbox.min_x, bbox.max_y),
            transform.geo_to_pixel(bbox.max_x, bbox.min_y),
            transform.geo_to_pixel(bbox.max_x, bbox.max_y),
        ];
        let col_min = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
        let col_max = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
        let row_min = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
        let row_max = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);
        if !(col_min.is_finite() && col_max.is_finite() && row_min.is_finite() && row_max.is_finite()) {
            return None;
        }

        let col_start = col_min.floor().max(0.0) as usize;
        let row_start = row_min.floor().max(0.0) as usize;
        let col_end = (col_max.ceil().max(0.0) as usize).min(width);
        let row_end = (row_max.ceil().max(0.0) as usize).min(height);
        if col_start >= col_end || row_start >= row_end {
            return None;
        }

        let rows = row_end - row_start;
        let cols = col_end - col_start;
        let inside = Array2::from_shape_fn((rows, cols), |(r, c)| {
            let (x, y) = transform.pixel_center(row_start + r, col_start + c);
            polygon.geometry.contains(&Point::new(x, y))
        });

        log::debug!(
            "Mask for {}: window rows {}..{}, cols {}..{}, {} pixels inside",
            polygon.name,
            row_start,
            row_end,
            col_start,
            col_end,
            inside.iter().filter(|&&v| v).count()
        );

        Some(Self {
            row_off: row_start,
            col_off: col_start,
            inside,
        })
    }

    pub fn rows(&self) -> usize {
        self.inside.nrows()
    }

    pub fn cols(&self) -> usize {
        self.inside.ncols()
    }

    /// True when at least one pixel centre lies inside the polygon
    pub fn covers_any(&self) -> bool {
        self.inside.iter().any(|&v| v)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo::{polygon, LineString};

    pub(crate) fn square(name: &str, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> NamedPolygon {
        NamedPolygon::from_polygon(
            name,
            Polygon::new(
                LineString::from(vec![
                    (min_x, min_y),
                    (max_x, min_y),
                    (max_x, max_y),
                    (min_x, max_y),
                    (min_x, min_y),
                ]),
                vec![],
            ),
        )
    }

    #[test]
    fn test_mask_window_snaps_outward() {
        // 10x10 grid of unit pixels, origin (0, 10)
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let poly = square("A", 2.2, 5.1, 4.8, 7.9);

        let mask = PolygonMask::build(&poly, &gt, 10, 10).unwrap();
        assert_eq!(mask.col_off, 2);
        assert_eq!(mask.row_off, 2);
        assert_eq!((mask.rows(), mask.cols()), (3, 3));
        // Centres at x = 2.5, 3.5, 4.5 and y = 7.5, 6.5, 5.5 are all inside
        assert!(mask.inside.iter().all(|&v| v));
    }

    #[test]
    fn test_mask_outside_grid() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let poly = square("far", 20.0, 20.0, 25.0, 25.0);
        assert!(PolygonMask::build(&poly, &gt, 10, 10).is_none());
    }

    #[test]
    fn test_mask_triangle_excludes_corner() {
        let gt = GeoTransform::new(0.0, 4.0, 1.0, -1.0);
        let tri = NamedPolygon::from_polygon(
            "tri",
            polygon![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 0.0, y: 4.0), (x: 0.0, y: 0.0)],
        );

        let mask = PolygonMask::build(&tri, &gt, 4, 4).unwrap();
        // bottom-left pixel centre (0.5, 0.5) is inside, top-right (3.5, 3.5) is not
        assert!(mask.inside[[3, 0]]);
        assert!(!mask.inside[[0, 3]]);
        assert!(mask.covers_any());
    }
}
