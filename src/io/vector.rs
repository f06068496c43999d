use crate::core::geometry::NamedPolygon;
use crate::core::zonal::SampleLocation;
use crate::types::{WqpError, WqpResult};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{Geometry, MultiPolygon};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

const GEOMETRY_TAG: &[u8] = b"ogr:geometryProperty";

/// OGR-backed reader for lake polygons and sampling points
pub struct VectorStore;

impl VectorStore {
    /// Load the polygons of the first layer, named by the `name_field` attribute.
    ///
    /// Features without a name or with a non-polygonal geometry are skipped.
    pub fn load_polygons<P: AsRef<Path>>(path: P, name_field: &str) -> WqpResult<Vec<NamedPolygon>> {
        log::info!("Loading polygons from: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let mut layer = dataset.layer(0)?;
        let mut polygons = Vec::new();

        for feature in layer.features() {
            let Some(name) = feature.field_as_string_by_name(name_field)? else {
                log::warn!("Feature without '{}' attribute skipped", name_field);
                continue;
            };
            let Some(geometry) = feature.geometry() else {
                log::warn!("Feature {} has no geometry", name);
                continue;
            };

            let multi = match geometry.to_geo()? {
                Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                Geometry::MultiPolygon(mp) => mp,
                other => {
                    log::warn!("Feature {} skipped: unsupported geometry {}", name, geometry_kind(&other));
                    continue;
                }
            };
            polygons.push(NamedPolygon::new(name, multi));
        }

        log::info!("Loaded {} polygons", polygons.len());
        Ok(polygons)
    }

    /// Load point locations of the first layer, identified by the `id_field` attribute
    pub fn load_points<P: AsRef<Path>>(path: P, id_field: &str) -> WqpResult<Vec<SampleLocation>> {
        log::info!("Loading sample points from: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let mut layer = dataset.layer(0)?;
        let mut points = Vec::new();

        for (index, feature) in layer.features().enumerate() {
            let id = feature
                .field_as_string_by_name(id_field)?
                .unwrap_or_else(|| index.to_string());
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            match geometry.to_geo()? {
                Geometry::Point(p) => points.push(SampleLocation { id, x: p.x(), y: p.y() }),
                other => log::warn!("Sample {} skipped: not a point ({})", id, geometry_kind(&other)),
            }
        }

        log::info!("Loaded {} sample points", points.len());
        Ok(points)
    }

    /// Raw GML geometry of `<dir>/<procedure>.gml`, the content of its `ogr:geometryProperty`
    pub fn gml_geometry<P: AsRef<Path>>(dir: P, procedure: &str) -> WqpResult<String> {
        let path = dir.as_ref().join(format!("{}.gml", procedure));
        let content = std::fs::read_to_string(&path)?;
        extract_geometry_property(&content).ok_or_else(|| {
            WqpError::XmlParsing(format!("No ogr:geometryProperty in {}", path.display()))
        })
    }
}

/// Inner markup of the first `ogr:geometryProperty` element
pub fn extract_geometry_property(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == GEOMETRY_TAG => {
                return reader.read_text(e.name()).ok().map(|text| text.into_owned());
            }
            Ok(Event::Eof) => return None,
            Err(e) => {
                log::warn!("GML parsing stopped at {}: {}", reader.buffer_position(), e);
                return None;
            }
            _ => {}
        }
    }
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}
