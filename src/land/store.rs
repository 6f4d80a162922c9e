//! Process-wide in-memory land-polygon dataset with an R-tree spatial index.

use std::io::Read;
use std::path::Path;

use geo::{BoundingRect, Polygon};
use rstar::{RTree, RTreeObject, AABB};

use crate::error::LandPolygonsError;

pub struct IndexedPolygon {
    pub geometry: Polygon<f64>,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedPolygon {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// The fully loaded land-polygon dataset, indexed for bbox queries.
pub struct LandStore {
    tree: RTree<IndexedPolygon>,
}

impl LandStore {
    /// Locates the `.shp` member inside the archive (preferring one literally
    /// named `land_polygons.shp`), extracts it alongside its `.shx`/`.dbf`
    /// companions to a temp directory, and loads every polygon into an
    /// R-tree. WGS84 is asserted, not verified — the dataset ships already
    /// in EPSG:4326.
    pub fn load_from_zip(zip_path: &Path) -> Result<Self, LandPolygonsError> {
        let file = std::fs::File::open(zip_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| LandPolygonsError::ShapefileRead(e.to_string()))?;

        let shp_name = {
            let mut candidates: Vec<String> = Vec::new();
            for i in 0..archive.len() {
                let entry = archive
                    .by_index(i)
                    .map_err(|e| LandPolygonsError::ShapefileRead(e.to_string()))?;
                let name = entry.name().to_string();
                if name.to_lowercase().ends_with(".shp") {
                    candidates.push(name);
                }
            }
            if candidates.is_empty() {
                return Err(LandPolygonsError::NoShapefile);
            }
            candidates
                .iter()
                .find(|n| n.to_lowercase().ends_with("land_polygons.shp"))
                .cloned()
                .unwrap_or_else(|| candidates[0].clone())
        };
        let stem = shp_name.trim_end_matches(".shp").trim_end_matches(".SHP");

        let extract_dir = tempfile::tempdir()?;
        for ext in [".shp", ".shx", ".dbf", ".prj"] {
            let member_name = format!("{stem}{ext}");
            let Ok(mut entry) = archive.by_name(&member_name) else {
                continue;
            };
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| LandPolygonsError::ShapefileRead(e.to_string()))?;
            let out_path = extract_dir.path().join(format!("land{ext}"));
            std::fs::write(out_path, buf)?;
        }

        let shp_path = extract_dir.path().join("land.shp");
        let mut reader = shapefile::Reader::from_path(&shp_path)
            .map_err(|e| LandPolygonsError::ShapefileRead(e.to_string()))?;

        let mut indexed = Vec::new();
        for shape_record in reader.iter_shapes_and_records() {
            let (shape, _record) =
                shape_record.map_err(|e| LandPolygonsError::ShapefileRead(e.to_string()))?;
            for polygon in shapefile_shape_to_polygons(shape) {
                if let Some(rect) = polygon.bounding_rect() {
                    let envelope =
                        AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
                    indexed.push(IndexedPolygon {
                        geometry: polygon,
                        envelope,
                    });
                }
            }
        }

        Ok(Self {
            tree: RTree::bulk_load(indexed),
        })
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Candidates whose envelope intersects `query`, via the R-tree; falls
    /// back to a linear scan if the tree is empty (e.g. a degenerate load).
    pub fn query_envelope(&self, min: [f64; 2], max: [f64; 2]) -> Vec<&Polygon<f64>> {
        let envelope = AABB::from_corners(min, max);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|ip| &ip.geometry)
            .collect()
    }
}

fn shapefile_shape_to_polygons(shape: shapefile::Shape) -> Vec<Polygon<f64>> {
    use shapefile::Shape;
    let mut out = Vec::new();
    match shape {
        Shape::Polygon(poly) => {
            for ring in poly.rings() {
                let points: &[shapefile::Point] = match ring {
                    shapefile::PolygonRing::Outer(pts) => pts,
                    shapefile::PolygonRing::Inner(pts) => pts,
                };
                let coords: Vec<geo::Coord<f64>> = points
                    .iter()
                    .map(|p| geo::Coord { x: p.x, y: p.y })
                    .collect();
                if coords.len() >= 4 {
                    out.push(Polygon::new(geo::LineString::new(coords), vec![]));
                }
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
pub(crate) fn tests_support_store(polys: Vec<Polygon<f64>>) -> LandStore {
    let indexed = polys
        .into_iter()
        .map(|geometry| {
            let rect = geometry.bounding_rect().expect("bounding rect");
            let envelope =
                AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
            IndexedPolygon { geometry, envelope }
        })
        .collect();
    LandStore {
        tree: RTree::bulk_load(indexed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;

    fn square(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Polygon<f64> {
        Polygon::new(
            geo::LineString::new(vec![
                Coord { x: minx, y: miny },
                Coord { x: maxx, y: miny },
                Coord { x: maxx, y: maxy },
                Coord { x: minx, y: maxy },
                Coord { x: minx, y: miny },
            ]),
            vec![],
        )
    }

    fn store_from(polys: Vec<Polygon<f64>>) -> LandStore {
        let indexed = polys
            .into_iter()
            .map(|geometry| {
                let rect = geometry.bounding_rect().expect("bounding rect");
                let envelope =
                    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
                IndexedPolygon { geometry, envelope }
            })
            .collect();
        LandStore {
            tree: RTree::bulk_load(indexed),
        }
    }

    #[test]
    fn query_envelope_returns_intersecting_polygons_only() {
        let store = store_from(vec![square(0.0, 0.0, 1.0, 1.0), square(10.0, 10.0, 11.0, 11.0)]);
        let hits = store.query_envelope([-0.5, -0.5], [0.5, 0.5]);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_store_has_zero_len() {
        let store = store_from(vec![]);
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn len_counts_all_loaded_polygons() {
        let store = store_from(vec![
            square(0.0, 0.0, 1.0, 1.0),
            square(2.0, 2.0, 3.0, 3.0),
            square(4.0, 4.0, 5.0, 5.0),
        ]);
        assert_eq!(store.len(), 3);
    }
}
