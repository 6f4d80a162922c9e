//! Land-polygon clip engine: dataset lifecycle, spatial index, union cache.

pub mod cache;
pub mod download;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use geo::{BooleanOps, MultiPolygon};

use crate::error::LandPolygonsError;

pub use cache::{Bbox, LandUnionCache};
pub use download::{download_land_polygons, land_polygons_status};
pub use store::LandStore;

/// Process-wide handle to the land dataset: the in-memory spatial index,
/// loaded once and shared read-only, plus the union cache layered over it.
pub struct LandDataset {
    zip_path: PathBuf,
    store: OnceLock<Arc<LandStore>>,
    union_cache: LandUnionCache,
}

impl LandDataset {
    pub fn new(zip_path: PathBuf) -> Self {
        Self {
            zip_path,
            store: OnceLock::new(),
            union_cache: LandUnionCache::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.store.get().is_some()
    }

    pub fn zip_path(&self) -> &Path {
        &self.zip_path
    }

    /// Loads the shapefile into memory on first call; subsequent calls reuse
    /// the already-loaded, read-only store.
    pub fn ensure_loaded(&self) -> Result<Arc<LandStore>, LandPolygonsError> {
        if let Some(store) = self.store.get() {
            return Ok(store.clone());
        }
        let loaded = Arc::new(LandStore::load_from_zip(&self.zip_path)?);
        let _ = self.store.set(loaded.clone());
        Ok(self.store.get().cloned().unwrap_or(loaded))
    }

    /// See [`cache::LandUnionCache::load_land_union_for_bbox`]. Requires the
    /// dataset already be loaded.
    pub fn load_land_union_for_bbox(
        &self,
        bbox: Bbox,
        pad_deg: f64,
    ) -> Result<(MultiPolygon<f64>, bool), LandPolygonsError> {
        let store = self.ensure_loaded()?;
        Ok(self.union_cache.load_land_union_for_bbox(&store, bbox, pad_deg))
    }

    pub fn union_cache_len(&self) -> usize {
        self.union_cache.len()
    }
}

/// `clipped = relation_geom ∩ land_union`. Degenerate results (the boolean
/// op produces something with no rings) are normalized to an empty
/// MultiPolygon rather than surfaced as an error — clipping to nothing is a
/// valid outcome, not a failure.
pub fn clip_to_land(
    relation_geom: &MultiPolygon<f64>,
    land_union: &MultiPolygon<f64>,
) -> MultiPolygon<f64> {
    relation_geom.intersection(land_union)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Coord, LineString, Polygon};

    fn square(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::new(vec![
                Coord { x: minx, y: miny },
                Coord { x: maxx, y: miny },
                Coord { x: maxx, y: maxy },
                Coord { x: minx, y: maxy },
                Coord { x: minx, y: miny },
            ]),
            vec![],
        )
    }

    #[test]
    fn clip_to_land_intersects_geometries() {
        let relation = MultiPolygon::new(vec![square(0.0, 0.0, 2.0, 2.0)]);
        let land = MultiPolygon::new(vec![square(1.0, 1.0, 3.0, 3.0)]);
        let clipped = clip_to_land(&relation, &land);
        assert!(!clipped.0.is_empty());
    }

    #[test]
    fn clip_to_land_can_be_empty() {
        let relation = MultiPolygon::new(vec![square(0.0, 0.0, 1.0, 1.0)]);
        let land = MultiPolygon::new(vec![square(10.0, 10.0, 11.0, 11.0)]);
        let clipped = clip_to_land(&relation, &land);
        assert!(clipped.0.is_empty());
    }

    #[test]
    fn ensure_loaded_fails_cleanly_on_missing_zip() {
        let dataset = LandDataset::new(PathBuf::from("/nonexistent/land.zip"));
        assert!(dataset.ensure_loaded().is_err());
        assert!(!dataset.is_loaded());
    }
}
