//! Tile-keyed LRU memoization of unioned land geometry per padded bounding box.

use std::collections::HashMap;
use std::sync::Mutex;

use geo::{BooleanOps, MultiPolygon, Polygon};

use super::store::LandStore;

const TILE_DEGREES: f64 = 5.0;
const CAPACITY: usize = 96;

/// `(minx, miny, maxx, maxy)` in degrees.
pub type Bbox = (f64, f64, f64, f64);

/// Integer grid coordinate a bbox snaps to before a union lookup; distinct
/// `pad_deg` values (rounded to hundredths) get distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    min_x: i64,
    min_y: i64,
    max_x: i64,
    max_y: i64,
    pad_cents: i64,
}

fn tile_key(bbox: Bbox, pad_deg: f64) -> (TileKey, Bbox) {
    let (minx, miny, maxx, maxy) = bbox;
    let padded = (minx - pad_deg, miny - pad_deg, maxx + pad_deg, maxy + pad_deg);
    let key = TileKey {
        min_x: (padded.0 / TILE_DEGREES).floor() as i64,
        min_y: (padded.1 / TILE_DEGREES).floor() as i64,
        max_x: (padded.2 / TILE_DEGREES).ceil() as i64,
        max_y: (padded.3 / TILE_DEGREES).ceil() as i64,
        pad_cents: (pad_deg * 100.0).round() as i64,
    };
    let query_bbox = (
        key.min_x as f64 * TILE_DEGREES,
        key.min_y as f64 * TILE_DEGREES,
        key.max_x as f64 * TILE_DEGREES,
        key.max_y as f64 * TILE_DEGREES,
    );
    (key, query_bbox)
}

struct Entry {
    union: MultiPolygon<f64>,
}

/// Process-wide LRU of unioned land geometry, one entry per tile key.
/// Mutex scope covers only cache bookkeeping, never the union computation.
pub struct LandUnionCache {
    inner: Mutex<LruMap>,
}

struct LruMap {
    entries: HashMap<TileKey, Entry>,
    order: Vec<TileKey>,
}

impl LandUnionCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruMap {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    fn touch(&self, key: TileKey) {
        let mut guard = self.inner.lock().expect("land union cache poisoned");
        if let Some(pos) = guard.order.iter().position(|k| *k == key) {
            guard.order.remove(pos);
        }
        guard.order.push(key);
    }

    fn get_cached(&self, key: TileKey) -> Option<MultiPolygon<f64>> {
        let guard = self.inner.lock().expect("land union cache poisoned");
        guard.entries.get(&key).map(|e| e.union.clone())
    }

    fn insert(&self, key: TileKey, union: MultiPolygon<f64>) {
        let mut guard = self.inner.lock().expect("land union cache poisoned");
        guard.entries.insert(key, Entry { union });
        if !guard.order.contains(&key) {
            guard.order.push(key);
        }
        while guard.entries.len() > CAPACITY {
            if guard.order.is_empty() {
                break;
            }
            let oldest = guard.order.remove(0);
            guard.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("land union cache poisoned").entries.len()
    }

    /// Looks up the unioned land geometry covering `bbox` padded by
    /// `pad_deg`. Returns `(union, hit)`.
    pub fn load_land_union_for_bbox(
        &self,
        store: &LandStore,
        bbox: Bbox,
        pad_deg: f64,
    ) -> (MultiPolygon<f64>, bool) {
        let (key, query_bbox) = tile_key(bbox, pad_deg);

        if let Some(cached) = self.get_cached(key) {
            self.touch(key);
            return (cached, true);
        }

        let (qminx, qminy, qmaxx, qmaxy) = query_bbox;
        let candidates = store.query_envelope([qminx, qminy], [qmaxx, qmaxy]);
        let union = union_polygons(candidates.into_iter().cloned());

        self.insert(key, union.clone());
        (union, false)
    }
}

impl Default for LandUnionCache {
    fn default() -> Self {
        Self::new()
    }
}

fn union_polygons(polys: impl Iterator<Item = Polygon<f64>>) -> MultiPolygon<f64> {
    let mut acc = MultiPolygon::new(Vec::new());
    for poly in polys {
        let single = MultiPolygon::new(vec![poly]);
        acc = acc.union(&single);
    }
    acc
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

    #[test]
    fn tile_key_snaps_to_five_degree_grid() {
        let (key, query_bbox) = tile_key((1.0, 1.0, 4.0, 4.0), 1.0);
        assert_eq!(key.min_x, 0);
        assert_eq!(key.min_y, 0);
        assert_eq!(key.max_x, 1);
        assert_eq!(key.max_y, 1);
        assert_eq!(query_bbox, (0.0, 0.0, 5.0, 5.0));
    }

    #[test]
    fn distinct_pad_deg_values_get_distinct_keys() {
        let (key_a, _) = tile_key((0.0, 0.0, 1.0, 1.0), 1.0);
        let (key_b, _) = tile_key((0.0, 0.0, 1.0, 1.0), 2.0);
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn second_lookup_on_same_key_is_a_hit() {
        let s = crate::land::store::tests_support_store(vec![square(0.0, 0.0, 1.0, 1.0)]);
        let cache = LandUnionCache::new();
        let (_u1, hit1) = cache.load_land_union_for_bbox(&s, (0.0, 0.0, 0.5, 0.5), 1.0);
        let (_u2, hit2) = cache.load_land_union_for_bbox(&s, (0.0, 0.0, 0.5, 0.5), 1.0);
        assert!(!hit1);
        assert!(hit2);
    }

    #[test]
    fn cache_evicts_oldest_entry_past_capacity() {
        let s = crate::land::store::tests_support_store(vec![square(-1000.0, -1000.0, 1000.0, 1000.0)]);
        let cache = LandUnionCache::new();
        for i in 0..(CAPACITY + 5) {
            let x = i as f64 * TILE_DEGREES * 2.0;
            cache.load_land_union_for_bbox(&s, (x, x, x + 1.0, x + 1.0), 0.0);
        }
        assert_eq!(cache.len(), CAPACITY);
    }
}
