//! Assembles a polygonal surface from a relation's way members.
//!
//! Overpass returns a relation together with the ways and nodes it
//! references. This module restricts that element set to the ways owned by
//! the target relation, stitches their coordinate sequences into closed
//! rings, and polygonizes the result, with optional antimeridian handling.

use geo::{Coord, LineString, MultiPolygon, Polygon};

use crate::error::GeometryError;
use crate::overpass::{LatLon, OverpassElement, RelationMember};

/// `true` when the coordinate set straddles the antimeridian strongly enough
/// to need longitude-unwrapping before ring assembly.
fn is_antimeridian_candidate(coords: &[Coord<f64>]) -> bool {
    let mut min_lon = f64::INFINITY;
    let mut max_lon = f64::NEG_INFINITY;
    let mut has_low = false;
    let mut has_high = false;
    for c in coords {
        if c.x < min_lon {
            min_lon = c.x;
        }
        if c.x > max_lon {
            max_lon = c.x;
        }
        if c.x < -150.0 {
            has_low = true;
        }
        if c.x > 150.0 {
            has_high = true;
        }
    }
    has_low && has_high && (max_lon - min_lon) > 300.0
}

/// Shifts each longitude into `(prev - 180, prev + 180]` relative to the
/// previous point, unwrapping a ring that crosses the antimeridian.
fn unwrap_longitudes(coords: &mut [Coord<f64>]) {
    if coords.is_empty() {
        return;
    }
    let mut prev = coords[0].x;
    for c in coords.iter_mut() {
        let mut lon = c.x;
        while lon <= prev - 180.0 {
            lon += 360.0;
        }
        while lon > prev + 180.0 {
            lon -= 360.0;
        }
        c.x = lon;
        prev = lon;
    }
}

fn wrap_to_0_360(coords: &mut [Coord<f64>]) {
    for c in coords.iter_mut() {
        c.x = (c.x + 360.0) % 360.0;
    }
}

/// Drops consecutive duplicate points and closes the ring if it is nearly
/// closed already; a stand-in for the zero-width-buffer topology repair.
fn repair_ring(coords: Vec<Coord<f64>>) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(coords.len());
    for c in coords {
        if out.last() != Some(&c) {
            out.push(c);
        }
    }
    if out.len() >= 2 && out.first() != out.last() {
        let first = out[0];
        out.push(first);
    }
    out
}

fn way_coords(elem: &OverpassElement) -> Option<Vec<Coord<f64>>> {
    match elem {
        OverpassElement::Way { geometry, .. } => geometry.as_ref().map(|pts| {
            pts.iter()
                .map(|LatLon { lat, lon }| Coord { x: *lon, y: *lat })
                .collect()
        }),
        _ => None,
    }
}

/// Merge possibly-disjoint line segments into closed rings by chaining
/// shared endpoints, in any order of arrival.
fn merge_segments_into_rings(mut remaining: Vec<Vec<Coord<f64>>>) -> Vec<Vec<Coord<f64>>> {
    let mut rings = Vec::new();

    while !remaining.is_empty() {
        let mut current = remaining.remove(0);

        if current.first() == current.last() && current.len() >= 4 {
            rings.push(current);
            continue;
        }

        let mut progressed = true;
        while progressed && !remaining.is_empty() {
            progressed = false;
            let current_start = current.first().copied();
            let current_end = current.last().copied();

            for i in 0..remaining.len() {
                let seg = &remaining[i];
                let seg_start = seg.first().copied();
                let seg_end = seg.last().copied();

                if current_end == seg_start {
                    let mut seg = remaining.remove(i);
                    seg.remove(0);
                    current.extend(seg);
                    progressed = true;
                    break;
                } else if current_end == seg_end {
                    let mut seg = remaining.remove(i);
                    seg.reverse();
                    seg.remove(0);
                    current.extend(seg);
                    progressed = true;
                    break;
                } else if current_start == seg_end {
                    let mut seg = remaining.remove(i);
                    seg.pop();
                    seg.extend(current);
                    current = seg;
                    progressed = true;
                    break;
                } else if current_start == seg_start {
                    let mut seg = remaining.remove(i);
                    seg.reverse();
                    seg.pop();
                    seg.extend(current);
                    current = seg;
                    progressed = true;
                    break;
                }
            }
        }

        rings.push(current);
    }

    rings
}

/// Builds the polygonal geometry for `relation_id` out of a flat element set
/// (the relation itself plus the ways/nodes Overpass returned alongside it).
pub fn build_relation_geometry(
    elements: &[OverpassElement],
    relation_id: i64,
    fix_antimeridian: bool,
) -> Result<MultiPolygon<f64>, GeometryError> {
    let relation = elements
        .iter()
        .find(|e| matches!(e, OverpassElement::Relation { id, .. } if *id == relation_id))
        .ok_or(GeometryError::RelationNotFound)?;

    let OverpassElement::Relation { members, .. } = relation else {
        return Err(GeometryError::RelationNotFound);
    };

    let way_ids: std::collections::HashSet<i64> = members
        .iter()
        .filter_map(|m| match m {
            RelationMember::Way { ref_, .. } => Some(*ref_),
            _ => None,
        })
        .collect();

    let mut segments: Vec<Vec<Coord<f64>>> = Vec::new();
    for elem in elements {
        if let OverpassElement::Way { id, .. } = elem {
            if !way_ids.contains(id) {
                continue;
            }
            if let Some(coords) = way_coords(elem) {
                if coords.len() >= 2 {
                    segments.push(coords);
                }
            }
        }
    }

    if segments.is_empty() {
        return Err(GeometryError::NoWayGeometry);
    }

    let mut all_coords: Vec<Coord<f64>> = segments.iter().flatten().copied().collect();
    let antimeridian_fix_applied = fix_antimeridian && is_antimeridian_candidate(&all_coords);

    if antimeridian_fix_applied {
        for seg in segments.iter_mut() {
            unwrap_longitudes(seg);
        }
        all_coords = segments.iter().flatten().copied().collect();
        let _ = all_coords;
    }

    let rings = merge_segments_into_rings(segments);
    if rings.is_empty() {
        return Err(GeometryError::MergeFailed);
    }

    let mut polygons: Vec<Polygon<f64>> = Vec::new();
    for ring in rings {
        let repaired = repair_ring(ring);
        if repaired.len() < 4 {
            continue;
        }
        polygons.push(Polygon::new(LineString::new(repaired), vec![]));
    }

    if polygons.is_empty() {
        return Err(GeometryError::MergeFailed);
    }

    if antimeridian_fix_applied {
        for poly in polygons.iter_mut() {
            let exterior = poly.exterior_mut(|ls| {
                let mut coords: Vec<Coord<f64>> = ls.0.clone();
                wrap_to_0_360(&mut coords);
                *ls = LineString::new(coords);
            });
            let _ = exterior;
        }
    }

    Ok(MultiPolygon::new(polygons))
}

/// Renders a polygonal geometry as a GeoJSON `geometry` object.
pub fn multipolygon_to_geojson(mp: &MultiPolygon<f64>) -> serde_json::Value {
    let value = geojson::Value::from(mp);
    let geometry = geojson::Geometry::new(value);
    serde_json::to_value(geometry).unwrap_or(serde_json::Value::Null)
}

/// Parses a GeoJSON `geometry` object (`Polygon` or `MultiPolygon`) back
/// into a `MultiPolygon`, for reloading a previously written object file.
pub fn multipolygon_from_geojson(value: &serde_json::Value) -> Option<MultiPolygon<f64>> {
    let geometry = geojson::Geometry::from_json_value(value.clone()).ok()?;
    match geometry.value {
        geojson::Value::Polygon(_) => {
            let poly = Polygon::<f64>::try_from(geometry.value).ok()?;
            Some(MultiPolygon::new(vec![poly]))
        }
        geojson::Value::MultiPolygon(_) => MultiPolygon::<f64>::try_from(geometry.value).ok(),
        _ => None,
    }
}

pub fn count_polygons(mp: &MultiPolygon<f64>) -> usize {
    mp.0.len()
}

pub fn count_vertices(mp: &MultiPolygon<f64>) -> usize {
    mp.0
        .iter()
        .map(|poly| {
            poly.exterior().0.len() + poly.interiors().iter().map(|r| r.0.len()).sum::<usize>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overpass::LatLon;

    fn way(id: i64, pts: &[(f64, f64)]) -> OverpassElement {
        OverpassElement::Way {
            id,
            nodes: vec![],
            geometry: Some(
                pts.iter()
                    .map(|(lat, lon)| LatLon {
                        lat: *lat,
                        lon: *lon,
                    })
                    .collect(),
            ),
            tags: Default::default(),
        }
    }

    fn relation(id: i64, way_ids: &[i64]) -> OverpassElement {
        OverpassElement::Relation {
            id,
            members: way_ids
                .iter()
                .map(|w| RelationMember::Way {
                    ref_: *w,
                    role: "outer".to_string(),
                })
                .collect(),
            tags: Default::default(),
        }
    }

    #[test]
    fn missing_relation_is_an_error() {
        let elements = vec![way(1, &[(0.0, 0.0), (0.0, 1.0)])];
        let err = build_relation_geometry(&elements, 99, true).unwrap_err();
        assert!(matches!(err, GeometryError::RelationNotFound));
    }

    #[test]
    fn relation_with_no_ways_is_an_error() {
        let elements = vec![relation(1, &[])];
        let err = build_relation_geometry(&elements, 1, true).unwrap_err();
        assert!(matches!(err, GeometryError::NoWayGeometry));
    }

    #[test]
    fn single_closed_way_becomes_one_polygon() {
        let elements = vec![
            relation(1, &[10]),
            way(
                10,
                &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)],
            ),
        ];
        let mp = build_relation_geometry(&elements, 1, true).unwrap();
        assert_eq!(mp.0.len(), 1);
    }

    #[test]
    fn split_ring_across_two_ways_merges() {
        let elements = vec![
            relation(1, &[10, 11]),
            way(10, &[(0.0, 0.0), (0.0, 1.0), (1.0, 1.0)]),
            way(11, &[(1.0, 1.0), (1.0, 0.0), (0.0, 0.0)]),
        ];
        let mp = build_relation_geometry(&elements, 1, true).unwrap();
        assert_eq!(mp.0.len(), 1);
    }

    #[test]
    fn antimeridian_candidate_is_detected() {
        let coords = vec![
            Coord { x: 179.0, y: 10.0 },
            Coord { x: -179.0, y: 10.0 },
        ];
        assert!(is_antimeridian_candidate(&coords));
    }

    #[test]
    fn non_antimeridian_coords_are_not_flagged() {
        let coords = vec![Coord { x: 10.0, y: 10.0 }, Coord { x: 20.0, y: 20.0 }];
        assert!(!is_antimeridian_candidate(&coords));
    }

    #[test]
    fn multipolygon_round_trips_through_geojson() {
        let mp = MultiPolygon::new(vec![Polygon::new(
            LineString::new(vec![
                Coord { x: 0.0, y: 0.0 },
                Coord { x: 1.0, y: 0.0 },
                Coord { x: 1.0, y: 1.0 },
                Coord { x: 0.0, y: 0.0 },
            ]),
            vec![],
        )]);
        let value = multipolygon_to_geojson(&mp);
        let back = multipolygon_from_geojson(&value).unwrap();
        assert_eq!(back.0.len(), 1);
        assert_eq!(count_polygons(&back), 1);
        assert_eq!(count_vertices(&back), 4);
    }

    #[test]
    fn multipolygon_to_geojson_produces_a_polygon_geometry() {
        let mp = MultiPolygon::new(vec![Polygon::new(
            LineString::new(vec![
                Coord { x: 0.0, y: 0.0 },
                Coord { x: 1.0, y: 0.0 },
                Coord { x: 1.0, y: 1.0 },
                Coord { x: 0.0, y: 0.0 },
            ]),
            vec![],
        )]);
        let value = multipolygon_to_geojson(&mp);
        assert_eq!(value["type"], "MultiPolygon");
    }

    #[test]
    fn antimeridian_crossing_relation_is_unwrapped_into_0_360() {
        let elements = vec![
            relation(1, &[10]),
            way(
                10,
                &[
                    (10.0, 179.0),
                    (10.0, -179.0),
                    (-10.0, -179.0),
                    (-10.0, 179.0),
                    (10.0, 179.0),
                ],
            ),
        ];
        let mp = build_relation_geometry(&elements, 1, true).unwrap();
        for poly in &mp.0 {
            for c in poly.exterior().coords() {
                assert!((0.0..360.0).contains(&c.x), "lon {} not in [0,360)", c.x);
            }
        }
    }
}
