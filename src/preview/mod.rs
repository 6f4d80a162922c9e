//! Unscoped and scope-aware preview geometry: a lightweight path to a
//! feature collection without running a full download job.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::config::Config;
use crate::error::OverpassError;
use crate::geometry::{build_relation_geometry, multipolygon_to_geojson};
use crate::overpass::{OverpassClient, OverpassElement};
use crate::storage::{scope_paths, write_object_geojson};
use crate::util::preferred_name_from_tags;

fn relations_fetch_query(ids: &[i64], timeout_sec: u64, with_geom: bool) -> String {
    let joined = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let out_mode = if with_geom { "out body geom;" } else { "out body;" };
    format!(
        "[out:json][timeout:{timeout_sec}];\nrelation({joined})->.r;\n(.r;>;);\n{out_mode}"
    )
}

fn cache_key(overpass_url: Option<&str>, default_url: &str) -> String {
    let src = overpass_url.unwrap_or(default_url).trim().to_lowercase();
    let mut hasher = DefaultHasher::new();
    src.hash(&mut hasher);
    format!("op_{:012x}", hasher.finish())
}

fn cache_file(cache_dir: &Path, relation_id: i64, overpass_url: Option<&str>, default_url: &str) -> PathBuf {
    cache_dir
        .join("preview")
        .join(cache_key(overpass_url, default_url))
        .join(format!("r{relation_id}.json"))
}

fn load_cached_feature(path: &Path, relation_id: i64) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    let payload: Value = serde_json::from_str(&text).ok()?;
    if payload.get("type")?.as_str()? != "Feature" {
        return None;
    }
    let geometry = payload.get("geometry")?.clone();
    let properties = payload.get("properties")?.as_object()?.clone();
    Some(json!({
        "type": "Feature",
        "id": relation_id,
        "geometry": geometry,
        "properties": properties,
    }))
}

fn save_cached_feature(path: &Path, feature: &Value) {
    let Some(dir) = path.parent() else { return };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    if let Ok(text) = serde_json::to_string(feature) {
        let _ = std::fs::write(path, text);
    }
}

/// Drops the bookkeeping keys a cached preview feature carries so the
/// remaining map can be reused as OSM tags.
fn tags_from_feature_properties(props: &serde_json::Map<String, Value>) -> HashMap<String, String> {
    const RESERVED: &[&str] = &[
        "relation_id",
        "osm_type",
        "osm_id",
        "name",
        "preview_generated_at_epoch",
    ];
    props
        .iter()
        .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

fn load_scoped_object_feature(
    geojson_dir: &Path,
    relation_id: i64,
    adm_name: &str,
    admin_level: &str,
    land_only: bool,
) -> Option<Value> {
    let paths = scope_paths(geojson_dir, adm_name, admin_level);
    let dir = if land_only {
        &paths.land_objects_dir
    } else {
        &paths.osm_objects_dir
    };

    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(&format!("__r{relation_id}.geojson")))
                .unwrap_or(false)
        })
        .map(|p| {
            let mtime = std::fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            (mtime, p)
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in candidates {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(raw) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some(feat) = raw.get("features").and_then(|f| f.as_array()).and_then(|a| a.first())
        else {
            continue;
        };
        let Some(geometry) = feat.get("geometry") else {
            continue;
        };
        let mut properties = feat
            .get("properties")
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default();
        let name = properties
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("relation {relation_id}"));
        properties.insert("relation_id".to_string(), json!(relation_id));
        properties.insert("osm_type".to_string(), json!("relation"));
        properties.insert("osm_id".to_string(), json!(relation_id));
        properties.insert("name".to_string(), json!(name));
        return Some(json!({
            "type": "Feature",
            "id": relation_id,
            "geometry": geometry,
            "properties": properties,
        }));
    }
    None
}

/// Reuses the preview geometry cache for a single relation, so the
/// downloader's fetch cascade can skip straight to Overpass only when both
/// the scope cache and this cache are empty.
pub fn get_cached_preview_feature(config: &Config, relation_id: i64, overpass_url: Option<&str>) -> Option<Value> {
    let path = cache_file(&config.cache_dir(), relation_id, overpass_url, &config.overpass_url);
    load_cached_feature(&path, relation_id)
}

/// Read-only: returns whatever land-clipped objects already exist under the
/// scope for the requested ids. Nothing is fetched.
pub fn land_preview_features(
    geojson_dir: &Path,
    relation_ids: &[i64],
    adm_name: &str,
    admin_level: &str,
) -> Value {
    let mut seen = std::collections::HashSet::new();
    let mut features = Vec::new();
    for &rid in relation_ids {
        if rid <= 0 || !seen.insert(rid) {
            continue;
        }
        if let Some(f) = load_scoped_object_feature(geojson_dir, rid, adm_name, admin_level, true) {
            features.push(f);
        }
    }
    json!({ "type": "FeatureCollection", "features": features })
}

/// Returns up to `relation_ids.len()` features. Consults (in order) the
/// scope's `osm_source/objects` directory when a scope is given, then a
/// per-endpoint preview cache file, falling back to a chunked Overpass
/// fetch for whatever ids remain.
pub async fn preview_features(
    config: &Config,
    overpass: &OverpassClient,
    relation_ids: &[i64],
    adm_name: Option<&str>,
    admin_level: Option<&str>,
    overpass_url: Option<&str>,
    timeout_sec: u64,
) -> Value {
    let mut seen = std::collections::HashSet::new();
    let ids: Vec<i64> = relation_ids
        .iter()
        .copied()
        .filter(|id| *id > 0 && seen.insert(*id))
        .collect();
    if ids.is_empty() {
        return json!({ "type": "FeatureCollection", "features": [] });
    }

    let scoped = matches!((adm_name, admin_level), (Some(n), Some(l)) if !n.trim().is_empty() && !l.trim().is_empty());
    let scope_name = adm_name.unwrap_or_default().to_string();
    let scope_level = admin_level.unwrap_or_default().to_string();

    let mut features = Vec::new();
    let mut missing_ids = Vec::new();

    for rid in &ids {
        if scoped {
            if let Some(f) = load_scoped_object_feature(&config.geojson_dir(), *rid, &scope_name, &scope_level, false) {
                features.push(f);
                continue;
            }
        }
        let cache_path = cache_file(&config.cache_dir(), *rid, overpass_url, &config.overpass_url);
        if let Some(cached) = load_cached_feature(&cache_path, *rid) {
            if scoped {
                if let Some(props) = cached.get("properties").and_then(|p| p.as_object()) {
                    let tags = tags_from_feature_properties(props);
                    let geometry = cached.get("geometry").cloned().unwrap_or(Value::Null);
                    let dir = scope_paths(&config.geojson_dir(), &scope_name, &scope_level).osm_objects_dir;
                    let _ = write_object_geojson(&dir, *rid, &tags, &geometry);
                }
            }
            features.push(cached);
            continue;
        }
        missing_ids.push(*rid);
    }

    if missing_ids.is_empty() {
        return json!({ "type": "FeatureCollection", "features": features });
    }

    for chunk in missing_ids.chunks(25) {
        let elements = fetch_chunk_with_fallback(overpass, chunk, overpass_url, timeout_sec).await;
        for &rid in chunk {
            let Some(feature) = build_preview_feature(&elements, rid) else {
                continue;
            };
            if scoped {
                if let Some(props) = feature.get("properties").and_then(|p| p.as_object()) {
                    let tags = tags_from_feature_properties(props);
                    let geometry = feature.get("geometry").cloned().unwrap_or(Value::Null);
                    let dir = scope_paths(&config.geojson_dir(), &scope_name, &scope_level).osm_objects_dir;
                    let _ = write_object_geojson(&dir, rid, &tags, &geometry);
                }
            } else {
                let cache_path = cache_file(&config.cache_dir(), rid, overpass_url, &config.overpass_url);
                save_cached_feature(&cache_path, &feature);
            }
            features.push(feature);
        }
    }

    json!({ "type": "FeatureCollection", "features": features })
}

fn build_preview_feature(elements: &[OverpassElement], relation_id: i64) -> Option<Value> {
    let relation = elements
        .iter()
        .find(|e| matches!(e, OverpassElement::Relation { id, .. } if *id == relation_id))?;
    let tags = relation.tags().cloned().unwrap_or_default();
    let name = {
        let n = preferred_name_from_tags(&tags);
        if n.is_empty() {
            format!("relation {relation_id}")
        } else {
            n
        }
    };
    let mp = build_relation_geometry(elements, relation_id, true).ok()?;

    let mut properties = serde_json::Map::new();
    for (k, v) in &tags {
        properties.insert(k.clone(), json!(v));
    }
    properties.insert("relation_id".to_string(), json!(relation_id));
    properties.insert("osm_type".to_string(), json!("relation"));
    properties.insert("osm_id".to_string(), json!(relation_id));
    properties.insert("name".to_string(), json!(name));

    Some(json!({
        "type": "Feature",
        "id": relation_id,
        "geometry": multipolygon_to_geojson(&mp),
        "properties": properties,
    }))
}

/// Fetches one chunk, retrying without geometry on failure, then by halves,
/// then one relation at a time; ids that still fail are simply absent from
/// the returned element set (the caller skips them).
async fn fetch_chunk_with_fallback(
    overpass: &OverpassClient,
    chunk: &[i64],
    overpass_url: Option<&str>,
    timeout_sec: u64,
) -> Vec<OverpassElement> {
    if let Ok(elements) = fetch_elements(overpass, chunk, overpass_url, timeout_sec, true).await {
        return elements;
    }
    if let Ok(elements) = fetch_elements(overpass, chunk, overpass_url, timeout_sec, false).await {
        return elements;
    }
    if chunk.len() <= 1 {
        return Vec::new();
    }

    let half = (chunk.len() / 2).max(1);
    let mut out = Vec::new();
    for sub in [&chunk[..half], &chunk[half..]] {
        if sub.is_empty() {
            continue;
        }
        match fetch_elements(overpass, sub, overpass_url, timeout_sec, true).await {
            Ok(elements) => out.extend(elements),
            Err(_) => {
                for &rid in sub {
                    if let Ok(elements) =
                        fetch_elements(overpass, &[rid], overpass_url, timeout_sec, true).await
                    {
                        out.extend(elements);
                    }
                }
            }
        }
    }
    out
}

async fn fetch_elements(
    overpass: &OverpassClient,
    ids: &[i64],
    overpass_url: Option<&str>,
    timeout_sec: u64,
    with_geom: bool,
) -> Result<Vec<OverpassElement>, OverpassError> {
    let query = relations_fetch_query(ids, timeout_sec, with_geom);
    let result = overpass.post(&query, overpass_url, Some(timeout_sec)).await?;
    let elements: Vec<OverpassElement> = serde_json::from_value(
        result.payload.get("elements").cloned().unwrap_or(Value::Array(vec![])),
    )
    .unwrap_or_default();
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relations_fetch_query_embeds_ids_and_timeout() {
        let q = relations_fetch_query(&[1, 2, 3], 60, true);
        assert!(q.contains("relation(1,2,3)"));
        assert!(q.contains("[timeout:60]"));
        assert!(q.contains("out body geom;"));
    }

    #[test]
    fn cache_key_is_stable_for_the_same_url() {
        let a = cache_key(Some("https://example.org/api"), "https://default.example.org");
        let b = cache_key(Some("https://example.org/api"), "https://default.example.org");
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_differs_across_endpoints() {
        let a = cache_key(Some("https://one.example.org"), "https://default.example.org");
        let b = cache_key(Some("https://two.example.org"), "https://default.example.org");
        assert_ne!(a, b);
    }

    #[test]
    fn load_cached_feature_round_trips_through_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r1.json");
        let feature = json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
            "properties": {"name": "Testland"},
        });
        save_cached_feature(&path, &feature);
        let loaded = load_cached_feature(&path, 1).unwrap();
        assert_eq!(loaded["properties"]["name"], "Testland");
    }

    #[test]
    fn tags_from_feature_properties_strips_reserved_keys() {
        let mut props = serde_json::Map::new();
        props.insert("name".to_string(), json!("Testland"));
        props.insert("relation_id".to_string(), json!(1));
        props.insert("name:en".to_string(), json!("Testland"));
        let tags = tags_from_feature_properties(&props);
        assert!(!tags.contains_key("name"));
        assert!(!tags.contains_key("relation_id"));
        assert_eq!(tags.get("name:en").unwrap(), "Testland");
    }

    #[test]
    fn land_preview_features_is_empty_without_scope_data() {
        let dir = tempfile::tempdir().unwrap();
        let fc = land_preview_features(dir.path(), &[1, 2], "world", "2");
        assert_eq!(fc["features"].as_array().unwrap().len(), 0);
    }
}
