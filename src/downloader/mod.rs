//! Per-job orchestrator: the prelude/per-relation-loop/epilogue pipeline
//! that fetches, builds, optionally clips, and persists each relation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{JobError, LandPolygonsError};
use crate::geometry::{build_relation_geometry, count_polygons, count_vertices, multipolygon_from_geojson, multipolygon_to_geojson};
use crate::land::{clip_to_land, download_land_polygons, LandDataset};
use crate::overpass::OverpassClient;
use crate::preview::get_cached_preview_feature;
use crate::storage::{
    load_manifest, rebuild_combined, save_json, save_manifest, scope_paths, write_object_geojson,
    ManifestObjectEntry,
};
use crate::util::{preferred_name_from_tags, slugify};

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

const RESERVED_PROPERTY_KEYS: &[&str] = &[
    "osm_type",
    "osm_id",
    "relation_id",
    "name",
    "preview_generated_at_epoch",
];

fn tags_from_properties(props: &serde_json::Map<String, Value>) -> HashMap<String, String> {
    props
        .iter()
        .filter(|(k, _)| !RESERVED_PROPERTY_KEYS.contains(&k.as_str()))
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

fn relation_fetch_query(relation_id: i64, timeout_sec: u64, with_geom: bool) -> String {
    let out_mode = if with_geom { "out body geom;" } else { "out body;" };
    format!(
        "[out:json][timeout:{timeout_sec}];\nrelation({relation_id})->.r;\n(.r;>;);\n{out_mode}"
    )
}

/// Loads a previously exported object file for `relation_id` (by mtime,
/// newest first), returning its geometry, reusable tags, and path.
fn load_cached_object(objects_dir: &Path, relation_id: i64) -> Option<(geo_types::MultiPolygon<f64>, HashMap<String, String>, PathBuf)> {
    let mut candidates: Vec<(SystemTime, PathBuf)> = std::fs::read_dir(objects_dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| {
                    n.starts_with(&format!("r{relation_id}__")) || n.ends_with(&format!("__r{relation_id}.geojson"))
                })
                .unwrap_or(false)
        })
        .map(|p| {
            let mtime = std::fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            (mtime, p)
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in candidates {
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        let Ok(raw) = serde_json::from_str::<Value>(&text) else { continue };
        let Some(feat) = raw.get("features").and_then(|f| f.as_array()).and_then(|a| a.first()) else {
            continue;
        };
        let Some(geometry) = feat.get("geometry") else { continue };
        let props = feat.get("properties").and_then(|p| p.as_object()).cloned().unwrap_or_default();
        let osm_id = props.get("osm_id").and_then(|v| v.as_i64()).unwrap_or(relation_id);
        if osm_id != relation_id {
            continue;
        }
        let Some(mp) = multipolygon_from_geojson(geometry) else { continue };
        if mp.0.is_empty() {
            continue;
        }
        let tags = tags_from_properties(&props);
        return Some((mp, tags, path));
    }
    None
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Downloads the land-polygon archive if it is not already present on disk,
/// then loads it into memory.
async fn ensure_land_polygons(
    config: &Config,
    land: &LandDataset,
    emit: &mut impl FnMut(&str, Value),
    should_cancel: &mut impl FnMut() -> bool,
) -> Result<(), LandPolygonsError> {
    let zip_path = land.zip_path().to_path_buf();
    if !zip_path.exists() {
        let http = reqwest::Client::new();
        let urls = config.land_polygons_urls.clone();
        let download_timeout_sec = config.download_timeout_sec;
        let now = now_epoch() as i64;
        let mut on_progress = |done: u64, total: Option<u64>, elapsed: f64| {
            emit(
                "land_polygons_download_progress",
                json!({ "done_bytes": done, "total_bytes": total, "elapsed_sec": elapsed }),
            );
        };
        download_land_polygons(&http, &urls, &zip_path, download_timeout_sec, now, &mut on_progress, &mut *should_cancel).await?;
    }
    land.ensure_loaded().map(|_| ())
}

/// Runs the full per-relation download pipeline for a scope, emitting
/// progress events as it goes. Returns `Err` only for job-wide failures
/// (land dataset unavailable); individual relation failures are reported
/// through `object_done{ok:false}` and counted in the summary.
pub async fn download_admin_boundaries(
    config: &Config,
    overpass: &OverpassClient,
    land: &LandDataset,
    adm_name: &str,
    admin_level: &str,
    relation_ids: &[i64],
    relation_names: &HashMap<i64, String>,
    clip_land: bool,
    force_refresh_osm_source: bool,
    fix_antimeridian: bool,
    overpass_url: Option<&str>,
    mut emit: impl FnMut(&str, Value),
    mut should_cancel: impl FnMut() -> bool,
) -> Result<(), JobError> {
    let paths = scope_paths(&config.geojson_dir(), adm_name, admin_level);
    let mut manifest = load_manifest(&paths.manifest_path);

    emit("stage", json!({ "stage": "start", "adm_name": adm_name, "admin_level": admin_level }));
    emit(
        "log",
        json!({
            "message": if force_refresh_osm_source {
                "OSM source cache mode: force refresh (ignore cached object files)"
            } else {
                "OSM source cache mode: reuse cached object files when valid"
            }
        }),
    );
    let t_job0 = Instant::now();

    if clip_land {
        emit("stage", json!({ "stage": "land_polygons.ensure" }));
        ensure_land_polygons(config, land, &mut emit, &mut should_cancel).await?;
    }

    let total = relation_ids.len();
    let mut ok = 0u64;
    let mut failed = 0u64;
    let mut clip_cache_hits = 0u64;
    let mut clip_cache_misses = 0u64;
    let mut land_object_cache_hits = 0u64;
    let mut land_object_cache_misses = 0u64;
    emit("overall_progress", json!({ "done": 0, "total": total, "ok": 0, "failed": 0 }));

    for (idx, &rid) in relation_ids.iter().enumerate() {
        if should_cancel() {
            emit("done", json!({ "cancelled": true }));
            return Ok(());
        }

        let provided_name = relation_names.get(&rid).cloned().unwrap_or_default();
        let cached_name = manifest.objects.get(&rid.to_string()).map(|o| o.name.clone()).unwrap_or_default();
        let obj_name = if !provided_name.is_empty() {
            provided_name.clone()
        } else if !cached_name.is_empty() {
            cached_name
        } else {
            format!("relation {rid}")
        };
        emit(
            "object_started",
            json!({ "relation_id": rid, "name": obj_name, "index": idx + 1, "total": total }),
        );
        let t0 = Instant::now();

        match process_one_relation(
            config,
            overpass,
            land,
            &paths,
            rid,
            &obj_name,
            clip_land,
            force_refresh_osm_source,
            fix_antimeridian,
            overpass_url,
            &mut clip_cache_hits,
            &mut clip_cache_misses,
            &mut land_object_cache_hits,
            &mut land_object_cache_misses,
            &mut emit,
        )
        .await
        {
            Ok(object) => {
                emit("object_stats", json!({ "relation_id": rid, "stats": object.stats_json(t0.elapsed().as_secs_f64()) }));
                manifest.objects.insert(
                    rid.to_string(),
                    ManifestObjectEntry {
                        relation_id: rid,
                        name: object.name.clone(),
                        slug: slugify(&object.name, 80),
                        updated_at_epoch: now_epoch(),
                        osm_source_file: object
                            .osm_path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default(),
                        land_only_file: object
                            .land_path
                            .as_ref()
                            .and_then(|p| p.file_name())
                            .map(|n| n.to_string_lossy().to_string()),
                    },
                );
                ok += 1;
                emit("object_done", json!({ "relation_id": rid, "name": object.name, "ok": true }));
            }
            Err(e) => {
                failed += 1;
                emit("object_done", json!({ "relation_id": rid, "name": obj_name, "ok": false, "error": e }));
            }
        }
        emit("overall_progress", json!({ "done": idx + 1, "total": total, "ok": ok, "failed": failed }));
    }

    manifest.adm_name = adm_name.to_string();
    manifest.admin_level = admin_level.to_string();
    manifest.updated_at_epoch = now_epoch();
    save_manifest(&paths.manifest_path, &manifest)?;

    emit("stage", json!({ "stage": "rebuild_combined" }));
    rebuild_combined(&paths.osm_objects_dir, &paths.osm_combined_path)?;
    if clip_land {
        rebuild_combined(&paths.land_objects_dir, &paths.land_combined_path)?;
    }

    let stats = json!({
        "adm_name": adm_name,
        "admin_level": admin_level,
        "updated_at_epoch": now_epoch(),
        "job_elapsed_sec": t_job0.elapsed().as_secs_f64(),
        "selected_count": total,
        "ok": ok,
        "failed": failed,
        "clip_cache_hits": clip_cache_hits,
        "clip_cache_misses": clip_cache_misses,
    });
    save_json(&paths.stats_path, &stats)?;

    if clip_land {
        emit(
            "log",
            json!({ "message": format!("Clip cache stats: hits={clip_cache_hits}, misses={clip_cache_misses}") }),
        );
        emit(
            "log",
            json!({
                "message": format!(
                    "Land-only object cache: hits={land_object_cache_hits}, misses={land_object_cache_misses}"
                )
            }),
        );
    }
    emit("done", json!({ "stats": stats }));
    Ok(())
}

struct ProcessedObject {
    name: String,
    osm_path: PathBuf,
    land_path: Option<PathBuf>,
    poly_count: usize,
    vertex_count: usize,
    clipped_poly_count: Option<usize>,
    clipped_vertex_count: Option<usize>,
    clipped_empty: bool,
    used_url: String,
    used_elapsed: f64,
    t_fetch: f64,
    t_build: f64,
    t_write: f64,
    t_clip: Option<f64>,
}

impl ProcessedObject {
    fn stats_json(&self, elapsed_sec: f64) -> Value {
        json!({
            "name": self.name,
            "osm_source_path": self.osm_path.to_string_lossy(),
            "land_only_path": self.land_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            "clipped_empty": self.clipped_empty,
            "polygons": self.poly_count,
            "vertices": self.vertex_count,
            "land_only_polygons": self.clipped_poly_count,
            "land_only_vertices": self.clipped_vertex_count,
            "overpass_used": self.used_url,
            "overpass_elapsed_sec": self.used_elapsed,
            "time_fetch_sec": self.t_fetch,
            "time_build_sec": self.t_build,
            "time_write_sec": self.t_write,
            "time_clip_sec": self.t_clip,
            "osm_source_bytes": file_size(&self.osm_path),
            "land_only_bytes": self.land_path.as_deref().and_then(file_size),
            "elapsed_sec": elapsed_sec,
            "updated_at_epoch": now_epoch(),
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_one_relation(
    config: &Config,
    overpass: &OverpassClient,
    land: &LandDataset,
    paths: &crate::storage::ScopePaths,
    rid: i64,
    obj_name: &str,
    clip_land: bool,
    force_refresh_osm_source: bool,
    fix_antimeridian: bool,
    overpass_url: Option<&str>,
    clip_cache_hits: &mut u64,
    clip_cache_misses: &mut u64,
    land_object_cache_hits: &mut u64,
    land_object_cache_misses: &mut u64,
    emit: &mut impl FnMut(&str, Value),
) -> Result<ProcessedObject, String> {
    let t_fetch0 = Instant::now();
    let mut used_url = String::new();
    let mut used_elapsed = 0.0;
    let mut tags: HashMap<String, String>;
    let mut t_build = 0.0;
    let t_write;
    let osm_path: PathBuf;
    let geom: geo_types::MultiPolygon<f64>;
    let osm_reused_from_cache;

    if let Some((cached_geom, cached_tags, cached_path)) =
        (!force_refresh_osm_source).then(|| load_cached_object(&paths.osm_objects_dir, rid)).flatten()
    {
        emit("object_phase", json!({ "relation_id": rid, "phase": "use_osm_source_cache" }));
        geom = cached_geom;
        tags = cached_tags;
        osm_path = cached_path;
        osm_reused_from_cache = true;
        let t_fetch = t_fetch0.elapsed().as_secs_f64();
        t_write = 0.0;
        return finish_relation(
            land, paths, rid, obj_name, clip_land, force_refresh_osm_source,
            clip_cache_hits, clip_cache_misses, land_object_cache_hits, land_object_cache_misses,
            emit, geom, tags, osm_path, osm_reused_from_cache, used_url, used_elapsed, t_fetch, t_build, t_write,
        )
        .await;
    }

    if let Some(cached) = get_cached_preview_feature(config, rid, overpass_url) {
        emit("object_phase", json!({ "relation_id": rid, "phase": "use_preview_cache" }));
        let props = cached.get("properties").and_then(|p| p.as_object()).cloned().unwrap_or_default();
        tags = tags_from_properties(&props);
        emit("object_phase", json!({ "relation_id": rid, "phase": "build_geometry" }));
        let t_build0 = Instant::now();
        let Some(parsed) = cached.get("geometry").and_then(multipolygon_from_geojson) else {
            return Err("preview cache had unparsable geometry".to_string());
        };
        geom = parsed;
        t_build = t_build0.elapsed().as_secs_f64();
        used_url = "preview_cache".to_string();
        let t_fetch = t_fetch0.elapsed().as_secs_f64();

        emit("object_phase", json!({ "relation_id": rid, "phase": "write_osm_source" }));
        let t_write0 = Instant::now();
        osm_path = write_object_geojson(&paths.osm_objects_dir, rid, &tags, &multipolygon_to_geojson(&geom))
            .map_err(|e| e.to_string())?;
        t_write = t_write0.elapsed().as_secs_f64();
        osm_reused_from_cache = false;

        return finish_relation(
            land, paths, rid, obj_name, clip_land, force_refresh_osm_source,
            clip_cache_hits, clip_cache_misses, land_object_cache_hits, land_object_cache_misses,
            emit, geom, tags, osm_path, osm_reused_from_cache, used_url, used_elapsed, t_fetch, t_build, t_write,
        )
        .await;
    }

    emit("object_phase", json!({ "relation_id": rid, "phase": "fetch_overpass" }));
    let query = relation_fetch_query(rid, 180, true);
    let result = match overpass.post(&query, overpass_url, Some(180)).await {
        Ok(r) => r,
        Err(_) => {
            let fallback = relation_fetch_query(rid, 180, false);
            overpass.post(&fallback, overpass_url, Some(180)).await.map_err(|e| e.to_string())?
        }
    };
    let t_fetch = t_fetch0.elapsed().as_secs_f64();
    used_url = result.used_url;
    used_elapsed = result.elapsed_sec;

    let elements: Vec<crate::overpass::OverpassElement> =
        serde_json::from_value(result.payload.get("elements").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|_| "Overpass elements missing".to_string())?;

    tags = elements
        .iter()
        .find(|e| matches!(e, crate::overpass::OverpassElement::Relation { id, .. } if *id == rid))
        .and_then(|e| e.tags())
        .cloned()
        .unwrap_or_default();

    emit("object_phase", json!({ "relation_id": rid, "phase": "build_geometry" }));
    let t_build0 = Instant::now();
    geom = build_relation_geometry(&elements, rid, fix_antimeridian).map_err(|e| e.to_string())?;
    t_build = t_build0.elapsed().as_secs_f64();

    emit("object_phase", json!({ "relation_id": rid, "phase": "write_osm_source" }));
    let t_write0 = Instant::now();
    osm_path = write_object_geojson(&paths.osm_objects_dir, rid, &tags, &multipolygon_to_geojson(&geom))
        .map_err(|e| e.to_string())?;
    t_write = t_write0.elapsed().as_secs_f64();
    osm_reused_from_cache = false;

    finish_relation(
        land, paths, rid, obj_name, clip_land, force_refresh_osm_source,
        clip_cache_hits, clip_cache_misses, land_object_cache_hits, land_object_cache_misses,
        emit, geom, tags, osm_path, osm_reused_from_cache, used_url, used_elapsed, t_fetch, t_build, t_write,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn finish_relation(
    land: &LandDataset,
    paths: &crate::storage::ScopePaths,
    rid: i64,
    obj_name: &str,
    clip_land: bool,
    force_refresh_osm_source: bool,
    clip_cache_hits: &mut u64,
    clip_cache_misses: &mut u64,
    land_object_cache_hits: &mut u64,
    land_object_cache_misses: &mut u64,
    emit: &mut impl FnMut(&str, Value),
    geom: geo_types::MultiPolygon<f64>,
    tags: HashMap<String, String>,
    osm_path: PathBuf,
    osm_reused_from_cache: bool,
    used_url: String,
    used_elapsed: f64,
    t_fetch: f64,
    t_build: f64,
    t_write: f64,
) -> Result<ProcessedObject, String> {
    let poly_count = count_polygons(&geom);
    let vertex_count = count_vertices(&geom);

    let mut land_path = None;
    let mut clipped_empty = false;
    let mut clipped_poly_count = None;
    let mut clipped_vertex_count = None;
    let mut t_clip = None;

    if clip_land {
        emit("object_phase", json!({ "relation_id": rid, "phase": "clip_land" }));
        let t_clip0 = Instant::now();
        let can_reuse = osm_reused_from_cache && !force_refresh_osm_source;
        let cached_land = can_reuse.then(|| load_cached_object(&paths.land_objects_dir, rid)).flatten();

        if let Some((clipped, _, cached_path)) = cached_land {
            emit("object_phase", json!({ "relation_id": rid, "phase": "use_land_only_cache" }));
            *land_object_cache_hits += 1;
            clipped_poly_count = Some(count_polygons(&clipped));
            clipped_vertex_count = Some(count_vertices(&clipped));
            land_path = Some(cached_path);
            emit("object_clipped_ready", json!({ "relation_id": rid, "name": obj_name }));
            t_clip = Some(t_clip0.elapsed().as_secs_f64());
        } else {
            *land_object_cache_misses += 1;
            let bbox = geom_bbox(&geom);
            let (land_union, hit) = land.load_land_union_for_bbox(bbox, 1.0).map_err(|e| e.to_string())?;
            if hit {
                *clip_cache_hits += 1;
            } else {
                *clip_cache_misses += 1;
            }
            emit("clip_cache_stats", json!({ "hits": *clip_cache_hits, "misses": *clip_cache_misses }));

            let clipped = clip_to_land(&geom, &land_union);
            t_clip = Some(t_clip0.elapsed().as_secs_f64());
            if clipped.0.is_empty() {
                clipped_empty = true;
            } else {
                clipped_poly_count = Some(count_polygons(&clipped));
                clipped_vertex_count = Some(count_vertices(&clipped));
                let written = write_object_geojson(&paths.land_objects_dir, rid, &tags, &multipolygon_to_geojson(&clipped))
                    .map_err(|e| e.to_string())?;
                land_path = Some(written);
                emit("object_clipped_ready", json!({ "relation_id": rid, "name": obj_name }));
            }
        }
    }

    let name = {
        let n = preferred_name_from_tags(&tags);
        if !n.is_empty() { n } else if !obj_name.is_empty() { obj_name.to_string() } else { format!("relation {rid}") }
    };

    Ok(ProcessedObject {
        name,
        osm_path,
        land_path,
        poly_count,
        vertex_count,
        clipped_poly_count,
        clipped_vertex_count,
        clipped_empty,
        used_url,
        used_elapsed,
        t_fetch,
        t_build,
        t_write,
        t_clip,
    })
}

fn geom_bbox(mp: &geo_types::MultiPolygon<f64>) -> (f64, f64, f64, f64) {
    use geo::BoundingRect;
    let rect = mp.bounding_rect().unwrap_or(geo_types::Rect::new(
        geo_types::Coord { x: 0.0, y: 0.0 },
        geo_types::Coord { x: 0.0, y: 0.0 },
    ));
    (rect.min().x, rect.min().y, rect.max().x, rect.max().y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_fetch_query_embeds_id_and_out_mode() {
        let q = relation_fetch_query(42, 90, true);
        assert!(q.contains("relation(42)"));
        assert!(q.contains("out body geom;"));

        let q2 = relation_fetch_query(42, 90, false);
        assert!(q2.contains("out body;"));
    }

    #[test]
    fn tags_from_properties_strips_reserved_keys() {
        let mut props = serde_json::Map::new();
        props.insert("name".to_string(), json!("Testland"));
        props.insert("osm_id".to_string(), json!(1));
        props.insert("name:en".to_string(), json!("Testland"));
        let tags = tags_from_properties(&props);
        assert_eq!(tags.len(), 1);
        assert!(tags.contains_key("name:en"));
    }

    #[test]
    fn load_cached_object_returns_none_for_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_cached_object(dir.path(), 1).is_none());
    }
}
