//! Catalog of administrative-boundary candidates: ids/items listings and
//! free-text search, backed by disk TTL caches over the Overpass API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OverpassError;
use crate::overpass::OverpassClient;
use crate::util::preferred_name_from_tags;

const OVERPASS_AREA_OFFSET: i64 = 3_600_000_000;
const IDS_CACHE_TTL_SEC: f64 = 24.0 * 3600.0;
const ITEMS_CACHE_TTL_SEC: f64 = 24.0 * 3600.0;
const SEARCH_CACHE_TTL_SEC: f64 = 6.0 * 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub relation_id: i64,
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub center: Option<Value>,
    #[serde(default)]
    pub bounds: Option<Value>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn area_id_from_relation(relation_id: i64) -> i64 {
    OVERPASS_AREA_OFFSET + relation_id
}

fn ids_cache_file(cache_dir: &Path, admin_level: &str, parent_relation_id: Option<i64>) -> PathBuf {
    let scope = parent_relation_id.map(|r| format!("r{r}")).unwrap_or_else(|| "world".to_string());
    cache_dir.join("catalog").join(format!("ids__{scope}__al{admin_level}.json"))
}

fn items_cache_file(cache_dir: &Path, admin_level: &str, parent_relation_id: Option<i64>) -> PathBuf {
    let scope = parent_relation_id.map(|r| format!("r{r}")).unwrap_or_else(|| "world".to_string());
    cache_dir.join("catalog").join(format!("items__{scope}__al{admin_level}.json"))
}

fn search_cache_file(cache_dir: &Path, query: &str, admin_level: Option<&str>, limit: usize) -> PathBuf {
    let al = admin_level.unwrap_or("any");
    let mut safe_q: String = query
        .to_lowercase()
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .take(80)
        .collect();
    if safe_q.is_empty() {
        safe_q = "empty".to_string();
    }
    cache_dir
        .join("catalog")
        .join(format!("search__{safe_q}__al{al}__l{limit}.json"))
}

#[derive(Serialize, Deserialize)]
struct IdsCachePayload {
    updated_at_epoch: f64,
    relation_ids: Vec<i64>,
}

#[derive(Serialize, Deserialize)]
struct ItemsCachePayload {
    updated_at_epoch: f64,
    items: Vec<CatalogItem>,
}

fn load_ids_cache(path: &Path, max_age_sec: Option<f64>) -> Option<Vec<i64>> {
    let text = std::fs::read_to_string(path).ok()?;
    let payload: IdsCachePayload = serde_json::from_str(&text).ok()?;
    if let Some(max_age) = max_age_sec {
        if now_epoch() - payload.updated_at_epoch > max_age {
            return None;
        }
    }
    let mut ids: Vec<i64> = payload.relation_ids.into_iter().filter(|id| *id > 0).collect();
    ids.sort_unstable();
    ids.dedup();
    Some(ids)
}

fn save_ids_cache(path: &Path, relation_ids: &[i64]) {
    let Some(dir) = path.parent() else { return };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let payload = IdsCachePayload {
        updated_at_epoch: now_epoch(),
        relation_ids: relation_ids.to_vec(),
    };
    if let Ok(text) = serde_json::to_string(&payload) {
        let _ = std::fs::write(path, text);
    }
}

fn load_items_cache(path: &Path, max_age_sec: Option<f64>) -> Option<Vec<CatalogItem>> {
    let text = std::fs::read_to_string(path).ok()?;
    let payload: ItemsCachePayload = serde_json::from_str(&text).ok()?;
    if let Some(max_age) = max_age_sec {
        if now_epoch() - payload.updated_at_epoch > max_age {
            return None;
        }
    }
    Some(payload.items)
}

fn save_items_cache(path: &Path, items: &[CatalogItem]) {
    let Some(dir) = path.parent() else { return };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let payload = ItemsCachePayload {
        updated_at_epoch: now_epoch(),
        items: items.to_vec(),
    };
    if let Ok(text) = serde_json::to_string(&payload) {
        let _ = std::fs::write(path, text);
    }
}

fn parse_relation_items(elements: &[Value]) -> Vec<CatalogItem> {
    let mut out = Vec::new();
    for el in elements {
        if el.get("type").and_then(|v| v.as_str()).map(|s| s.to_lowercase()) != Some("relation".to_string()) {
            continue;
        }
        let Some(rid) = el.get("id").and_then(|v| v.as_i64()) else {
            continue;
        };
        let tags: HashMap<String, String> = el
            .get("tags")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let name = {
            let n = preferred_name_from_tags(&tags);
            if n.is_empty() { format!("relation {rid}") } else { n }
        };
        out.push(CatalogItem {
            relation_id: rid,
            name,
            tags,
            center: el.get("center").filter(|v| v.is_object()).cloned(),
            bounds: el.get("bounds").filter(|v| v.is_object()).cloned(),
        });
    }
    out
}

fn elements_of(payload: &Value) -> Vec<Value> {
    payload
        .get("elements")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Worldwide countries list: one Overpass call, `out tags;`. 24h TTL cache
/// with stale-on-failure fallback.
pub async fn list_countries_items_fast(
    overpass: &OverpassClient,
    cache_dir: &Path,
    timeout_sec: u64,
) -> Result<Vec<CatalogItem>, OverpassError> {
    let cache_path = items_cache_file(cache_dir, "2", None);
    if let Some(fresh) = load_items_cache(&cache_path, Some(ITEMS_CACHE_TTL_SEC)) {
        return Ok(fresh);
    }
    let stale = load_items_cache(&cache_path, None);

    let query = format!(
        "[out:json][timeout:{timeout_sec}];\nrel[\"boundary\"=\"administrative\"][\"admin_level\"=\"2\"][\"type\"=\"boundary\"];\nout tags;"
    );
    let result = match overpass.post(&query, None, Some(timeout_sec)).await {
        Ok(r) => r,
        Err(e) => return stale.ok_or(e),
    };

    let mut out = parse_relation_items(&elements_of(&result.payload));
    for item in &mut out {
        item.center = None;
        item.bounds = None;
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    save_items_cache(&cache_path, &out);
    Ok(out)
}

/// Children of `parent_relation_id` at `admin_level`, trying (in order) an
/// explicit `map_to_area`, an area-offset id, then relation-member traversal.
pub async fn list_parent_items_fast(
    overpass: &OverpassClient,
    cache_dir: &Path,
    admin_level: &str,
    parent_relation_id: i64,
    timeout_sec: u64,
) -> Result<Vec<CatalogItem>, OverpassError> {
    let cache_path = items_cache_file(cache_dir, admin_level, Some(parent_relation_id));
    if let Some(fresh) = load_items_cache(&cache_path, Some(ITEMS_CACHE_TTL_SEC)) {
        return Ok(fresh);
    }
    let stale = load_items_cache(&cache_path, None);

    let area_id = area_id_from_relation(parent_relation_id);
    let queries = [
        format!(
            "[out:json][timeout:{timeout_sec}];\nrelation({parent_relation_id});\nmap_to_area->.a;\nrel(area.a)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{admin_level}\"][\"type\"=\"boundary\"];\nout tags;"
        ),
        format!(
            "[out:json][timeout:{timeout_sec}];\narea({area_id})->.a;\nrel(area.a)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{admin_level}\"][\"type\"=\"boundary\"];\nout tags;"
        ),
        format!(
            "[out:json][timeout:{timeout_sec}];\nrelation({parent_relation_id})->.p;\nrel(r.p)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{admin_level}\"][\"type\"=\"boundary\"];\nout tags;"
        ),
    ];

    let mut last_err = None;
    let mut payload = None;
    for q in &queries {
        match overpass.post(q, None, Some(timeout_sec)).await {
            Ok(r) => {
                payload = Some(r.payload);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }

    let Some(payload) = payload else {
        return stale.ok_or_else(|| last_err.unwrap_or(OverpassError::NoEndpoints));
    };

    let mut out = parse_relation_items(&elements_of(&payload));
    for item in &mut out {
        item.center = None;
        item.bounds = None;
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    save_items_cache(&cache_path, &out);
    Ok(out)
}

/// Relation ids at `admin_level`, optionally scoped to children of
/// `parent_relation_id`. 24h TTL cache with stale-on-failure fallback.
pub async fn list_relation_ids(
    overpass: &OverpassClient,
    cache_dir: &Path,
    admin_level: &str,
    parent_relation_id: Option<i64>,
    timeout_sec: u64,
) -> Result<Vec<i64>, OverpassError> {
    let cache_path = ids_cache_file(cache_dir, admin_level, parent_relation_id);
    if let Some(fresh) = load_ids_cache(&cache_path, Some(IDS_CACHE_TTL_SEC)) {
        return Ok(fresh);
    }
    let stale = load_ids_cache(&cache_path, None);

    let payload = if let Some(parent) = parent_relation_id {
        let area_id = area_id_from_relation(parent);
        let q_area = format!(
            "[out:json][timeout:{timeout_sec}];\narea({area_id})->.a;\nrel(area.a)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{admin_level}\"];\nout ids;"
        );
        let q_members = format!(
            "[out:json][timeout:{timeout_sec}];\nrelation({parent})->.p;\nrel(r.p)[\"boundary\"=\"administrative\"][\"admin_level\"=\"{admin_level}\"];\nout ids;"
        );
        match overpass.post(&q_area, None, Some(timeout_sec)).await {
            Ok(r) => r.payload,
            Err(_) => match overpass.post(&q_members, None, Some(timeout_sec)).await {
                Ok(r) => r.payload,
                Err(e) => return stale.ok_or(e),
            },
        }
    } else {
        let q = format!(
            "[out:json][timeout:{timeout_sec}];\nrel[\"boundary\"=\"administrative\"][\"admin_level\"=\"{admin_level}\"];\nout ids;"
        );
        match overpass.post(&q, None, Some(timeout_sec)).await {
            Ok(r) => r.payload,
            Err(e) => return stale.ok_or(e),
        }
    };

    let mut ids: Vec<i64> = elements_of(&payload)
        .iter()
        .filter(|el| el.get("type").and_then(|v| v.as_str()) == Some("relation"))
        .filter_map(|el| el.get("id").and_then(|v| v.as_i64()))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    save_ids_cache(&cache_path, &ids);
    Ok(ids)
}

/// Name/tags/center/bounds for a set of relation ids, chunked at 120 with a
/// bb-capable query falling back to a center-only one, then per-relation on
/// repeated chunk failure.
pub async fn fetch_relation_details(
    overpass: &OverpassClient,
    relation_ids: &[i64],
    timeout_sec: u64,
) -> Vec<CatalogItem> {
    let ids: Vec<i64> = relation_ids.iter().copied().filter(|id| *id > 0).collect();
    if ids.is_empty() {
        return Vec::new();
    }

    async fn fetch_chunk(
        overpass: &OverpassClient,
        chunk: &[i64],
        timeout_sec: u64,
    ) -> Result<Vec<CatalogItem>, OverpassError> {
        let joined = chunk.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        let q1 = format!("[out:json][timeout:{timeout_sec}];\nrelation({joined});\nout tags bb center;");
        let q2 = format!("[out:json][timeout:{timeout_sec}];\nrelation({joined});\nout tags center;");
        let payload = match overpass.post(&q1, None, Some(timeout_sec)).await {
            Ok(r) => r.payload,
            Err(_) => overpass.post(&q2, None, Some(timeout_sec)).await?.payload,
        };
        Ok(parse_relation_items(&elements_of(&payload)))
    }

    let mut out = Vec::new();
    for chunk in ids.chunks(120) {
        match fetch_chunk(overpass, chunk, timeout_sec).await {
            Ok(items) => out.extend(items),
            Err(_) => {
                for &rid in chunk {
                    if let Ok(items) = fetch_chunk(overpass, &[rid], timeout_sec).await {
                        out.extend(items);
                    }
                }
            }
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn is_iso_like(s: &str) -> bool {
    (2..=3).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Free-text search. `admin_level == Some("2")` takes a local scoring path
/// over the cached countries list; any other level queries Overpass with a
/// multilingual/ISO regex union.
pub async fn search_admin_areas(
    overpass: &OverpassClient,
    cache_dir: &Path,
    query: &str,
    admin_level: Option<&str>,
    limit: usize,
    timeout_sec: u64,
) -> Result<Vec<CatalogItem>, OverpassError> {
    let qtxt = query.trim();
    if qtxt.is_empty() {
        return Ok(Vec::new());
    }
    let limit = limit.max(1);
    let cache_path = search_cache_file(cache_dir, qtxt, admin_level, limit);
    if let Some(cached) = load_items_cache(&cache_path, Some(SEARCH_CACHE_TTL_SEC)) {
        return Ok(cached.into_iter().take(limit).collect());
    }

    let qtxt_upper = qtxt.to_uppercase();
    let iso_query = is_iso_like(&qtxt_upper).then(|| qtxt_upper.clone());

    if admin_level == Some("2") {
        let items = list_countries_items_fast(overpass, cache_dir, timeout_sec).await?;
        let q_norm = qtxt.to_lowercase();
        let mut scored: Vec<(i32, CatalogItem)> = Vec::new();
        for item in items {
            let haystacks_lower: Vec<String> = [
                item.name.to_lowercase(),
                item.tags.get("name:en").cloned().unwrap_or_default().to_lowercase(),
                item.tags.get("int_name").cloned().unwrap_or_default().to_lowercase(),
                item.tags.get("official_name").cloned().unwrap_or_default().to_lowercase(),
            ]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
            let haystacks_upper: Vec<String> = [
                item.tags.get("ISO3166-1").cloned().unwrap_or_default(),
                item.tags.get("ISO3166-1:alpha2").cloned().unwrap_or_default(),
                item.tags.get("ISO3166-1:alpha3").cloned().unwrap_or_default(),
            ]
            .into_iter()
            .map(|s| s.to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

            let mut matched = haystacks_lower.iter().any(|h| h.contains(&q_norm));
            if let Some(iso) = &iso_query {
                matched = matched || haystacks_upper.iter().any(|h| h == iso);
            }
            if !matched {
                continue;
            }

            let mut score = 100;
            if item.name.to_lowercase().starts_with(&q_norm) {
                score -= 25;
            }
            if let Some(iso) = &iso_query {
                if haystacks_upper.iter().any(|h| h == iso) {
                    score -= 40;
                }
            }
            scored.push((score, item));
        }
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        let out: Vec<CatalogItem> = scored.into_iter().take(limit).map(|(_, item)| item).collect();
        save_items_cache(&cache_path, &out);
        return Ok(out);
    }

    let escaped = qtxt.replace('\\', "\\\\").replace('"', "\\\"");
    let al_clause = admin_level.map(|al| format!("[\"admin_level\"=\"{al}\"]")).unwrap_or_default();

    let mut bodies = vec![
        format!("rel[\"boundary\"=\"administrative\"]{al_clause}[name~\"{escaped}\",i];"),
        format!("rel[\"boundary\"=\"administrative\"]{al_clause}[\"name:en\"~\"{escaped}\",i];"),
        format!("rel[\"boundary\"=\"administrative\"]{al_clause}[int_name~\"{escaped}\",i];"),
        format!("rel[\"boundary\"=\"administrative\"]{al_clause}[official_name~\"{escaped}\",i];"),
    ];
    if is_iso_like(&qtxt_upper) {
        bodies.push(format!("rel[\"boundary\"=\"administrative\"]{al_clause}[\"ISO3166-1\"=\"{qtxt_upper}\"];"));
        bodies.push(format!("rel[\"boundary\"=\"administrative\"]{al_clause}[\"ISO3166-1:alpha2\"=\"{qtxt_upper}\"];"));
        bodies.push(format!("rel[\"boundary\"=\"administrative\"]{al_clause}[\"ISO3166-1:alpha3\"=\"{qtxt_upper}\"];"));
    }
    let body = bodies.join("\n");

    let q1 = format!("[out:json][timeout:{timeout_sec}];\n(\n{body}\n);\nout tags bb center;");
    let q2 = format!("[out:json][timeout:{timeout_sec}];\n(\n{body}\n);\nout tags center;");
    let payload = match overpass.post(&q1, None, Some(timeout_sec)).await {
        Ok(r) => r.payload,
        Err(_) => overpass.post(&q2, None, Some(timeout_sec)).await?.payload,
    };

    let mut out: Vec<CatalogItem> = parse_relation_items(&elements_of(&payload))
        .into_iter()
        .filter(|item| !item.name.is_empty())
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out.truncate(limit);
    save_items_cache(&cache_path, &out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_cache_file_sanitizes_query_to_safe_chars() {
        let dir = Path::new("/data/cache");
        let p = search_cache_file(dir, "Re/?! public", Some("2"), 10);
        assert_eq!(
            p,
            Path::new("/data/cache/catalog/search__republic__al2__l10.json")
        );
    }

    #[test]
    fn search_cache_file_falls_back_to_empty_marker() {
        let dir = Path::new("/data/cache");
        let p = search_cache_file(dir, "???", None, 5);
        assert_eq!(p, Path::new("/data/cache/catalog/search__empty__alany__l5.json"));
    }

    #[test]
    fn ids_cache_round_trips_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let path = ids_cache_file(dir.path(), "2", None);
        save_ids_cache(&path, &[3, 1, 1, 2]);
        let loaded = load_ids_cache(&path, None).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn ids_cache_respects_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = ids_cache_file(dir.path(), "2", None);
        let payload = IdsCachePayload {
            updated_at_epoch: 0.0,
            relation_ids: vec![1],
        };
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_string(&payload).unwrap()).unwrap();
        assert!(load_ids_cache(&path, Some(1.0)).is_none());
        assert!(load_ids_cache(&path, None).is_some());
    }

    #[test]
    fn parse_relation_items_skips_non_relations_and_missing_ids() {
        let elements = vec![
            serde_json::json!({"type": "way", "id": 1}),
            serde_json::json!({"type": "relation", "tags": {"name": "Testland"}}),
            serde_json::json!({"type": "relation", "id": 42, "tags": {"name": "Testland"}}),
        ];
        let items = parse_relation_items(&elements);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].relation_id, 42);
        assert_eq!(items[0].name, "Testland");
    }

    #[test]
    fn is_iso_like_accepts_two_and_three_letter_codes() {
        assert!(is_iso_like("RU"));
        assert!(is_iso_like("USA"));
        assert!(!is_iso_like("USAA"));
        assert!(!is_iso_like("12"));
    }
}
