//! Scope-to-path mapping, atomic writes, and per-object file naming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::util::{iso2_from_tags, preferred_english_name_from_tags, slugify};

#[derive(Debug, Clone)]
pub struct ScopePaths {
    pub base_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub stats_path: PathBuf,
    pub osm_objects_dir: PathBuf,
    pub osm_combined_path: PathBuf,
    pub land_objects_dir: PathBuf,
    pub land_combined_path: PathBuf,
}

/// Pure mapping from a scope to its directory tree.
pub fn scope_paths(geojson_dir: &Path, adm_name: &str, admin_level: &str) -> ScopePaths {
    let base = geojson_dir
        .join(adm_name)
        .join(format!("admin_level={admin_level}"));
    let stem = format!("{adm_name}_admin_level_{admin_level}");
    ScopePaths {
        manifest_path: base.join("manifest.json"),
        stats_path: base.join("stats.json"),
        osm_objects_dir: base.join("osm_source").join("objects"),
        osm_combined_path: base
            .join("osm_source")
            .join(format!("{stem}_osm_source.geojson")),
        land_objects_dir: base.join("land_only").join("objects"),
        land_combined_path: base
            .join("land_only")
            .join(format!("{stem}_land_only.geojson")),
        base_dir: base,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestObjectEntry {
    pub relation_id: i64,
    pub name: String,
    pub slug: String,
    pub updated_at_epoch: f64,
    pub osm_source_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub land_only_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub adm_name: String,
    #[serde(default)]
    pub admin_level: String,
    #[serde(default)]
    pub updated_at_epoch: f64,
    #[serde(default)]
    pub objects: HashMap<String, ManifestObjectEntry>,
}

/// Tolerant of a missing or malformed manifest: falls back to an empty one.
pub fn load_manifest(path: &Path) -> Manifest {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Manifest::default();
    };
    serde_json::from_str(&text).unwrap_or_default()
}

pub fn save_manifest(path: &Path, manifest: &Manifest) -> Result<(), StorageError> {
    save_json(path, manifest)
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let text = serde_json::to_string(value).map_err(|source| StorageError::Json {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_text(path, &text)
}

fn atomic_write_text(path: &Path, text: &str) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| StorageError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    use std::io::Write;
    tmp.write_all(text.as_bytes())
        .map_err(|source| StorageError::Io {
            path: path.display().to_string(),
            source,
        })?;
    tmp.persist(path)
        .map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            source: e.error,
        })?;
    Ok(())
}

/// Filename `<slug>__<iso2>__r<rid>.geojson`, falling back to `relation <rid>`
/// when no usable name tag is present.
pub fn object_filename(relation_id: i64, tags: &HashMap<String, String>) -> String {
    let name = {
        let n = preferred_english_name_from_tags(tags);
        if n.is_empty() {
            format!("relation {relation_id}")
        } else {
            n
        }
    };
    let iso2 = {
        let code = iso2_from_tags(tags);
        if code.is_empty() {
            "xx".to_string()
        } else {
            code
        }
    };
    format!("{}__{}__r{}.geojson", slugify(&name, 80), iso2, relation_id)
}

fn rel_glob(dir: &Path, relation_id: i64) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    let prefix = format!("r{relation_id}__");
    let suffix = format!("__r{relation_id}.geojson");
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".geojson") {
            continue;
        }
        let matches = name.starts_with(&prefix) || name.ends_with(&suffix);
        if matches && seen.insert(path.clone()) {
            out.push(path);
        }
    }
    out
}

/// Writes a single-feature FeatureCollection for `relation_id`, removing any
/// stale sibling file for the same relation first.
pub fn write_object_geojson(
    objects_dir: &Path,
    relation_id: i64,
    tags: &HashMap<String, String>,
    geometry: &Value,
) -> Result<PathBuf, StorageError> {
    std::fs::create_dir_all(objects_dir).map_err(|source| StorageError::Io {
        path: objects_dir.display().to_string(),
        source,
    })?;

    let filename = object_filename(relation_id, tags);
    let out_path = objects_dir.join(&filename);

    for stale in rel_glob(objects_dir, relation_id) {
        if stale.file_name().and_then(|n| n.to_str()) != Some(filename.as_str()) {
            let _ = std::fs::remove_file(&stale);
        }
    }

    let mut properties = serde_json::Map::new();
    for (k, v) in tags {
        properties.insert(k.clone(), Value::String(v.clone()));
    }
    properties.insert("osm_type".to_string(), Value::String("relation".to_string()));
    properties.insert("osm_id".to_string(), Value::from(relation_id));

    let feature = serde_json::json!({
        "type": "Feature",
        "geometry": geometry,
        "properties": properties,
    });
    let fc = serde_json::json!({
        "type": "FeatureCollection",
        "features": [feature],
    });

    save_json(&out_path, &fc)?;
    Ok(out_path)
}

/// Streams a combined FeatureCollection by extracting the first feature of
/// every per-object file under `objects_dir`, in filename order.
pub fn rebuild_combined(objects_dir: &Path, combined_path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(objects_dir).map_err(|source| StorageError::Io {
        path: objects_dir.display().to_string(),
        source,
    })?;
    let dir = combined_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut files: Vec<PathBuf> = std::fs::read_dir(objects_dir)
        .map_err(|source| StorageError::Io {
            path: objects_dir.display().to_string(),
            source,
        })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("geojson"))
        .collect();
    files.sort();

    use std::io::Write;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| StorageError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    tmp.write_all(br#"{"type":"FeatureCollection","features":["#)
        .map_err(|source| StorageError::Io {
            path: combined_path.display().to_string(),
            source,
        })?;

    let mut first = true;
    for file in files {
        let Ok(text) = std::fs::read_to_string(&file) else {
            continue;
        };
        let Ok(raw) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some(feat) = raw.get("features").and_then(|f| f.as_array()).and_then(|a| a.first())
        else {
            continue;
        };
        if !first {
            tmp.write_all(b",").map_err(|source| StorageError::Io {
                path: combined_path.display().to_string(),
                source,
            })?;
        }
        first = false;
        let feat_text = serde_json::to_string(feat).map_err(|source| StorageError::Json {
            path: file.display().to_string(),
            source,
        })?;
        tmp.write_all(feat_text.as_bytes())
            .map_err(|source| StorageError::Io {
                path: combined_path.display().to_string(),
                source,
            })?;
    }
    tmp.write_all(b"]}").map_err(|source| StorageError::Io {
        path: combined_path.display().to_string(),
        source,
    })?;

    tmp.persist(combined_path)
        .map_err(|e| StorageError::Io {
            path: combined_path.display().to_string(),
            source: e.error,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_paths_is_pure() {
        let a = scope_paths(Path::new("/data/geojson"), "world_GLOBAL_r0", "2");
        let b = scope_paths(Path::new("/data/geojson"), "world_GLOBAL_r0", "2");
        assert_eq!(a.manifest_path, b.manifest_path);
        assert_eq!(
            a.osm_combined_path,
            Path::new("/data/geojson/world_GLOBAL_r0/admin_level=2/osm_source/world_GLOBAL_r0_admin_level_2_osm_source.geojson")
        );
    }

    #[test]
    fn object_filename_falls_back_when_untagged() {
        let tags = HashMap::new();
        assert_eq!(object_filename(60189, &tags), "relation-60189__xx__r60189.geojson");
    }

    #[test]
    fn write_object_geojson_roundtrips_geometry_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut tags = HashMap::new();
        tags.insert("name:en".to_string(), "Testland".to_string());
        tags.insert("ISO3166-1:alpha2".to_string(), "TL".to_string());
        let geometry = serde_json::json!({"type": "Polygon", "coordinates": [[[0.0,0.0],[1.0,0.0],[1.0,1.0],[0.0,0.0]]]});

        let path = write_object_geojson(dir.path(), 42, &tags, &geometry).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let fc: Value = serde_json::from_str(&text).unwrap();
        let feat = &fc["features"][0];
        assert_eq!(feat["geometry"], geometry);
        assert_eq!(feat["properties"]["name:en"], "Testland");
        assert_eq!(feat["properties"]["osm_id"], 42);
    }

    #[test]
    fn write_object_geojson_removes_stale_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let tags = HashMap::new();
        let geometry = serde_json::json!({"type": "Polygon", "coordinates": []});

        let first = write_object_geojson(dir.path(), 7, &tags, &geometry).unwrap();
        std::fs::rename(&first, dir.path().join("oldname__xx__r7.geojson")).unwrap();

        let mut tags2 = HashMap::new();
        tags2.insert("name:en".to_string(), "Renamed".to_string());
        write_object_geojson(dir.path(), 7, &tags2, &geometry).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("renamed__"));
    }

    #[test]
    fn load_manifest_is_tolerant_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = load_manifest(&dir.path().join("does-not-exist.json"));
        assert!(m.objects.is_empty());
    }

    #[test]
    fn rebuild_combined_collects_first_feature_of_each_object() {
        let objects_dir = tempfile::tempdir().unwrap();
        let combined = objects_dir.path().join("..").join("combined.geojson");
        let tags = HashMap::new();
        let geometry = serde_json::json!({"type": "Point", "coordinates": [0.0, 0.0]});
        write_object_geojson(objects_dir.path(), 1, &tags, &geometry).unwrap();
        write_object_geojson(objects_dir.path(), 2, &tags, &geometry).unwrap();

        rebuild_combined(objects_dir.path(), &combined).unwrap();
        let text = std::fs::read_to_string(&combined).unwrap();
        let fc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(fc["features"].as_array().unwrap().len(), 2);
    }
}
