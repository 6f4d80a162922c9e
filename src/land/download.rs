//! Fetches the global land-polygon archive from a configured URL cascade.

use std::path::Path;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::LandPolygonsError;

#[derive(Debug, Serialize, Deserialize)]
pub struct LandPolygonsMeta {
    pub download_url: String,
    pub downloaded_at_epoch: i64,
}

/// Downloads the first URL in `urls` that succeeds, streaming to `dest_path`
/// via a temp file and calling `on_progress(done_bytes, total_bytes, elapsed_sec)`
/// as bytes arrive. `should_cancel` is polled between chunks.
pub async fn download_land_polygons(
    http: &reqwest::Client,
    urls: &[String],
    dest_path: &Path,
    timeout_sec: u64,
    now_epoch: i64,
    mut on_progress: impl FnMut(u64, Option<u64>, f64),
    mut should_cancel: impl FnMut() -> bool,
) -> Result<(), LandPolygonsError> {
    if urls.is_empty() {
        return Err(LandPolygonsError::NoUrls);
    }

    let mut last_error = String::new();
    for url in urls {
        match try_download_one(
            http,
            url,
            dest_path,
            timeout_sec,
            &mut on_progress,
            &mut should_cancel,
        )
        .await
        {
            Ok(()) => {
                let meta = LandPolygonsMeta {
                    download_url: url.clone(),
                    downloaded_at_epoch: now_epoch,
                };
                write_meta(dest_path, &meta)?;
                return Ok(());
            }
            Err(LandPolygonsError::Cancelled) => return Err(LandPolygonsError::Cancelled),
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        }
    }

    Err(LandPolygonsError::DownloadFailed(last_error))
}

async fn try_download_one(
    http: &reqwest::Client,
    url: &str,
    dest_path: &Path,
    timeout_sec: u64,
    on_progress: &mut impl FnMut(u64, Option<u64>, f64),
    should_cancel: &mut impl FnMut() -> bool,
) -> Result<(), LandPolygonsError> {
    let t0 = Instant::now();
    let resp = http
        .get(url)
        .timeout(std::time::Duration::from_secs(timeout_sec))
        .send()
        .await
        .map_err(|e| LandPolygonsError::DownloadFailed(e.to_string()))?
        .error_for_status()
        .map_err(|e| LandPolygonsError::DownloadFailed(e.to_string()))?;

    let total_bytes = resp.content_length();
    let mut done_bytes: u64 = 0;

    let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    let (std_file, tmp_path) = tmp.into_parts();
    let mut file = tokio::fs::File::from_std(std_file);

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if should_cancel() {
            return Err(LandPolygonsError::Cancelled);
        }
        let chunk = chunk.map_err(|e| LandPolygonsError::DownloadFailed(e.to_string()))?;
        file.write_all(&chunk).await?;
        done_bytes += chunk.len() as u64;
        on_progress(done_bytes, total_bytes, t0.elapsed().as_secs_f64());
    }
    file.flush().await?;
    drop(file);

    tmp_path
        .persist(dest_path)
        .map_err(|e| LandPolygonsError::Io(e.error))?;
    Ok(())
}

fn write_meta(dest_path: &Path, meta: &LandPolygonsMeta) -> Result<(), LandPolygonsError> {
    let meta_path = meta_path_for(dest_path);
    let body = serde_json::to_vec_pretty(meta)
        .map_err(|e| LandPolygonsError::DownloadFailed(e.to_string()))?;
    let parent = meta_path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    use std::io::Write;
    tmp.write_all(&body)?;
    tmp.persist(&meta_path).map_err(|e| LandPolygonsError::Io(e.error))?;
    Ok(())
}

pub fn meta_path_for(dest_path: &Path) -> std::path::PathBuf {
    let mut name = dest_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".meta.json");
    dest_path.with_file_name(name)
}

/// Reads back presence/size/mtime/meta for the `/api/land-polygons/status` route.
pub fn land_polygons_status(dest_path: &Path) -> serde_json::Value {
    let Ok(metadata) = std::fs::metadata(dest_path) else {
        return serde_json::json!({ "present": false });
    };
    let size_bytes = metadata.len();
    let mtime_epoch = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    let meta = std::fs::read(meta_path_for(dest_path))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LandPolygonsMeta>(&bytes).ok());

    serde_json::json!({
        "present": true,
        "path": dest_path.to_string_lossy(),
        "size_bytes": size_bytes,
        "mtime_epoch": mtime_epoch,
        "meta": meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_path_appends_suffix() {
        let p = Path::new("/tmp/land-polygons-split-4326.zip");
        assert_eq!(
            meta_path_for(p),
            Path::new("/tmp/land-polygons-split-4326.zip.meta.json")
        );
    }

    #[test]
    fn status_reports_absent_when_file_missing() {
        let status = land_polygons_status(Path::new("/nonexistent/path/land.zip"));
        assert_eq!(status["present"], serde_json::json!(false));
    }
}
