//! Submits Overpass queries to one of several candidate endpoints.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;

use crate::error::OverpassError;

pub struct OverpassResult {
    pub payload: Value,
    pub used_url: String,
    pub elapsed_sec: f64,
}

pub struct OverpassClient {
    http: Client,
    default_url: String,
    user_agent: String,
    timeout_sec: u64,
}

impl OverpassClient {
    pub fn new(default_url: String, user_agent: String, timeout_sec: u64) -> Self {
        let http = Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            default_url: normalize_endpoint(&default_url),
            user_agent,
            timeout_sec,
        }
    }

    /// Submit `query` to the preferred endpoint (if any), falling back to the
    /// configured default. Advances to the next endpoint on any failure;
    /// fails only once every endpoint has been tried.
    pub async fn post(
        &self,
        query: &str,
        preferred_url: Option<&str>,
        timeout_sec: Option<u64>,
    ) -> Result<OverpassResult, OverpassError> {
        let mut urls: Vec<String> = Vec::new();
        if let Some(p) = preferred_url {
            let normalized = normalize_endpoint(p);
            if !normalized.is_empty() {
                urls.push(normalized);
            }
        }
        if !self.default_url.is_empty() {
            urls.push(self.default_url.clone());
        }
        dedup_preserve_order(&mut urls);

        if urls.is_empty() {
            return Err(OverpassError::NoEndpoints);
        }

        let timeout = Duration::from_secs(timeout_sec.unwrap_or(self.timeout_sec));
        let mut last_error: Option<String> = None;

        for url in urls {
            let t0 = Instant::now();
            match self.post_one(&url, query, timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = Some(e);
                    let _ = t0.elapsed();
                    continue;
                }
            }
        }

        Err(OverpassError::Remote(format!(
            "Overpass failed: {}",
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )))
    }

    async fn post_one(
        &self,
        url: &str,
        query: &str,
        timeout: Duration,
    ) -> Result<OverpassResult, String> {
        let t0 = Instant::now();
        let resp = self
            .http
            .post(url)
            .header("User-Agent", &self.user_agent)
            .timeout(timeout)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let elapsed_sec = t0.elapsed().as_secs_f64();
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = extract_osm3s_error(&body)
                .unwrap_or_else(|| body.chars().take(800).collect::<String>());
            return Err(format!("Overpass HTTP {status}: {msg}"));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| format!("Overpass invalid JSON: {e}"))?;
        if !payload.is_object() {
            return Err("Overpass response is not a JSON object".to_string());
        }

        Ok(OverpassResult {
            payload,
            used_url: url.to_string(),
            elapsed_sec,
        })
    }
}

fn dedup_preserve_order(urls: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    urls.retain(|u| seen.insert(u.clone()));
}

fn normalize_endpoint(url: &str) -> String {
    let raw = url.trim();
    if raw.is_empty() {
        return String::new();
    }
    let Ok(parsed) = url::Url::parse(raw) else {
        return raw.trim_end_matches('/').to_string();
    };
    let scheme = parsed.scheme();
    let Some(host) = parsed.host_str() else {
        return raw.trim_end_matches('/').to_string();
    };
    let port = parsed
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    let mut path = parsed.path().trim_end_matches('/').to_string();
    if path.ends_with("/api") {
        path.push_str("/interpreter");
    }
    format!("{scheme}://{host}{port}{path}")
}

fn extract_osm3s_error(html: &str) -> Option<String> {
    if !html.contains("OSM3S Response") {
        return None;
    }
    let lower = html.to_lowercase();
    let start_tag = lower.find("<strong")?;
    let open_end = html[start_tag..].find('>')? + start_tag + 1;
    let close = lower[open_end..].find("</strong>")? + open_end;
    let inner = &html[open_end..close];
    let stripped = strip_tags(inner);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_api_suffix_to_interpreter() {
        assert_eq!(
            normalize_endpoint("https://overpass.example.org/api/"),
            "https://overpass.example.org/api/interpreter"
        );
    }

    #[test]
    fn strips_trailing_slash() {
        assert_eq!(
            normalize_endpoint("https://overpass.example.org/interpreter/"),
            "https://overpass.example.org/interpreter"
        );
    }

    #[test]
    fn extracts_osm3s_strong_message() {
        let html = "<html><body>OSM3S Response<p><strong>too many requests</strong></p></body></html>";
        assert_eq!(
            extract_osm3s_error(html),
            Some("too many requests".to_string())
        );
    }

    #[test]
    fn returns_none_without_osm3s_marker() {
        assert_eq!(extract_osm3s_error("<html>plain error</html>"), None);
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let mut urls = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        dedup_preserve_order(&mut urls);
        assert_eq!(urls, vec!["a".to_string(), "b".to_string()]);
    }
}
