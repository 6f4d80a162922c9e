//! Job records, a bounded coalescing event queue, and the worker lifecycle
//! that runs the downloader pipeline in the background.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::config::Config;
use crate::downloader::download_admin_boundaries;
use crate::land::LandDataset;
use crate::overpass::OverpassClient;

const QUEUE_CAPACITY: usize = 1024;
const EVICTION_GRACE_SEC: f64 = 600.0;
const EVICTION_CAP: usize = 50;

const COALESCED_TYPES: &[&str] = &["overall_progress", "land_polygons_download_progress", "clip_cache_stats"];

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn new_job_id() -> String {
    format!("{:032x}", uuid::Uuid::new_v4().as_u128())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub event_type: String,
    pub data: Value,
}

/// Parameters a caller submits to start a download job; carried verbatim into
/// the `job_started` event and the downloader invocation.
#[derive(Debug, Clone, Serialize)]
pub struct JobParams {
    pub adm_name: String,
    pub admin_level: String,
    pub relation_ids: Vec<i64>,
    pub relation_names: HashMap<i64, String>,
    pub clip_land: bool,
    pub force_refresh_osm_source: bool,
    pub fix_antimeridian: bool,
    pub overpass_url: Option<String>,
}

struct QueueState {
    events: VecDeque<JobEvent>,
    queued_coalesced: HashMap<&'static str, bool>,
    pending_coalesced: HashMap<&'static str, Value>,
    dropped: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            queued_coalesced: HashMap::new(),
            pending_coalesced: HashMap::new(),
            dropped: 0,
        }
    }
}

/// Shared, thread-safe record for a single job: status, latest progress
/// snapshot, and the bounded event queue its SSE handler drains.
pub struct Job {
    pub job_id: String,
    pub created_at_epoch: f64,
    pub params: JobParams,
    status: Mutex<JobStatus>,
    progress: Mutex<Value>,
    error: Mutex<Option<String>>,
    cancelled: AtomicBool,
    finished_at_epoch: Mutex<Option<f64>>,
    queue: Mutex<QueueState>,
    notify: Notify,
}

impl Job {
    fn new(job_id: String, params: JobParams) -> Self {
        Self {
            job_id,
            created_at_epoch: now_epoch(),
            params,
            status: Mutex::new(JobStatus::Queued),
            progress: Mutex::new(Value::Null),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            finished_at_epoch: Mutex::new(None),
            queue: Mutex::new(QueueState::new()),
            notify: Notify::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn coalesced_key(event_type: &str) -> Option<&'static str> {
        COALESCED_TYPES.iter().copied().find(|t| *t == event_type)
    }

    /// Applies the coalescing/backpressure rules from the job-manager spec,
    /// then wakes any task waiting on `next_event`.
    fn enqueue(&self, event_type: &str, data: Value) {
        if event_type == "overall_progress" {
            *self.progress.lock().unwrap() = data.clone();
        }

        let mut q = self.queue.lock().unwrap();
        if let Some(key) = Self::coalesced_key(event_type) {
            if *q.queued_coalesced.get(key).unwrap_or(&false) {
                q.pending_coalesced.insert(key, data);
                drop(q);
                self.notify.notify_waiters();
                return;
            }
            q.queued_coalesced.insert(key, true);
        }

        if q.events.len() >= QUEUE_CAPACITY {
            if let Some(dropped) = q.events.pop_front() {
                if let Some(key) = Self::coalesced_key(&dropped.event_type) {
                    q.queued_coalesced.insert(key, false);
                }
            }
            q.dropped += 1;
            let dropped = q.dropped;
            if dropped == 1 || dropped == 10 || dropped == 100 || dropped % 1000 == 0 {
                tracing::warn!(job_id = %self.job_id, dropped, "job event queue overflow, dropping oldest event");
            }
        }
        q.events.push_back(JobEvent {
            event_type: event_type.to_string(),
            data,
        });
        drop(q);
        self.notify.notify_waiters();
    }

    /// Called by the SSE handler after it has sent an event downstream: lets
    /// a pending coalesced snapshot (if any) become eligible for enqueue.
    fn on_event_delivered(&self, event_type: &str) {
        let Some(key) = Self::coalesced_key(event_type) else { return };
        let mut q = self.queue.lock().unwrap();
        q.queued_coalesced.insert(key, false);
        if let Some(data) = q.pending_coalesced.remove(key) {
            drop(q);
            self.enqueue(key, data);
        }
    }

    fn flush_pending(&self) {
        let pending: Vec<(&'static str, Value)> = {
            let mut q = self.queue.lock().unwrap();
            q.pending_coalesced.drain().collect()
        };
        for (key, data) in pending {
            self.enqueue(key, data);
        }
    }

    fn dropped_count(&self) -> u64 {
        self.queue.lock().unwrap().dropped
    }

    /// Waits for and returns the next queued event, or `None` once the job
    /// has reached a terminal state with nothing left to drain.
    pub async fn next_event(&self) -> Option<JobEvent> {
        loop {
            {
                let mut q = self.queue.lock().unwrap();
                if let Some(event) = q.events.pop_front() {
                    drop(q);
                    self.on_event_delivered(&event.event_type);
                    return Some(event);
                }
            }
            if self.status().is_terminal() {
                let mut q = self.queue.lock().unwrap();
                if let Some(event) = q.events.pop_front() {
                    drop(q);
                    self.on_event_delivered(&event.event_type);
                    return Some(event);
                }
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "job_id": self.job_id,
            "created_at_epoch": self.created_at_epoch,
            "adm_name": self.params.adm_name,
            "admin_level": self.params.admin_level,
            "status": self.status(),
            "progress": *self.progress.lock().unwrap(),
            "error": *self.error.lock().unwrap(),
            "cancelled": self.is_cancelled(),
            "finished_at_epoch": *self.finished_at_epoch.lock().unwrap(),
        })
    }
}

/// Owns the set of known jobs and spawns each job's background worker.
pub struct JobManager {
    config: Arc<Config>,
    overpass: Arc<OverpassClient>,
    land: Arc<LandDataset>,
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    active_jobs: AtomicU64,
}

impl JobManager {
    pub fn new(config: Arc<Config>, overpass: Arc<OverpassClient>, land: Arc<LandDataset>) -> Self {
        Self {
            config,
            overpass,
            land,
            jobs: Mutex::new(HashMap::new()),
            active_jobs: AtomicU64::new(0),
        }
    }

    pub fn active_job_count(&self) -> u64 {
        self.active_jobs.load(Ordering::SeqCst)
    }

    fn evict_terminal_jobs(jobs: &mut HashMap<String, Arc<Job>>) {
        let now = now_epoch();
        jobs.retain(|_, job| {
            let finished_at = *job.finished_at_epoch.lock().unwrap();
            !matches!(finished_at, Some(t) if now - t > EVICTION_GRACE_SEC)
        });

        if jobs.len() > EVICTION_CAP {
            let mut terminal: Vec<(String, f64)> = jobs
                .iter()
                .filter(|(_, job)| job.status().is_terminal())
                .map(|(id, job)| {
                    let finished_at = job.finished_at_epoch.lock().unwrap().unwrap_or(job.created_at_epoch);
                    (id.clone(), finished_at)
                })
                .collect();
            terminal.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let overflow = jobs.len() - EVICTION_CAP;
            for (id, _) in terminal.into_iter().take(overflow) {
                jobs.remove(&id);
            }
        }
    }

    /// Registers a new job and schedules its worker on a background task.
    pub fn create_job(self: &Arc<Self>, params: JobParams) -> Arc<Job> {
        let job_id = new_job_id();
        let job = Arc::new(Job::new(job_id.clone(), params));

        {
            let mut jobs = self.jobs.lock().unwrap();
            Self::evict_terminal_jobs(&mut jobs);
            jobs.insert(job_id.clone(), job.clone());
        }

        let manager = self.clone();
        let worker_job = job.clone();
        tokio::spawn(async move { manager.run_worker(worker_job).await });

        job
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// Requests cancellation; the worker observes this on its next
    /// per-relation iteration. Returns `false` if the job is unknown.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(job) = self.get(job_id) else { return false };
        job.cancelled.store(true, Ordering::SeqCst);
        job.enqueue("log", json!({ "message": "Cancel requested" }));
        true
    }

    async fn run_worker(self: Arc<Self>, job: Arc<Job>) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        job.set_status(JobStatus::Running);
        job.enqueue(
            "job_started",
            json!({ "job_id": job.job_id, "params": job.params }),
        );

        let params = job.params.clone_for_pipeline();
        let config = self.config.clone();
        let overpass = self.overpass.clone();
        let land = self.land.clone();
        let job_for_pipeline = job.clone();

        let result = download_admin_boundaries(
            &config,
            &overpass,
            &land,
            &params.adm_name,
            &params.admin_level,
            &params.relation_ids,
            &params.relation_names,
            params.clip_land,
            params.force_refresh_osm_source,
            params.fix_antimeridian,
            params.overpass_url.as_deref(),
            {
                let job = job_for_pipeline.clone();
                move |event_type: &str, data: Value| {
                    job.enqueue(event_type, data);
                }
            },
            {
                let job = job_for_pipeline.clone();
                move || job.is_cancelled()
            },
        )
        .await;

        let final_status = if job.is_cancelled() {
            JobStatus::Cancelled
        } else {
            match &result {
                Ok(()) => JobStatus::Done,
                Err(e) => {
                    job.enqueue("error", json!({ "message": e.to_string() }));
                    *job.error.lock().unwrap() = Some(e.to_string());
                    JobStatus::Error
                }
            }
        };
        job.set_status(final_status);
        *job.finished_at_epoch.lock().unwrap() = Some(now_epoch());

        if job.dropped_count() > 0 {
            job.enqueue(
                "log",
                json!({ "message": format!("{} job events were dropped due to backpressure", job.dropped_count()) }),
            );
        }
        job.flush_pending();
        job.enqueue("job_finished", json!({ "job_id": job.job_id, "status": final_status }));

        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobParams {
    fn clone_for_pipeline(&self) -> JobParams {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> JobParams {
        JobParams {
            adm_name: "world".to_string(),
            admin_level: "2".to_string(),
            relation_ids: vec![1, 2],
            relation_names: HashMap::new(),
            clip_land: false,
            force_refresh_osm_source: false,
            fix_antimeridian: true,
            overpass_url: None,
        }
    }

    #[test]
    fn new_job_id_is_32_hex_chars() {
        let id = new_job_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn enqueue_and_drain_preserves_order_for_non_coalesced_events() {
        let job = Job::new("job1".to_string(), sample_params());
        job.enqueue("log", json!({ "message": "one" }));
        job.enqueue("log", json!({ "message": "two" }));
        job.set_status(JobStatus::Done);

        let first = job.next_event().await.unwrap();
        assert_eq!(first.data["message"], "one");
        let second = job.next_event().await.unwrap();
        assert_eq!(second.data["message"], "two");
        assert!(job.next_event().await.is_none());
    }

    #[tokio::test]
    async fn coalesced_events_collapse_to_latest_pending_snapshot() {
        let job = Job::new("job2".to_string(), sample_params());
        job.enqueue("overall_progress", json!({ "done": 1, "total": 10 }));
        job.enqueue("overall_progress", json!({ "done": 2, "total": 10 }));
        job.enqueue("overall_progress", json!({ "done": 3, "total": 10 }));
        job.set_status(JobStatus::Done);

        let first = job.next_event().await.unwrap();
        assert_eq!(first.event_type, "overall_progress");
        assert_eq!(first.data["done"], 1);

        let second = job.next_event().await.unwrap();
        assert_eq!(second.data["done"], 3);
        assert!(job.next_event().await.is_none());
    }

    #[test]
    fn progress_snapshot_updates_even_when_event_is_coalesced_away() {
        let job = Job::new("job3".to_string(), sample_params());
        job.enqueue("overall_progress", json!({ "done": 1, "total": 10 }));
        job.enqueue("overall_progress", json!({ "done": 2, "total": 10 }));
        assert_eq!(*job.progress.lock().unwrap(), json!({ "done": 2, "total": 10 }));
    }

    #[test]
    fn cancel_returns_false_for_unknown_job() {
        let manager = Arc::new(JobManager::new(
            Arc::new(Config {
                data_dir: "/tmp".into(),
                overpass_url: "https://example.org".to_string(),
                http_user_agent: "test".to_string(),
                http_timeout_sec: 10,
                download_timeout_sec: 10,
                land_polygons_urls: vec![],
            }),
            Arc::new(OverpassClient::new("https://example.org".to_string(), "test".to_string(), 10)),
            Arc::new(LandDataset::new("/nonexistent.zip".into())),
        ));
        assert!(!manager.cancel("does-not-exist"));
    }

    #[test]
    fn backpressure_drops_oldest_event_and_increments_dropped_counter() {
        let job = Job::new("job4".to_string(), sample_params());
        for i in 0..(QUEUE_CAPACITY + 5) {
            job.enqueue("object_started", json!({ "i": i }));
        }
        assert_eq!(job.dropped_count(), 5);
        assert_eq!(job.queue.lock().unwrap().events.len(), QUEUE_CAPACITY);
    }
}
