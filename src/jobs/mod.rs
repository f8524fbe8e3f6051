//! In-memory lifecycle tracking for capture jobs and batches.
//!
//! Jobs are mutated exclusively through the tracker; the owning capture
//! task drives transitions pending → processing → {completed | failed}.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capture::CaptureOptions;

pub mod test_crawl;

/// Capture job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of one step in a job's step log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    InProgress,
    Completed,
    Failed,
}

/// One entry in the ordered step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    pub name: String,
    pub state: StepState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A resource that failed to download, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedResource {
    pub url: String,
    pub error: String,
}

/// Per-job counters, keyed by resource kind where applicable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub pages_processed: usize,
    pub total_pages: usize,
    pub resources_downloaded: usize,
    pub total_resources: usize,
    pub succeeded: BTreeMap<String, usize>,
    pub failed: BTreeMap<String, Vec<FailedResource>>,
}

impl CaptureStats {
    pub fn record_success(&mut self, kind: &str) {
        *self.succeeded.entry(kind.to_string()).or_default() += 1;
        self.resources_downloaded += 1;
    }

    pub fn record_failure(&mut self, kind: &str, url: impl Into<String>, error: impl Into<String>) {
        self.failed.entry(kind.to_string()).or_default().push(FailedResource {
            url: url.into(),
            error: error.into(),
        });
    }
}

/// One URL's capture, from request to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureJob {
    pub id: String,
    pub url: String,
    pub options: CaptureOptions,
    pub status: JobStatus,
    /// Percentage in [0, 100].
    pub progress: u8,
    pub current_step: Option<String>,
    pub steps: Vec<JobStep>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub stats: CaptureStats,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Batch membership entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMember {
    pub job_id: String,
    pub url: String,
    pub status: JobStatus,
}

/// Batch counters derived from member statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Derived batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Partial,
    Failed,
}

/// A set of capture jobs created by one multi-page or curated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub batch_id: String,
    pub jobs: Vec<BatchMember>,
    pub summary: BatchSummary,
    pub status: BatchStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// Re-derive summary, status, and progress from member statuses.
    fn refresh(&mut self) {
        let total = self.jobs.len();
        let completed = self.jobs.iter().filter(|m| m.status == JobStatus::Completed).count();
        let failed = self.jobs.iter().filter(|m| m.status == JobStatus::Failed).count();
        let processing = self.jobs.iter().filter(|m| m.status == JobStatus::Processing).count();
        let pending = total - completed - failed - processing;

        self.summary = BatchSummary {
            total,
            completed,
            failed,
            pending: pending + processing,
        };
        self.status = derive_batch_status(total, completed, failed, pending, processing);
        self.progress = if total == 0 {
            0
        } else {
            ((completed * 100) / total) as u8
        };
        if self.status != BatchStatus::Pending
            && self.status != BatchStatus::InProgress
            && self.completed_at.is_none()
        {
            self.completed_at = Some(Utc::now());
        }
    }
}

/// The §3 derivation rule: all completed → completed, all failed → failed,
/// mixed terminal → partial, any activity → in_progress, untouched → pending.
fn derive_batch_status(
    total: usize,
    completed: usize,
    failed: usize,
    pending: usize,
    processing: usize,
) -> BatchStatus {
    if total == 0 || completed + failed + processing == 0 {
        BatchStatus::Pending
    } else if completed == total {
        BatchStatus::Completed
    } else if failed == total {
        BatchStatus::Failed
    } else if completed > 0 && failed > 0 && pending == 0 && processing == 0 {
        BatchStatus::Partial
    } else {
        BatchStatus::InProgress
    }
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<String, CaptureJob>,
    batches: HashMap<String, BatchJob>,
    running: usize,
}

/// In-memory registry of capture jobs and batches.
pub struct JobTracker {
    max_concurrent: usize,
    state: RwLock<TrackerState>,
}

impl JobTracker {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: RwLock::new(TrackerState::default()),
        }
    }

    /// Create a pending job for `url`.
    pub async fn create_job(&self, url: &str, options: CaptureOptions) -> CaptureJob {
        let job = CaptureJob {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            options,
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            steps: Vec::new(),
            output_path: None,
            error: None,
            stats: CaptureStats::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.state
            .write()
            .await
            .jobs
            .insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, url = %job.url, "Job created");
        job
    }

    /// Move a pending job to processing.
    ///
    /// Returns `false` (leaving the job pending) when the concurrency gate
    /// is full or the job is not pending.
    pub async fn start_job(&self, job_id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.running >= self.max_concurrent {
            debug!(job_id, running = state.running, "Concurrency gate full, job stays pending");
            return false;
        }
        let Some(job) = state.jobs.get_mut(job_id) else {
            return false;
        };
        if job.status != JobStatus::Pending {
            return false;
        }
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        state.running += 1;
        true
    }

    /// Begin a named step, closing the previous one as completed.
    pub async fn update_step(&self, job_id: &str, name: &str) {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            close_last_step(job, StepState::Completed);
            job.steps.push(JobStep {
                name: name.to_string(),
                state: StepState::InProgress,
                started_at: Utc::now(),
                ended_at: None,
            });
            job.current_step = Some(name.to_string());
        }
    }

    pub async fn update_progress(&self, job_id: &str, progress: u8) {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.progress = progress.min(100);
        }
    }

    /// Mutate a job's stats in place.
    pub async fn with_stats<F>(&self, job_id: &str, mutate: F)
    where
        F: FnOnce(&mut CaptureStats),
    {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            mutate(&mut job.stats);
        }
    }

    /// Mark a job completed with its archive path.
    pub async fn complete_job(&self, job_id: &str, output_path: PathBuf) {
        let mut state = self.state.write().await;
        let was_processing = match state.jobs.get_mut(job_id) {
            Some(job) => {
                let was_processing = job.status == JobStatus::Processing;
                close_last_step(job, StepState::Completed);
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.current_step = None;
                job.output_path = Some(output_path);
                job.completed_at = Some(Utc::now());
                info!(job_id, "Job completed");
                was_processing
            }
            None => false,
        };
        if was_processing {
            state.running = state.running.saturating_sub(1);
        }
    }

    /// Mark a job failed with a human-readable reason.
    pub async fn fail_job(&self, job_id: &str, error: &str) {
        let mut state = self.state.write().await;
        let was_processing = match state.jobs.get_mut(job_id) {
            Some(job) => {
                let was_processing = job.status == JobStatus::Processing;
                close_last_step(job, StepState::Failed);
                job.status = JobStatus::Failed;
                job.current_step = None;
                job.error = Some(error.to_string());
                job.completed_at = Some(Utc::now());
                info!(job_id, error, "Job failed");
                was_processing
            }
            None => false,
        };
        if was_processing {
            state.running = state.running.saturating_sub(1);
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Option<CaptureJob> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    /// Number of jobs currently processing.
    pub async fn running(&self) -> usize {
        self.state.read().await.running
    }

    /// Drop finished jobs whose completion time exceeds `max_age`.
    pub async fn cleanup_old_jobs(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(7));
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        before - state.jobs.len()
    }

    /// Drop finished batches older than `max_age`.
    pub async fn cleanup_old_batches(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(7));
        let mut state = self.state.write().await;
        let before = state.batches.len();
        state.batches.retain(|_, batch| {
            !(matches!(
                batch.status,
                BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed
            ) && batch.completed_at.is_some_and(|at| at < cutoff))
        });
        before - state.batches.len()
    }

    /// Create a batch mirroring the given member jobs.
    pub async fn create_batch(&self, members: Vec<(String, String)>) -> BatchJob {
        let mut batch = BatchJob {
            batch_id: Uuid::new_v4().to_string(),
            jobs: members
                .into_iter()
                .map(|(job_id, url)| BatchMember {
                    job_id,
                    url,
                    status: JobStatus::Pending,
                })
                .collect(),
            summary: BatchSummary::default(),
            status: BatchStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        batch.refresh();
        self.state
            .write()
            .await
            .batches
            .insert(batch.batch_id.clone(), batch.clone());
        batch
    }

    /// Update one member's status and re-derive the batch.
    pub async fn update_batch_member(&self, batch_id: &str, job_id: &str, status: JobStatus) {
        let mut state = self.state.write().await;
        if let Some(batch) = state.batches.get_mut(batch_id) {
            if let Some(member) = batch.jobs.iter_mut().find(|m| m.job_id == job_id) {
                member.status = status;
            }
            batch.refresh();
        }
    }

    pub async fn get_batch(&self, batch_id: &str) -> Option<BatchJob> {
        self.state.read().await.batches.get(batch_id).cloned()
    }
}

fn close_last_step(job: &mut CaptureJob, state: StepState) {
    if let Some(step) = job.steps.last_mut() {
        if step.state == StepState::InProgress {
            step.state = state;
            step.ended_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> JobTracker {
        JobTracker::new(2)
    }

    #[tokio::test]
    async fn test_job_lifecycle_transitions() {
        let tracker = tracker();
        let job = tracker.create_job("https://example.test", CaptureOptions::default()).await;
        assert_eq!(job.status, JobStatus::Pending);

        assert!(tracker.start_job(&job.id).await);
        tracker.update_step(&job.id, "loading page").await;
        tracker.update_step(&job.id, "downloading resources").await;
        tracker.complete_job(&job.id, PathBuf::from("/captures/x")).await;

        let done = tracker.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.output_path.is_some());
        assert_eq!(done.steps.len(), 2);
        assert!(done.steps.iter().all(|s| s.state == StepState::Completed));
        assert_eq!(tracker.running().await, 0);
    }

    #[tokio::test]
    async fn test_only_one_step_in_progress() {
        let tracker = tracker();
        let job = tracker.create_job("https://example.test", CaptureOptions::default()).await;
        tracker.start_job(&job.id).await;
        tracker.update_step(&job.id, "a").await;
        tracker.update_step(&job.id, "b").await;
        tracker.update_step(&job.id, "c").await;

        let job = tracker.get_job(&job.id).await.unwrap();
        let in_progress = job
            .steps
            .iter()
            .filter(|s| s.state == StepState::InProgress)
            .count();
        assert_eq!(in_progress, 1);
        assert_eq!(job.current_step.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_start_job_refused_at_max_concurrent() {
        let tracker = tracker();
        let a = tracker.create_job("https://a.test", CaptureOptions::default()).await;
        let b = tracker.create_job("https://b.test", CaptureOptions::default()).await;
        let c = tracker.create_job("https://c.test", CaptureOptions::default()).await;

        assert!(tracker.start_job(&a.id).await);
        assert!(tracker.start_job(&b.id).await);
        assert!(!tracker.start_job(&c.id).await);
        assert_eq!(
            tracker.get_job(&c.id).await.unwrap().status,
            JobStatus::Pending
        );

        tracker.fail_job(&a.id, "boom").await;
        assert!(tracker.start_job(&c.id).await);
    }

    #[tokio::test]
    async fn test_failed_job_records_error_and_step() {
        let tracker = tracker();
        let job = tracker.create_job("https://example.test", CaptureOptions::default()).await;
        tracker.start_job(&job.id).await;
        tracker.update_step(&job.id, "loading page").await;
        tracker.fail_job(&job.id, "navigation timeout").await;

        let failed = tracker.get_job(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("navigation timeout"));
        assert_eq!(failed.steps.last().unwrap().state, StepState::Failed);
    }

    #[tokio::test]
    async fn test_cleanup_old_jobs() {
        let tracker = tracker();
        let job = tracker.create_job("https://example.test", CaptureOptions::default()).await;
        tracker.start_job(&job.id).await;
        tracker.complete_job(&job.id, PathBuf::from("/x")).await;

        // Not old enough
        assert_eq!(tracker.cleanup_old_jobs(Duration::from_secs(3600)).await, 0);
        // Old enough
        assert_eq!(tracker.cleanup_old_jobs(Duration::from_secs(0)).await, 1);
        assert!(tracker.get_job(&job.id).await.is_none());
    }

    #[tokio::test]
    async fn test_batch_derivation_rules() {
        let tracker = tracker();
        let batch = tracker
            .create_batch(vec![
                ("j1".to_string(), "https://a.test".to_string()),
                ("j2".to_string(), "https://b.test".to_string()),
            ])
            .await;
        assert_eq!(batch.status, BatchStatus::Pending);

        tracker
            .update_batch_member(&batch.batch_id, "j1", JobStatus::Processing)
            .await;
        assert_eq!(
            tracker.get_batch(&batch.batch_id).await.unwrap().status,
            BatchStatus::InProgress
        );

        tracker
            .update_batch_member(&batch.batch_id, "j1", JobStatus::Completed)
            .await;
        assert_eq!(
            tracker.get_batch(&batch.batch_id).await.unwrap().status,
            BatchStatus::InProgress
        );

        tracker
            .update_batch_member(&batch.batch_id, "j2", JobStatus::Failed)
            .await;
        let done = tracker.get_batch(&batch.batch_id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Partial);
        assert_eq!(done.summary.completed, 1);
        assert_eq!(done.summary.failed, 1);
        assert_eq!(done.progress, 50);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_batch_all_completed_and_all_failed() {
        let tracker = tracker();
        let batch = tracker
            .create_batch(vec![("j1".into(), "https://a.test".into())])
            .await;

        tracker
            .update_batch_member(&batch.batch_id, "j1", JobStatus::Completed)
            .await;
        assert_eq!(
            tracker.get_batch(&batch.batch_id).await.unwrap().status,
            BatchStatus::Completed
        );

        let batch2 = tracker
            .create_batch(vec![("j2".into(), "https://b.test".into())])
            .await;
        tracker
            .update_batch_member(&batch2.batch_id, "j2", JobStatus::Failed)
            .await;
        assert_eq!(
            tracker.get_batch(&batch2.batch_id).await.unwrap().status,
            BatchStatus::Failed
        );
    }

    #[test]
    fn test_stats_recording() {
        let mut stats = CaptureStats::default();
        stats.record_success("images");
        stats.record_success("images");
        stats.record_failure("scripts", "https://cdn.test/x.js", "HTTP status 404");

        assert_eq!(stats.succeeded.get("images"), Some(&2));
        assert_eq!(stats.resources_downloaded, 2);
        assert_eq!(stats.failed.get("scripts").unwrap().len(), 1);
    }
}
