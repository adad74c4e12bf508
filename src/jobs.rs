use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::core::{ResultRecord, ResultStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Bookkeeping for one board of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetJob {
    pub id: Uuid,
    /// 1-based position in the run, used for progress lines and ordering.
    pub index: usize,
    pub board: String,
    pub status: JobStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub result: Option<ResultStatus>,
    pub error: Option<String>,
}

impl TargetJob {
    pub fn new(index: usize, board: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            board: board.into(),
            status: JobStatus::Queued,
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(now_secs());
    }

    pub fn complete(&mut self, result: ResultStatus) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now_secs());
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(now_secs());
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub built: usize,
    pub not_built: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Clone, Default)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<Uuid, TargetJob>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_job(&self, job: TargetJob) -> Uuid {
        let job_id = job.id;
        self.jobs.write().insert(job_id, job);
        job_id
    }

    pub fn get_job(&self, job_id: &Uuid) -> Option<TargetJob> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn update_job<F>(&self, job_id: &Uuid, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut TargetJob),
    {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            update_fn(job);
            Ok(())
        } else {
            Err(anyhow::anyhow!("Job not found: {}", job_id))
        }
    }

    /// Jobs in run order.
    pub fn list_jobs(&self) -> Vec<TargetJob> {
        let mut jobs: Vec<TargetJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.index);
        jobs
    }

    pub fn summary(&self) -> RunSummary {
        let jobs = self.jobs.read();
        let mut summary = RunSummary {
            total: jobs.len(),
            ..RunSummary::default()
        };
        for job in jobs.values() {
            match (job.status, job.result) {
                (JobStatus::Completed, Some(ResultStatus::Passed)) => summary.passed += 1,
                (JobStatus::Completed, Some(ResultStatus::Built)) => summary.built += 1,
                (JobStatus::Completed, _) => summary.not_built += 1,
                (JobStatus::Failed, _) => summary.failed += 1,
                (JobStatus::Queued | JobStatus::Running, _) => summary.pending += 1,
            }
        }
        summary
    }
}

/// Append-only collector shared by the workers. Records come back in run
/// order regardless of completion order.
#[derive(Clone, Default)]
pub struct ResultCollector {
    records: Arc<Mutex<Vec<(usize, ResultRecord)>>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, index: usize, record: ResultRecord) {
        self.records.lock().push((index, record));
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn into_sorted(self) -> Vec<ResultRecord> {
        let mut records = std::mem::take(&mut *self.records.lock());
        records.sort_by_key(|(index, _)| *index);
        records.into_iter().map(|(_, record)| record).collect()
    }
}
