//! In-memory job store.
//!
//! Each job lives in its own `DashMap` entry, so every per-job operation runs
//! under that entry's write guard. That is what makes the status CAS and counter
//! increments atomic without a global lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Counter, JobStore, TransitionOutcome};
use crate::error::StoreError;
use crate::job::{
    Job, JobFilter, JobId, JobStatus, MetadataPatch, ParentFilter, StepStat, StepStatUpdate,
};
use crate::log::{LogEntry, LogLevel};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    /// parent id -> child ids in insertion order
    children: DashMap<JobId, Vec<JobId>>,
    logs: DashMap<JobId, Vec<LogEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn collect(&self, ids: &[JobId]) -> Vec<Job> {
        ids.iter()
            .filter_map(|id| self.jobs.get(id).map(|job| job.clone()))
            .collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let id = job.id;
        let parent_id = job.parent_id;

        match self.jobs.entry(id) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(job);
            }
        }

        if let Some(parent_id) = parent_id {
            self.children.entry(parent_id).or_default().push(id);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(&id).map(|job| job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = match filter.parent {
            ParentFilter::Of(parent_id) => {
                let ids = self
                    .children
                    .get(&parent_id)
                    .map(|ids| ids.clone())
                    .unwrap_or_default();
                self.collect(&ids)
            }
            _ => self.jobs.iter().map(|entry| entry.value().clone()).collect(),
        };

        jobs.retain(|job| filter.matches(job));
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn children(&self, parent_id: JobId) -> Result<Vec<Job>, StoreError> {
        // Clone the id list first so no guard on `children` is held while
        // reading `jobs`.
        let ids = self
            .children
            .get(&parent_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(self.collect(&ids))
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let from = job.status;

        if from.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(from));
        }
        if from == to {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !from.can_transition_to(to) {
            return Ok(TransitionOutcome::Rejected(from));
        }

        job.status = to;
        if to == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(at);
        }
        if to.is_terminal() {
            job.completed_at = Some(at);
        }
        if error.is_some() {
            job.error = error;
        }

        Ok(TransitionOutcome::Applied(job.clone()))
    }

    async fn merge_metadata(&self, id: JobId, patch: MetadataPatch) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.metadata.apply(patch);
        Ok(())
    }

    async fn upsert_step_stat(&self, manager_id: JobId, stat: StepStat) -> Result<(), StoreError> {
        let mut job = self
            .jobs
            .get_mut(&manager_id)
            .ok_or(StoreError::NotFound(manager_id))?;
        let stats = &mut job.metadata.step_stats;

        match stats.iter_mut().find(|s| s.step_id == stat.step_id) {
            Some(existing) => *existing = stat,
            None => {
                stats.push(stat);
                stats.sort_by_key(|s| s.step_index);
            }
        }
        Ok(())
    }

    async fn update_step_stat(
        &self,
        manager_id: JobId,
        step_id: JobId,
        update: StepStatUpdate,
    ) -> Result<bool, StoreError> {
        let mut job = self
            .jobs
            .get_mut(&manager_id)
            .ok_or(StoreError::NotFound(manager_id))?;
        let metadata = &mut job.metadata;

        let Some(stat) = metadata.step_stats.iter_mut().find(|s| s.step_id == step_id) else {
            return Ok(false);
        };
        update.apply(stat);

        if let Some(status) = update.status {
            if metadata.current_step_name.as_deref() == Some(stat.step_name.as_str()) {
                metadata.current_step_status = Some(status);
            }
        }
        Ok(true)
    }

    async fn increment(
        &self,
        id: JobId,
        counter: Counter,
        delta: u64,
    ) -> Result<u64, StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let value = match counter {
            Counter::Documents => &mut job.document_count,
            Counter::Results => &mut job.result_count,
        };
        *value = value.saturating_add(delta);
        Ok(*value)
    }

    async fn touch_heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.last_heartbeat = Some(at);
        Ok(())
    }

    async fn append_log(&self, entry: LogEntry) -> Result<(), StoreError> {
        if !self.jobs.contains_key(&entry.job_id) {
            return Err(StoreError::NotFound(entry.job_id));
        }
        self.logs.entry(entry.job_id).or_default().push(entry);
        Ok(())
    }

    async fn logs(
        &self,
        job_id: JobId,
        min_level: Option<LogLevel>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let entries = self
            .logs
            .get(&job_id)
            .map(|entries| entries.clone())
            .unwrap_or_default();

        Ok(match min_level {
            Some(min) => entries.into_iter().filter(|e| e.level >= min).collect(),
            None => entries,
        })
    }
}
