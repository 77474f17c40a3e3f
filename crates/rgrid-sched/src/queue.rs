//! Job requests and the pending-request priority queue.

use crossbeam_channel::Sender;
use serde_json::Value;

use crate::sched::SchedResponse;

/// Requested shape of one job, parsed from the jobspec payload.
///
/// A parse or validation failure carries the user-visible deny note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSpec {
    pub nnodes: usize,
    pub nslots: usize,
    pub slot_size: usize,
    pub gpus_per_slot: usize,
    pub exclusive: bool,
    /// Seconds of requested runtime; zero means no limit.
    pub duration: f64,
    pub constraints: Option<Value>,
}

impl JobSpec {
    /// Parse a jobspec object:
    /// `{ "nslots": n, "slot_size"?: n, "nnodes"?: n, "exclusive"?: b,
    ///    "gpus_per_slot"?: n, "duration"?: secs, "constraints"?: {...} }`.
    pub fn from_json(jobspec: &Value) -> Result<JobSpec, String> {
        let obj = jobspec
            .as_object()
            .ok_or_else(|| "jobspec must be an object".to_string())?;
        let uint = |key: &str, default: u64| -> Result<u64, String> {
            match obj.get(key) {
                None => Ok(default),
                Some(v) => v
                    .as_u64()
                    .ok_or_else(|| format!("invalid jobspec field '{key}'")),
            }
        };
        let spec = JobSpec {
            nnodes: uint("nnodes", 0)? as usize,
            nslots: uint("nslots", 0)? as usize,
            slot_size: uint("slot_size", 1)? as usize,
            gpus_per_slot: uint("gpus_per_slot", 0)? as usize,
            exclusive: obj
                .get("exclusive")
                .map(|v| v.as_bool().ok_or("invalid jobspec field 'exclusive'"))
                .transpose()?
                .unwrap_or(false),
            duration: obj
                .get("duration")
                .map(|v| v.as_f64().ok_or("invalid jobspec field 'duration'"))
                .transpose()?
                .unwrap_or(0.0),
            constraints: obj.get("constraints").cloned(),
        };
        if spec.nslots == 0 {
            return Err("jobspec must request at least one slot".to_string());
        }
        if spec.slot_size == 0 {
            return Err("jobspec slot_size must be at least 1".to_string());
        }
        if spec.duration < 0.0 {
            return Err("jobspec duration must not be negative".to_string());
        }
        Ok(spec)
    }
}

/// One pending allocation request.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: u64,
    pub priority: u32,
    pub userid: u32,
    pub t_submit: f64,
    pub spec: JobSpec,
    /// Response channel for this request's single terminal response.
    pub reply: Sender<SchedResponse>,
}

impl QueuedJob {
    /// Queue ordering key: higher priority first, then earlier submission,
    /// then lower id.
    fn key(&self) -> (std::cmp::Reverse<u32>, u64, u64) {
        (
            std::cmp::Reverse(self.priority),
            self.t_submit.to_bits(),
            self.id,
        )
    }
}

/// Priority queue of pending requests.
#[derive(Debug, Default)]
pub struct Queue {
    jobs: Vec<QueuedJob>,
}

impl Queue {
    pub fn new() -> Queue {
        Queue { jobs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Insert in priority position.
    pub fn insert(&mut self, job: QueuedJob) {
        let pos = self
            .jobs
            .partition_point(|existing| existing.key() <= job.key());
        self.jobs.insert(pos, job);
    }

    pub fn head(&self) -> Option<&QueuedJob> {
        self.jobs.first()
    }

    pub fn pop_head(&mut self) -> Option<QueuedJob> {
        if self.jobs.is_empty() {
            None
        } else {
            Some(self.jobs.remove(0))
        }
    }

    pub fn find(&self, id: u64) -> Option<&QueuedJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn remove(&mut self, id: u64) -> Option<QueuedJob> {
        let pos = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(pos))
    }

    /// Update one job's priority and move it to its new position.
    pub fn reprioritize(&mut self, id: u64, priority: u32) -> bool {
        let Some(mut job) = self.remove(id) else {
            return false;
        };
        job.priority = priority;
        self.insert(job);
        true
    }

    /// Set priorities in bulk, then fully re-sort.
    pub fn reprioritize_bulk(&mut self, updates: &[(u64, u32)]) {
        for &(id, priority) in updates {
            if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
                job.priority = priority;
            }
        }
        self.jobs.sort_by_key(QueuedJob::key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.jobs.iter()
    }
}
