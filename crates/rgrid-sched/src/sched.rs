//! The scheduler event loop.
//!
//! Single-threaded and cooperative: one crossbeam channel carries both
//! requests and resource updates, and the loop alternates "drain one
//! event" with "try to place the queue head". A head that cannot be placed
//! blocks placement until a free or resource update arrives, mirroring the
//! prep/check/idle reactor arrangement this module grew out of.

use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};
use serde_json::Value;
use thiserror::Error;

use rgrid_core::IdSet;
use rgrid_rset::{AllocInfo, AllocMode, Rlist, RsetError};

use crate::queue::{JobSpec, Queue, QueuedJob};

/// Scheduler-fatal failures: the loop exits so a supervisor can restart
/// it without losing accounting.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Resource accounting can no longer be trusted.
    #[error("fatal scheduler error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Rset(#[from] RsetError),

    #[error("event channel closed")]
    Disconnected,
}

/// Debug toggles (test instrumentation, matching the module debug flags of
/// the original service).
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    /// Fail every allocation attempt.
    pub fail_alloc: bool,
    /// Send reason_pending/jobs_ahead annotations to queued jobs.
    pub annotate_reason_pending: bool,
    /// Decline expiration updates.
    pub expiration_update_deny: bool,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub alloc_mode: AllocMode,
    /// Maximum queued alloc requests; `None` is unlimited.
    pub limit: Option<usize>,
    pub debug: DebugFlags,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            alloc_mode: AllocMode::WorstFit,
            // good throughput without excessive concurrency
            limit: Some(8),
            debug: DebugFlags::default(),
        }
    }
}

impl SchedConfig {
    /// Parse a concurrency mode string: `unlimited` or `limited=N`.
    pub fn set_mode(&mut self, mode: &str) -> Result<(), String> {
        if mode.eq_ignore_ascii_case("unlimited") {
            self.limit = None;
            return Ok(());
        }
        if let Some(n) = mode.strip_prefix("limited=") {
            let n: usize = n
                .parse()
                .map_err(|_| format!("invalid limited value: {mode}"))?;
            if n == 0 {
                return Err(format!("invalid limited value: {mode}"));
            }
            self.limit = Some(n);
            return Ok(());
        }
        Err(format!("unknown mode: {mode}"))
    }
}

/// A resource-module update applied to the live resource set.
#[derive(Debug, Clone, Default)]
pub struct ResourceUpdate {
    pub up: Option<String>,
    pub down: Option<String>,
    pub shrink: Option<String>,
    pub expiration: Option<f64>,
}

/// One in-flight allocation replayed during the job-manager hello.
#[derive(Debug, Clone)]
pub struct HelloJob {
    pub id: u64,
    pub priority: u32,
    pub userid: u32,
    pub t_submit: f64,
    pub r: String,
}

/// Requests served by the loop.
pub enum Request {
    Alloc {
        id: u64,
        priority: u32,
        userid: u32,
        t_submit: f64,
        jobspec: Value,
        reply: Sender<SchedResponse>,
    },
    /// Fire-and-forget by design; failures are audited internally.
    Free {
        id: u64,
        r: Value,
        is_final: bool,
    },
    Cancel {
        id: u64,
        reply: Sender<SchedResponse>,
    },
    Prioritize {
        updates: Vec<(u64, u32)>,
    },
    Feasibility {
        jobspec: Value,
        reply: Sender<SchedResponse>,
    },
    ResourceStatus {
        reply: Sender<ResourceStatus>,
    },
    Expiration {
        id: u64,
        expiration: f64,
        reply: Sender<SchedResponse>,
    },
    Stop,
}

pub enum Event {
    Request(Request),
    Resource(ResourceUpdate),
}

/// Terminal and annotation responses. Every alloc request receives exactly
/// one terminal response (success, deny, or cancel).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedResponse {
    Success {
        id: u64,
        r: String,
        resource_summary: String,
    },
    Deny {
        id: u64,
        note: String,
    },
    Cancel {
        id: u64,
    },
    Annotate {
        id: u64,
        reason_pending: String,
        jobs_ahead: usize,
    },
    Ok,
    Error {
        message: String,
    },
}

/// Reply to a resource-status request: three R objects.
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub all: Value,
    pub allocated: Value,
    pub down: Value,
}

pub struct SimpleSched {
    cfg: SchedConfig,
    rlist: Rlist,
    queue: Queue,
    events: Receiver<Event>,
    /// Set when the queue head cannot be placed; cleared by free and
    /// resource events (the "stop the prep watcher" state).
    blocked: bool,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SimpleSched {
    /// Synchronous startup: adopt the initial resource set (all targets
    /// down until the resource module reports otherwise), apply the first
    /// update, and replay in-flight allocations from the job-manager
    /// hello.
    pub fn new(
        cfg: SchedConfig,
        events: Receiver<Event>,
        initial: &Value,
        first_update: &ResourceUpdate,
        hello: &[HelloJob],
    ) -> Result<SimpleSched, SchedError> {
        let mut rlist = Rlist::from_json(initial)?;
        rlist.mark_down("all")?;
        let mut sched = SimpleSched {
            cfg,
            rlist,
            queue: Queue::new(),
            events,
            blocked: false,
        };
        sched.apply_resource_update(first_update)?;
        for job in hello {
            let alloc = Rlist::from_r(&job.r)
                .map_err(|e| SchedError::Fatal(format!("hello: R for job {}: {e}", job.id)))?;
            let summary = alloc.dumps();
            sched.rlist.set_allocated(&alloc).map_err(|e| {
                SchedError::Fatal(format!("hello: alloc {summary} for job {}: {e}", job.id))
            })?;
            debug!("hello: alloc {summary} for job {}", job.id);
        }
        info!(
            "ready: {} of {} cores: {}",
            sched.rlist.avail(),
            sched.rlist.total(),
            sched.rlist.dumps()
        );
        Ok(sched)
    }

    /// Serve until `Stop` arrives or a fatal accounting failure occurs.
    pub fn run(&mut self) -> Result<(), SchedError> {
        loop {
            let event = self.events.recv().map_err(|_| SchedError::Disconnected)?;
            match event {
                Event::Request(Request::Stop) => return Ok(()),
                Event::Request(request) => self.handle_request(request)?,
                Event::Resource(update) => {
                    self.apply_resource_update(&update)?;
                    self.blocked = false;
                }
            }
            // check stage: place queue heads until one does not fit
            while !self.blocked && !self.queue.is_empty() {
                self.try_alloc()?;
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<(), SchedError> {
        match request {
            Request::Alloc {
                id,
                priority,
                userid,
                t_submit,
                jobspec,
                reply,
            } => self.handle_alloc(id, priority, userid, t_submit, &jobspec, reply),
            Request::Free { id, r, is_final } => self.handle_free(id, &r, is_final)?,
            Request::Cancel { id, reply } => {
                if self.queue.remove(id).is_some() {
                    let _ = reply.send(SchedResponse::Cancel { id });
                    self.annotate_reason_pending();
                }
            }
            Request::Prioritize { updates } => {
                // small updates reorder in place; larger ones warrant a
                // full resort
                const MIN_SORT_SIZE: usize = 4;
                if updates.len() < MIN_SORT_SIZE {
                    for (id, priority) in &updates {
                        self.queue.reprioritize(*id, *priority);
                    }
                } else {
                    self.queue.reprioritize_bulk(&updates);
                }
                self.annotate_reason_pending();
            }
            Request::Feasibility { jobspec, reply } => {
                let response = self.handle_feasibility(&jobspec)?;
                let _ = reply.send(response);
            }
            Request::ResourceStatus { reply } => {
                let _ = reply.send(self.resource_status()?);
            }
            Request::Expiration {
                id,
                expiration,
                reply,
            } => {
                let response = if expiration < 0.0 {
                    SchedResponse::Error {
                        message: "invalid expiration".to_string(),
                    }
                } else if self.cfg.debug.expiration_update_deny {
                    SchedResponse::Error {
                        message: "rejecting expiration update for testing".to_string(),
                    }
                } else {
                    debug!("job {id} expiration updated to {expiration:.2}");
                    if expiration > 0.0 {
                        self.rlist.expiration = Some(expiration);
                    }
                    SchedResponse::Ok
                };
                let _ = reply.send(response);
            }
            Request::Stop => unreachable!("handled by run"),
        }
        Ok(())
    }

    fn handle_alloc(
        &mut self,
        id: u64,
        priority: u32,
        userid: u32,
        t_submit: f64,
        jobspec: &Value,
        reply: Sender<SchedResponse>,
    ) {
        if let Some(limit) = self.cfg.limit
            && self.queue.len() >= limit
        {
            error!("alloc received above max concurrency: {limit}");
            let _ = reply.send(SchedResponse::Error {
                message: format!("alloc received above max concurrency: {limit}"),
            });
            return;
        }
        let spec = match JobSpec::from_json(jobspec) {
            Ok(spec) => spec,
            Err(note) => {
                let _ = reply.send(SchedResponse::Deny { id, note });
                return;
            }
        };
        if spec.gpus_per_slot > 0 {
            let _ = reply.send(SchedResponse::Deny {
                id,
                note: "simple scheduler does not support resource type 'gpu'".to_string(),
            });
            return;
        }
        debug!(
            "req: {id}: spec={{{},{},{}}} duration={:.1}",
            spec.nnodes, spec.nslots, spec.slot_size, spec.duration
        );
        self.queue.insert(QueuedJob {
            id,
            priority,
            userid,
            t_submit,
            spec,
            reply,
        });
        // a new request re-arms placement even if the previous head blocked
        self.blocked = false;
    }

    /// Attempt to place the queue head. Exactly one terminal response per
    /// request: placed and dequeued, denied and dequeued, or left in place
    /// on transient exhaustion (which blocks the check stage).
    fn try_alloc(&mut self) -> Result<(), SchedError> {
        let Some(head) = self.queue.head() else {
            return Ok(());
        };
        let ai = AllocInfo {
            nnodes: head.spec.nnodes,
            nslots: head.spec.nslots,
            slot_size: head.spec.slot_size,
            exclusive: head.spec.exclusive,
            mode: self.cfg.alloc_mode,
            constraints: head.spec.constraints.clone(),
        };
        let result = if self.cfg.debug.fail_alloc {
            Err(RsetError::InvalidArgument("DEBUG_FAIL_ALLOC".into()))
        } else {
            self.rlist.alloc(&ai)
        };
        match result {
            Ok(mut alloc) => {
                let job = self.queue.pop_head().expect("head exists");
                let now = now_epoch();
                alloc.starttime = Some(now);
                alloc.expiration = if job.spec.duration > 0.0 {
                    Some(now + job.spec.duration)
                } else {
                    self.rlist.expiration
                };
                let summary = alloc.dumps();
                debug!("alloc: {}: {summary}", job.id);
                let _ = job.reply.send(SchedResponse::Success {
                    id: job.id,
                    r: alloc.encode(),
                    resource_summary: summary,
                });
            }
            Err(RsetError::NoSpace) => {
                self.annotate_reason_pending();
                self.blocked = true;
            }
            Err(e) => {
                let note = if self.cfg.debug.fail_alloc {
                    "DEBUG_FAIL_ALLOC".to_string()
                } else if e.is_unsatisfiable() {
                    "unsatisfiable request".to_string()
                } else {
                    "unable to allocate provided jobspec".to_string()
                };
                let job = self.queue.pop_head().expect("head exists");
                debug!("deny: {}: {note} ({e})", job.id);
                let _ = job.reply.send(SchedResponse::Deny { id: job.id, note });
            }
        }
        Ok(())
    }

    /// A free that cannot be applied (and is not excused by shrink) means
    /// the accounting is corrupt; stop the loop so a supervisor restarts
    /// us.
    fn handle_free(&mut self, id: u64, r: &Value, is_final: bool) -> Result<(), SchedError> {
        let alloc = match Rlist::from_json(r) {
            Ok(alloc) => alloc,
            Err(e) => {
                error!("free: unable to parse R for job {id}: {e}");
                return Err(SchedError::Fatal(format!("free: job {id}: {e}")));
            }
        };
        let summary = alloc.dumps();
        if let Err(e) = self.rlist.free_tolerant(&alloc) {
            error!("free: {summary}: {e}; stopping scheduler");
            return Err(SchedError::Fatal(format!("free: job {id}: {e}")));
        }
        debug!(
            "free: {summary} {id}{}",
            if is_final { " (final)" } else { "" }
        );
        self.blocked = false;
        Ok(())
    }

    fn handle_feasibility(&mut self, jobspec: &Value) -> Result<SchedResponse, SchedError> {
        let spec = match JobSpec::from_json(jobspec) {
            Ok(spec) => spec,
            Err(note) => return Ok(SchedResponse::Error { message: note }),
        };
        if spec.gpus_per_slot > 0 {
            return Ok(SchedResponse::Error {
                message: "unsupported resource type 'gpu'".to_string(),
            });
        }
        let ai = AllocInfo {
            nnodes: spec.nnodes,
            nslots: spec.nslots,
            slot_size: spec.slot_size,
            exclusive: spec.exclusive,
            mode: self.cfg.alloc_mode,
            constraints: spec.constraints.clone(),
        };
        match self.rlist.alloc(&ai) {
            Ok(alloc) => {
                // dry run only: hand the resources straight back
                if let Err(e) = self.rlist.free(&alloc) {
                    return Err(SchedError::Fatal(format!(
                        "feasibility: failed to free dry-run allocation: {e}"
                    )));
                }
                Ok(SchedResponse::Ok)
            }
            // no space today is still satisfiable
            Err(RsetError::NoSpace) => Ok(SchedResponse::Ok),
            Err(e) => Ok(SchedResponse::Error {
                message: e.to_string(),
            }),
        }
    }

    fn resource_status(&self) -> Result<ResourceStatus, SchedError> {
        let mut all = self.rlist.copy_empty();
        all.mark_up("all")?;
        Ok(ResourceStatus {
            all: all.to_rv1(),
            allocated: self.rlist.copy_allocated().to_rv1(),
            down: self.rlist.copy_down().to_rv1(),
        })
    }

    fn apply_resource_update(&mut self, update: &ResourceUpdate) -> Result<(), SchedError> {
        if let Some(up) = &update.up {
            self.rlist.mark_up(up)?;
        }
        if let Some(down) = &update.down {
            self.rlist.mark_down(down)?;
        }
        if let Some(shrink) = &update.shrink {
            let ids = IdSet::decode(shrink)
                .map_err(|e| SchedError::Fatal(format!("shrink: {e}")))?;
            let removed = self.rlist.remove_ranks(&ids);
            debug!("shrink: removed {removed} ranks ({shrink})");
        }
        if let Some(expiration) = update.expiration
            && self.rlist.expiration != Some(expiration)
        {
            info!("resource expiration updated to {expiration:.2}");
            self.rlist.expiration = Some(expiration);
        }
        Ok(())
    }

    /// Annotate every pending request with why it is waiting and how many
    /// jobs are ahead of it (debug-gated, like the original).
    fn annotate_reason_pending(&self) {
        if !self.cfg.debug.annotate_reason_pending {
            return;
        }
        for (jobs_ahead, job) in self.queue.iter().enumerate() {
            let _ = job.reply.send(SchedResponse::Annotate {
                id: job.id,
                reason_pending: "insufficient resources".to_string(),
                jobs_ahead,
            });
        }
    }
}
