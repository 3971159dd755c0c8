//! In-memory repository fakes and scripted handlers shared by the engine,
//! queue, and scheduler tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flowline_types::error::RepositoryError;
use flowline_types::job::{Job, JobStatus};
use flowline_types::schedule::Schedule;
use flowline_types::workflow::{Workflow, WorkflowFilter, WorkflowStatus};
use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::queue::broker::{BrokerClient, BrokerDelivery, BrokerError, BrokerPush};
use crate::queue::{JobFailure, JobHandler};
use crate::repository::{JobRepository, ScheduleRepository, WorkflowRepository};
use crate::workflow::context::WorkflowContext;
use crate::workflow::handler::{StepError, StepHandler};

// ---------------------------------------------------------------------------
// Workflow repository
// ---------------------------------------------------------------------------

/// Mutex-backed `WorkflowRepository` with the same conditional-lock
/// semantics as the SQLite implementation.
#[derive(Default)]
pub struct MemoryWorkflowRepository {
    rows: Mutex<HashMap<Uuid, Workflow>>,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: overwrite lock fields directly.
    pub fn set_lock(&self, id: &Uuid, locked: bool, locked_at: Option<DateTime<Utc>>) {
        let mut rows = self.rows.lock().unwrap();
        let wf = rows.get_mut(id).expect("workflow exists");
        wf.locked = locked;
        wf.locked_at = locked_at;
    }
}

impl WorkflowRepository for MemoryWorkflowRepository {
    async fn create(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.rows
            .lock()
            .unwrap()
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn update(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        if !rows.contains_key(&workflow.id) {
            return Err(RepositoryError::NotFound);
        }
        rows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<Workflow> = rows
            .values()
            .filter(|wf| filter.status.is_none_or(|s| wf.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn try_lock(
        &self,
        id: &Uuid,
        locked_at: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(wf) = rows.get_mut(id) else {
            return Ok(false);
        };
        let acquirable = !wf.locked || wf.locked_at.is_none_or(|at| at <= stale_cutoff);
        if !acquirable {
            return Ok(false);
        }
        wf.locked = true;
        wf.locked_at = Some(locked_at);
        wf.status = WorkflowStatus::Running;
        Ok(true)
    }

    async fn unlock(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let wf = rows.get_mut(id).ok_or(RepositoryError::NotFound)?;
        wf.locked = false;
        wf.locked_at = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Job repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJobRepository {
    rows: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &Job) -> Result<(), RepositoryError> {
        self.rows.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        if !rows.contains_key(&job.id) {
            return Err(RepositoryError::NotFound);
        }
        rows.insert(job.id, job.clone());
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let rows = self.rows.lock().unwrap();
        let mut due: Vec<Job> = rows
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        due.truncate(limit as usize);
        Ok(due)
    }
}

// ---------------------------------------------------------------------------
// Schedule repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryScheduleRepository {
    rows: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleRepository for MemoryScheduleRepository {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        self.rows
            .lock()
            .unwrap()
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Schedule>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        if !rows.contains_key(&schedule.id) {
            return Err(RepositoryError::NotFound);
        }
        rows.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.rows.lock().unwrap().remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Schedule>, RepositoryError> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    async fn list_enabled(&self) -> Result<Vec<Schedule>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn set_enabled(&self, id: &Uuid, enabled: bool) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let schedule = rows.get_mut(id).ok_or(RepositoryError::NotFound)?;
        schedule.enabled = enabled;
        Ok(())
    }

    async fn touch_last_run(&self, id: &Uuid, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let schedule = rows.get_mut(id).ok_or(RepositoryError::NotFound)?;
        schedule.last_run_at = Some(at);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted handlers
// ---------------------------------------------------------------------------

/// Handler returning a fixed value and recording each invocation.
pub struct RecordingHandler {
    pub result: Value,
    pub calls: Mutex<Vec<Value>>,
}

impl RecordingHandler {
    pub fn returning(result: Value) -> Arc<Self> {
        Arc::new(Self {
            result,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl StepHandler for RecordingHandler {
    fn execute<'a>(
        &'a self,
        config: &'a Value,
        _context: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(config.clone());
            Ok(self.result.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Queue doubles
// ---------------------------------------------------------------------------

/// Job handler failing a set number of calls before succeeding.
pub struct ScriptedJobHandler {
    fail_first: u32,
    calls: Mutex<u32>,
}

impl ScriptedJobHandler {
    pub fn failing(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            calls: Mutex::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl JobHandler for ScriptedJobHandler {
    fn run_task(&self, _task_id: Uuid) -> BoxFuture<'_, Result<(), JobFailure>> {
        Box::pin(async move {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_first {
                Err(JobFailure("handler blew up".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

/// Scripted `BrokerClient` recording every interaction.
pub struct MockBroker {
    reachable: bool,
    deliveries: Mutex<std::collections::VecDeque<BrokerDelivery>>,
    pushes: Mutex<Vec<BrokerPush>>,
    acks: Mutex<Vec<String>>,
    nacks: Mutex<Vec<(String, String)>>,
}

impl MockBroker {
    pub fn reachable() -> Self {
        Self::with_reachability(true)
    }

    pub fn unreachable() -> Self {
        Self::with_reachability(false)
    }

    fn with_reachability(reachable: bool) -> Self {
        Self {
            reachable,
            deliveries: Mutex::new(std::collections::VecDeque::new()),
            pushes: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_delivery(&self, delivery: BrokerDelivery) {
        self.deliveries.lock().unwrap().push_back(delivery);
    }

    pub fn pushes(&self) -> Vec<BrokerPush> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.acks.lock().unwrap().clone()
    }

    pub fn nacked(&self) -> Vec<(String, String)> {
        self.nacks.lock().unwrap().clone()
    }
}

impl BrokerClient for MockBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        if self.reachable {
            Ok(())
        } else {
            Err(BrokerError::Unreachable("connection refused".to_string()))
        }
    }

    async fn push(&self, push: &BrokerPush) -> Result<(), BrokerError> {
        if !self.reachable {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        self.pushes.lock().unwrap().push(push.clone());
        Ok(())
    }

    async fn pull(
        &self,
        wait: std::time::Duration,
    ) -> Result<Option<BrokerDelivery>, BrokerError> {
        if !self.reachable {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        let next = self.deliveries.lock().unwrap().pop_front();
        match next {
            Some(delivery) => Ok(Some(delivery)),
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), BrokerError> {
        self.acks.lock().unwrap().push(receipt.to_string());
        Ok(())
    }

    async fn nack(&self, receipt: &str, error: &str) -> Result<(), BrokerError> {
        self.nacks
            .lock()
            .unwrap()
            .push((receipt.to_string(), error.to_string()));
        Ok(())
    }
}

/// Handler failing a set number of times before succeeding.
pub struct FlakyHandler {
    pub failures_before_success: u32,
    pub permanent: bool,
    pub calls: Mutex<u32>,
}

impl FlakyHandler {
    pub fn transient(failures_before_success: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success,
            permanent: false,
            calls: Mutex::new(0),
        })
    }

    pub fn always_permanent() -> Arc<Self> {
        Arc::new(Self {
            failures_before_success: u32::MAX,
            permanent: true,
            calls: Mutex::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl StepHandler for FlakyHandler {
    fn execute<'a>(
        &'a self,
        _config: &'a Value,
        _context: &'a WorkflowContext,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures_before_success {
                if self.permanent {
                    Err(StepError::Permanent("handler rejected input".to_string()))
                } else {
                    Err(StepError::Transient("connection reset".to_string()))
                }
            } else {
                Ok(Value::String("recovered".to_string()))
            }
        })
    }
}
