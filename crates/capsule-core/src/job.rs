//! Jobs and their single-resolution result handles.

use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use capsule_common::RuntimeError;

/// Result of a job: the guest's output bytes or the reason it failed.
pub type JobResult = Result<Vec<u8>, RuntimeError>;

/// A unit of work for a registered job type.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,
    /// Job type the module is registered under.
    pub job_type: String,
    /// Input passed to the module's run export.
    pub payload: Vec<u8>,
}

impl Job {
    /// Create a job with a fresh id.
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload: payload.into(),
        }
    }
}

/// Create a connected resolver/handle pair for a job.
pub fn channel(job_id: Uuid) -> (JobResolver, JobHandle) {
    let (tx, rx) = oneshot::channel();
    (
        JobResolver { tx: Some(tx) },
        JobHandle { job_id, rx },
    )
}

/// Write side of a job's result. Resolves at most once.
#[derive(Debug)]
pub struct JobResolver {
    tx: Option<oneshot::Sender<JobResult>>,
}

impl JobResolver {
    /// Deliver the result.
    ///
    /// Returns `false` if the job was already resolved or nobody is waiting
    /// any more; the result is discarded in both cases.
    pub fn resolve(&mut self, result: JobResult) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Returns `true` once [`resolve`](Self::resolve) has been called.
    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// Read side of a job's result.
///
/// Dropping the handle abandons the result without affecting the running job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    /// A handle that is already resolved.
    pub fn ready(job_id: Uuid, result: JobResult) -> Self {
        let (mut resolver, handle) = channel(job_id);
        resolver.resolve(result);
        handle
    }

    /// Id of the job this handle belongs to.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the result.
    ///
    /// A resolver dropped without resolving yields [`RuntimeError::JobDropped`].
    pub async fn then(self) -> JobResult {
        self.rx.await.unwrap_or(Err(RuntimeError::JobDropped))
    }

    /// Wait for the result, giving up after `timeout`.
    ///
    /// The job keeps running when the wait times out.
    pub async fn then_timeout(self, timeout: Duration) -> JobResult {
        tokio::time::timeout(timeout, self.then())
            .await
            .unwrap_or_else(|_| {
                Err(RuntimeError::ExecutionTimeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            })
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from within an async context.
    pub fn then_blocking(self) -> JobResult {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(RuntimeError::JobDropped))
    }
}
