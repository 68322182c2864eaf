use std::{
    any::Any,
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
};

const OUTCOME_CAPACITY: usize = 64;

/// A deferred unit of work. Runs at most once and is discarded afterwards.
pub struct Job {
    name: String,
    run: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self { name: name.into(), run: Box::new(move || run().boxed()) }
    }

    pub fn name(&self) -> &str { &self.name }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JobResult {
    Succeeded,
    Failed(String),
    /// Abandoned after exceeding the configured job timeout.
    TimedOut,
    Panicked(String),
}

/// Published on the outcome channel when a job finishes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JobOutcome {
    pub id: u64,
    pub name: String,
    pub result: JobResult,
}

struct QueueState {
    pending: VecDeque<(u64, Job)>,
    draining: bool,
    next_id: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    outcomes: broadcast::Sender<JobOutcome>,
    idle: watch::Sender<bool>,
    job_timeout: Option<Duration>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Jobs run one at a time in enqueue order. A failing, panicking or timed out job is reported
/// on the outcome channel and the next job starts.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(job_timeout: Option<Duration>) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    draining: false,
                    next_id: 0,
                }),
                outcomes,
                idle,
                job_timeout,
            }),
        }
    }

    /// Appends a job and starts the drain loop if it isn't running. Returns the job ID.
    ///
    /// Safe to call from inside a running job. Outside a Tokio runtime the job stays pending
    /// until the next enqueue made from within one.
    pub fn enqueue(&self, job: Job) -> u64 {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        tracing::debug!("Enqueued job {} ({})", id, job.name);
        state.pending.push_back((id, job));
        self.inner.idle.send_replace(false);
        if !state.draining {
            match Handle::try_current() {
                Ok(handle) => {
                    state.draining = true;
                    handle.spawn(drain(self.inner.clone()));
                }
                Err(_) => tracing::warn!("No Tokio runtime, job {} left pending", id),
            }
        }
        id
    }

    /// Subscribes to outcomes of jobs finishing from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> { self.inner.outcomes.subscribe() }

    pub fn pending_len(&self) -> usize { self.inner.lock().pending.len() }

    pub fn is_draining(&self) -> bool { self.inner.lock().draining }

    /// Resolves once the queue is empty and no job is running.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives in `inner`, so this can't observe a closed channel.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Waits for outstanding jobs, giving up after `timeout`. Returns whether the queue drained.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let pending = self.pending_len();
        if self.is_draining() {
            tracing::info!("Waiting for running job and {} pending jobs", pending);
        }
        match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "Job queue did not drain within {}s, abandoning {} pending jobs",
                    timeout.as_secs(),
                    self.pending_len()
                );
                false
            }
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let (id, job) = {
            let mut state = inner.lock();
            match state.pending.pop_front() {
                Some(next) => next,
                None => {
                    state.draining = false;
                    inner.idle.send_replace(true);
                    return;
                }
            }
        };
        let Job { name, run } = job;
        tracing::info!("Running job {} ({})", id, name);
        let start = Instant::now();
        let result = execute(run, inner.job_timeout).await;
        let elapsed = start.elapsed().as_millis();
        match &result {
            JobResult::Succeeded => {
                tracing::info!("Job {} ({}) finished in {}ms", id, name, elapsed)
            }
            JobResult::Failed(e) => tracing::error!("Job {} ({}) failed: {}", id, name, e),
            JobResult::TimedOut => {
                tracing::warn!("Job {} ({}) timed out after {}ms", id, name, elapsed)
            }
            JobResult::Panicked(e) => tracing::error!("Job {} ({}) panicked: {}", id, name, e),
        }
        // No receivers is fine.
        let _ = inner.outcomes.send(JobOutcome { id, name, result });
    }
}

async fn execute(
    run: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>,
    job_timeout: Option<Duration>,
) -> JobResult {
    let fut = AssertUnwindSafe(async move { run().await }).catch_unwind();
    let result = match job_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => return JobResult::TimedOut,
        },
        None => fut.await,
    };
    match result {
        Ok(Ok(())) => JobResult::Succeeded,
        Ok(Err(e)) => JobResult::Failed(format!("{e:#}")),
        Err(payload) => JobResult::Panicked(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
