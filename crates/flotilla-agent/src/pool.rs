use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flotilla_core::error::{FlotillaError, Result};

use crate::actor::{Actor, ActorHandle, ActorSystem, Envelope};
use crate::agent::Agent;
use crate::session::{RunResult, Session};

const COLLECTOR: &str = "collector";

/// Pool sizing and failure policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// Mailbox size of each worker.
    pub mailbox_capacity: usize,
    /// Cancel every in-flight and queued task once one fails.
    pub fail_fast: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            mailbox_capacity: crate::actor::DEFAULT_MAILBOX_CAPACITY,
            fail_fast: false,
        }
    }
}

/// A unit of work submitted to a pool.
#[derive(Debug, Clone, Default)]
pub struct PoolTask {
    pub message: String,
    /// Overrides the runner's working directory for this task.
    pub work_dir: Option<PathBuf>,
    /// Overrides the agent instructions for this task.
    pub instructions: Option<String>,
    /// Correlation data, returned untouched with the result.
    pub data: Value,
}

impl PoolTask {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Outcome of one task.
#[derive(Debug)]
pub struct PoolResult<T> {
    /// Submission index.
    pub index: usize,
    pub worker: String,
    pub outcome: Result<T>,
    pub data: Value,
    /// Completion order, starting at 0.
    pub sequence: usize,
}

/// Executes pool tasks on behalf of a worker.
pub trait TaskRunner: Send + Sync + 'static {
    type Output: Send + 'static;

    fn run<'a>(
        &'a self,
        task: PoolTask,
        worker: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Self::Output>>;
}

/// Runs each task as a fresh [`Session`] of one agent.
pub struct SessionRunner {
    agent: Arc<Agent>,
    work_dir: PathBuf,
}

impl SessionRunner {
    pub fn new(agent: Arc<Agent>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            work_dir: work_dir.into(),
        }
    }

    /// A session for `task`, with its overrides applied.
    pub fn session_for(&self, task: &PoolTask) -> Session {
        let agent = match &task.instructions {
            Some(instructions) => Arc::new(self.agent.with_instructions(instructions.clone())),
            None => Arc::clone(&self.agent),
        };
        let work_dir = task.work_dir.clone().unwrap_or_else(|| self.work_dir.clone());
        Session::new(agent, work_dir)
    }
}

impl TaskRunner for SessionRunner {
    type Output = RunResult;

    fn run<'a>(
        &'a self,
        task: PoolTask,
        _worker: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<RunResult>> {
        Box::pin(async move {
            let session = self.session_for(&task);
            session.run(&task.message, cancel).await
        })
    }
}

struct Job {
    index: usize,
    task: PoolTask,
}

struct Collected<T> {
    expected: usize,
    received: usize,
    results: Vec<PoolResult<T>>,
}

struct Shared<T> {
    collected: Mutex<Collected<T>>,
    done: Notify,
}

struct Worker<R: TaskRunner> {
    name: String,
    runner: Arc<R>,
    collector: ActorHandle<PoolResult<R::Output>>,
    pool_cancel: CancellationToken,
    fail_fast: bool,
}

impl<R: TaskRunner> Actor for Worker<R> {
    type Message = Job;

    fn receive(&mut self, envelope: Envelope<Job>, _cancel: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Job { index, task } = envelope.payload;
            let data = task.data.clone();

            let outcome = if self.pool_cancel.is_cancelled() {
                Err(FlotillaError::Cancelled)
            } else {
                debug!(worker = %self.name, index, "Running task");
                let run = self.runner.run(task, &self.name, self.pool_cancel.clone());
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(FlotillaError::TaskPanicked {
                        worker: self.name.clone(),
                        message: panic_message(panic.as_ref()),
                    }),
                }
            };

            if let Err(e) = &outcome {
                if !matches!(e, FlotillaError::Cancelled) {
                    warn!(worker = %self.name, index, error = %e, "Task failed");
                    if self.fail_fast {
                        self.pool_cancel.cancel();
                    }
                }
            }

            let result = PoolResult {
                index,
                worker: self.name.clone(),
                outcome,
                data,
                sequence: 0,
            };
            self.collector.deliver(&self.name, result).await
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Collector<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Actor for Collector<T> {
    type Message = PoolResult<T>;

    fn receive(&mut self, envelope: Envelope<PoolResult<T>>, _cancel: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut collected = self.shared.collected.lock().await;
            let mut result = envelope.payload;
            result.sequence = collected.received;
            collected.results.push(result);
            collected.received += 1;
            if collected.received >= collected.expected {
                self.shared.done.notify_waiters();
            }
            Ok(())
        })
    }
}

/// Fixed set of worker actors plus one collector actor.
///
/// Tasks are assigned round-robin. Results are gathered by the collector and
/// handed out in submission order by [`WorkerPool::await_all`].
pub struct WorkerPool<R: TaskRunner> {
    system: ActorSystem,
    workers: Vec<ActorHandle<Job>>,
    shared: Arc<Shared<R::Output>>,
    cancel: CancellationToken,
    shut_down: CancellationToken,
}

impl<R: TaskRunner> WorkerPool<R> {
    /// Spawn the pool. Tasks observe `cancel` and the pool's own fail-fast
    /// cancellation.
    pub async fn new(config: PoolConfig, runner: R, cancel: CancellationToken) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(FlotillaError::invalid_input("worker pool needs at least one worker"));
        }

        let shut_down = CancellationToken::new();
        let system = ActorSystem::with_cancel(shut_down.clone())
            .with_mailbox_capacity(config.mailbox_capacity);
        let shared = Arc::new(Shared {
            collected: Mutex::new(Collected {
                expected: 0,
                received: 0,
                results: Vec::new(),
            }),
            done: Notify::new(),
        });

        let collector = system
            .spawn(COLLECTOR, Collector { shared: Arc::clone(&shared) })
            .await?;

        let runner = Arc::new(runner);
        let pool_cancel = cancel.child_token();
        let mut workers = Vec::with_capacity(config.worker_count);
        for i in 0..config.worker_count {
            let name = format!("worker-{}", i);
            let worker = Worker {
                name: name.clone(),
                runner: Arc::clone(&runner),
                collector: collector.clone(),
                pool_cancel: pool_cancel.clone(),
                fail_fast: config.fail_fast,
            };
            workers.push(system.spawn(&name, worker).await?);
        }

        info!(workers = config.worker_count, fail_fast = config.fail_fast, "Worker pool started");
        Ok(Self {
            system,
            workers,
            shared,
            cancel: pool_cancel,
            shut_down,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Token cancelled on fail-fast or when the caller's token fires.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a task on the next worker. Returns its submission index.
    ///
    /// Never waits: a full worker mailbox is reported as `MailboxFull` and
    /// the task is not counted.
    pub async fn submit(&self, task: PoolTask) -> Result<usize> {
        if self.shut_down.is_cancelled() {
            return Err(FlotillaError::PoolShutdown);
        }
        let mut collected = self.shared.collected.lock().await;
        let index = collected.expected;
        let worker = &self.workers[index % self.workers.len()];
        worker.send(Job { index, task }).map_err(|e| match e {
            FlotillaError::ActorStopped(_) => FlotillaError::PoolShutdown,
            other => other,
        })?;
        collected.expected += 1;
        debug!(index, worker = %worker.name(), "Task submitted");
        Ok(index)
    }

    /// Wait until every submitted task has reported, then return the results
    /// ordered by submission index.
    pub async fn await_all(&self) -> Result<Vec<PoolResult<R::Output>>> {
        loop {
            let notified = self.shared.done.notified();
            {
                let mut collected = self.shared.collected.lock().await;
                if collected.received >= collected.expected {
                    let mut results = std::mem::take(&mut collected.results);
                    collected.expected -= collected.received;
                    collected.received = 0;
                    results.sort_by_key(|r| r.index);
                    return Ok(results);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shut_down.cancelled() => return Err(FlotillaError::PoolShutdown),
            }
        }
    }

    /// Cancel in-flight tasks, then stop every worker and the collector and
    /// wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.shut_down.cancel();
        self.cancel.cancel();
        self.system.shutdown().await;
        debug!("Worker pool shut down");
    }
}
