use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flotilla_core::error::{FlotillaError, Result};

use super::mailbox::{bounded, Envelope, Mailbox, MailboxReceiver, Rejected};

/// Default mailbox size for [`ActorSystem::spawn`].
pub const DEFAULT_MAILBOX_CAPACITY: usize = 100;

/// Pause between attempts in [`ActorHandle::deliver`].
const DELIVER_BACKOFF: Duration = Duration::from_millis(5);

/// An entity that handles one message at a time.
///
/// Returning an error stops the actor and records the error.
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    /// Handle one message. `cancel` fires when the actor is asked to stop.
    fn receive(
        &mut self,
        envelope: Envelope<Self::Message>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Run state shared between an actor's task and its handles.
struct ActorCell {
    running: AtomicBool,
    error: OnceLock<String>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// `Arc<dyn Mailbox<M>>` for the actor's message type.
    mailbox: Box<dyn Any + Send + Sync>,
}

/// Terminal state of an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorResult {
    pub name: String,
    pub error: Option<String>,
}

/// Typed address of a spawned actor.
pub struct ActorHandle<M> {
    name: Arc<str>,
    mailbox: Arc<dyn Mailbox<M>>,
    cell: Arc<ActorCell>,
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            mailbox: Arc::clone(&self.mailbox),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<M: Send + 'static> ActorHandle<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.cell.running.load(Ordering::SeqCst)
    }

    /// Messages waiting in the mailbox.
    pub fn queued(&self) -> usize {
        self.mailbox.len()
    }

    /// Non-blocking send. Fails at once if the actor is stopped or its
    /// mailbox is full; the message is not queued in either case.
    pub fn send(&self, payload: M) -> Result<()> {
        self.send_from("", payload)
    }

    pub fn send_from(&self, from: &str, payload: M) -> Result<()> {
        self.try_deliver(Envelope::new(from, payload))
            .map_err(|rejected| self.rejection_error(&rejected))
    }

    /// Send, treating a full mailbox as backpressure: retry until the
    /// message is accepted or the actor stops.
    pub async fn deliver(&self, from: &str, payload: M) -> Result<()> {
        let mut envelope = Envelope::new(from, payload);
        loop {
            match self.try_deliver(envelope) {
                Ok(()) => return Ok(()),
                Err(Rejected::Full(env)) => {
                    envelope = env;
                    tokio::select! {
                        _ = self.cell.stop.cancelled() => {
                            return Err(FlotillaError::ActorStopped(self.name.to_string()));
                        }
                        _ = tokio::time::sleep(DELIVER_BACKOFF) => {}
                    }
                }
                Err(rejected) => return Err(self.rejection_error(&rejected)),
            }
        }
    }

    fn try_deliver(&self, envelope: Envelope<M>) -> std::result::Result<(), Rejected<M>> {
        if !self.is_running() {
            return Err(Rejected::Closed(envelope));
        }
        self.mailbox.try_send(envelope)
    }

    fn rejection_error(&self, rejected: &Rejected<M>) -> FlotillaError {
        match rejected {
            Rejected::Full(_) => FlotillaError::MailboxFull(self.name.to_string()),
            Rejected::Closed(_) => FlotillaError::ActorStopped(self.name.to_string()),
        }
    }
}

/// Registry and supervisor of named actors.
///
/// Each actor runs on its own task and processes its mailbox serially.
pub struct ActorSystem {
    actors: Mutex<HashMap<String, Arc<ActorCell>>>,
    cancel: CancellationToken,
    mailbox_capacity: usize,
}

impl ActorSystem {
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    /// A system whose actors stop when `cancel` fires.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            actors: Mutex::new(HashMap::new()),
            cancel,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Spawn an actor with a bounded in-process mailbox.
    pub async fn spawn<A: Actor>(&self, name: &str, actor: A) -> Result<ActorHandle<A::Message>> {
        let (mailbox, receiver) = bounded(self.mailbox_capacity);
        self.spawn_with(name, actor, Arc::new(mailbox), Box::new(receiver))
            .await
    }

    /// Spawn an actor on a caller-supplied mailbox backend.
    pub async fn spawn_with<A: Actor>(
        &self,
        name: &str,
        actor: A,
        mailbox: Arc<dyn Mailbox<A::Message>>,
        receiver: Box<dyn MailboxReceiver<A::Message>>,
    ) -> Result<ActorHandle<A::Message>> {
        if self.cancel.is_cancelled() {
            return Err(FlotillaError::ActorStopped(name.to_string()));
        }
        let mut actors = self.actors.lock().await;
        if actors.contains_key(name) {
            return Err(FlotillaError::invalid_input(format!("actor already exists: {}", name)));
        }

        let cell = Arc::new(ActorCell {
            running: AtomicBool::new(true),
            error: OnceLock::new(),
            stop: self.cancel.child_token(),
            task: Mutex::new(None),
            mailbox: Box::new(Arc::clone(&mailbox)),
        });
        let handle = ActorHandle {
            name: Arc::from(name),
            mailbox,
            cell: Arc::clone(&cell),
        };

        let task = tokio::spawn(run_actor(name.to_string(), actor, receiver, Arc::clone(&cell)));
        *cell.task.lock().await = Some(task);
        actors.insert(name.to_string(), cell);
        debug!(actor = %name, "Spawned actor");
        Ok(handle)
    }

    /// Look up a running or stopped actor by name.
    pub async fn handle<M: Send + 'static>(&self, name: &str) -> Result<ActorHandle<M>> {
        let cell = self.cell(name).await?;
        let mailbox = cell
            .mailbox
            .downcast_ref::<Arc<dyn Mailbox<M>>>()
            .cloned()
            .ok_or_else(|| FlotillaError::ActorNotFound(name.to_string()))?;
        Ok(ActorHandle {
            name: Arc::from(name),
            mailbox,
            cell,
        })
    }

    /// Send to a named actor.
    pub async fn send<M: Send + 'static>(&self, name: &str, from: &str, payload: M) -> Result<()> {
        self.handle::<M>(name).await?.send_from(from, payload)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        match self.actors.lock().await.get(name) {
            Some(cell) => cell.running.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// The error that stopped an actor, if it failed.
    pub async fn error(&self, name: &str) -> Result<Option<String>> {
        Ok(self.cell(name).await?.error.get().cloned())
    }

    /// Stop one actor and wait for its task to exit.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let cell = self.cell(name).await?;
        cell.stop.cancel();
        join(name, &cell).await;
        Ok(())
    }

    /// Wait until every actor has stopped on its own.
    pub async fn wait(&self) {
        for (name, cell) in self.cells().await {
            join(&name, &cell).await;
        }
    }

    /// Stop every actor and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait().await;
        debug!("Actor system shut down");
    }

    /// Name and terminal error of every actor, sorted by name.
    pub async fn results(&self) -> Vec<ActorResult> {
        let mut results: Vec<ActorResult> = self
            .cells()
            .await
            .into_iter()
            .map(|(name, cell)| ActorResult {
                name,
                error: cell.error.get().cloned(),
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    async fn cell(&self, name: &str) -> Result<Arc<ActorCell>> {
        self.actors
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| FlotillaError::ActorNotFound(name.to_string()))
    }

    async fn cells(&self) -> Vec<(String, Arc<ActorCell>)> {
        self.actors
            .lock()
            .await
            .iter()
            .map(|(name, cell)| (name.clone(), Arc::clone(cell)))
            .collect()
    }
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

async fn join(name: &str, cell: &ActorCell) {
    let task = cell.task.lock().await.take();
    if let Some(task) = task {
        if let Err(e) = task.await {
            warn!(actor = %name, error = %e, "Actor task panicked");
            let _ = cell.error.set(format!("actor task panicked: {}", e));
            cell.running.store(false, Ordering::SeqCst);
        }
    }
}

async fn run_actor<A: Actor>(
    name: String,
    mut actor: A,
    mut receiver: Box<dyn MailboxReceiver<A::Message>>,
    cell: Arc<ActorCell>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cell.stop.cancelled() => break,
            env = receiver.recv() => match env {
                Some(env) => env,
                None => break,
            },
        };

        if let Err(e) = actor.receive(envelope, cell.stop.clone()).await {
            warn!(actor = %name, error = %e, "Actor stopped on error");
            let _ = cell.error.set(e.to_string());
            break;
        }
    }

    cell.running.store(false, Ordering::SeqCst);
    receiver.close();
    debug!(actor = %name, "Actor exited");
}
