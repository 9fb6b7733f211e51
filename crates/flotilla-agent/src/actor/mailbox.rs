use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A message together with its delivery metadata.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    pub id: Uuid,
    /// Name of the sender, empty when sent from outside the actor system.
    pub from: String,
    pub payload: M,
    pub timestamp: DateTime<Utc>,
}

impl<M> Envelope<M> {
    pub fn new(from: impl Into<String>, payload: M) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Why a mailbox refused a message. The envelope is handed back unchanged.
#[derive(Debug)]
pub enum Rejected<M> {
    Full(Envelope<M>),
    Closed(Envelope<M>),
}

impl<M> Rejected<M> {
    pub fn into_envelope(self) -> Envelope<M> {
        match self {
            Self::Full(env) | Self::Closed(env) => env,
        }
    }
}

/// Sending half of an actor mailbox. Sends never wait.
pub trait Mailbox<M>: Send + Sync {
    fn try_send(&self, envelope: Envelope<M>) -> Result<(), Rejected<M>>;

    /// Messages currently queued.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn is_closed(&self) -> bool;
}

/// Receiving half of an actor mailbox, owned by the actor's task.
pub trait MailboxReceiver<M>: Send {
    /// Next message, or `None` once the mailbox is closed and drained.
    fn recv(&mut self) -> BoxFuture<'_, Option<Envelope<M>>>;

    /// Refuse further messages. Already queued messages can still be received.
    fn close(&mut self);
}

/// Bounded in-process mailbox backed by a tokio channel.
pub struct BoundedMailbox<M> {
    tx: mpsc::Sender<Envelope<M>>,
}

pub struct BoundedReceiver<M> {
    rx: mpsc::Receiver<Envelope<M>>,
}

/// A bounded mailbox pair. A zero capacity is raised to one.
pub fn bounded<M: Send + 'static>(capacity: usize) -> (BoundedMailbox<M>, BoundedReceiver<M>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BoundedMailbox { tx }, BoundedReceiver { rx })
}

impl<M: Send + 'static> Mailbox<M> for BoundedMailbox<M> {
    fn try_send(&self, envelope: Envelope<M>) -> Result<(), Rejected<M>> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(env) => Rejected::Full(env),
            mpsc::error::TrySendError::Closed(env) => Rejected::Closed(env),
        })
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M: Send + 'static> MailboxReceiver<M> for BoundedReceiver<M> {
    fn recv(&mut self) -> BoxFuture<'_, Option<Envelope<M>>> {
        Box::pin(self.rx.recv())
    }

    fn close(&mut self) {
        self.rx.close();
    }
}
