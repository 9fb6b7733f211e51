//! Minimal actor runtime: named actors with bounded mailboxes, each
//! processing its messages serially on a dedicated task.

pub mod mailbox;
pub mod system;

pub use mailbox::{bounded, BoundedMailbox, BoundedReceiver, Envelope, Mailbox, MailboxReceiver, Rejected};
pub use system::{Actor, ActorHandle, ActorResult, ActorSystem, DEFAULT_MAILBOX_CAPACITY};
