pub mod actor;
pub mod agent;
pub mod formation;
pub mod pool;
pub mod session;
pub mod structured;

pub use actor::{Actor, ActorHandle, ActorSystem, Envelope, Mailbox};
pub use agent::{Agent, AgentBuilder, AgentConfig};
pub use formation::{FormationDefinition, FormationRuntime, RunOutcome, RunStats};
pub use pool::{PoolConfig, PoolResult, PoolTask, SessionRunner, TaskRunner, WorkerPool};
pub use session::{RunResult, Session, SessionEvent, SessionStream, StructuredRun, ToolCallOutcome};
