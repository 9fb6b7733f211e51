pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, FlotillaError, Result};
pub use event::{EventBus, EventSink, FormationEvent, FormationEventKind};
pub use traits::{InferenceStream, Provider, Tool};
pub use types::*;
