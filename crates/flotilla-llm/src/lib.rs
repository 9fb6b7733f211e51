pub mod decoder;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod streaming;

pub use decoder::StreamDecoder;
pub use providers::anthropic::AnthropicProvider;
pub use registry::{ProviderFactory, ProviderOptions, ProviderRegistry};
pub use retry::RetryingProvider;
pub use streaming::{SseEvent, SseParser};
