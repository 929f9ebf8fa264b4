pub mod engine;
pub mod retry;
pub mod stream_adaptor;

pub use engine::Engine;
pub use retry::RetryConfig;
