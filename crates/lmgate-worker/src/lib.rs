pub mod manager;
pub mod openai;
pub mod sse;
pub mod worker;

pub use manager::WorkerManager;
pub use openai::{OpenAiWorker, OpenAiWorkerConfig};
pub use sse::{SseLine, SseLineDecoder};
pub use worker::Worker;
