pub mod attempt;
pub mod context;
pub mod delta;
pub mod error;
pub mod response;

pub use attempt::Attempt;
pub use context::{Context, Metadata, Modality, PayloadSettings};
pub use delta::{merge_tool_calls, Delta, FunctionCallDelta, ToolCallDelta};
pub use error::{EngineError, Termination, WorkerError};
pub use response::{fold_text_stream, DeltaStream, Response, ResponseBody};
