pub mod authorization;
pub mod inject;
pub mod macro_mw;
pub mod manager;
pub mod middleware;
pub mod regex_mw;
pub mod tools;

pub use authorization::AuthorizationMiddleware;
pub use inject::{InjectMiddleware, InsertionConfig, Keywords};
pub use macro_mw::{MacroFn, MacroMiddleware, MacroRegistry};
pub use manager::MiddlewareManager;
pub use middleware::{ErrorDecision, Flow, Middleware};
pub use regex_mw::{RegexMiddleware, RegexRuleConfig};
pub use tools::{
    execute_tool_calls, GenerateHook, GenerateHookCell, ToolCallMiddleware, ToolDef, ToolFn,
    ToolRegistry,
};
