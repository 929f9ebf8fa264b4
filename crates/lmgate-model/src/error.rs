use std::fmt;

use crate::response::Response;

/// Error kinds a Worker (or anything downstream of it) can raise. Mirrors
/// §7: the WorkerManager guard matches on the variant, not the message, to
/// decide whether to advance to the next worker or escalate.
#[derive(Debug)]
pub enum WorkerError {
    /// This worker does not handle the requested (model, modality).
    Unsupported(String),
    /// No capacity right now (exhausted keys, 429, pool timeout).
    Overload(String),
    /// Upstream explicitly rejected the request (bad model, auth failure).
    NoAvailable(String),
    /// Generic upstream failure, eligible for retry.
    Upstream(String),
    /// Anything unclassified; never caught by the per-worker guard.
    Fatal(String),
}

impl WorkerError {
    pub fn message(&self) -> &str {
        match self {
            WorkerError::Unsupported(m)
            | WorkerError::Overload(m)
            | WorkerError::NoAvailable(m)
            | WorkerError::Upstream(m)
            | WorkerError::Fatal(m) => m,
        }
    }

    /// Whether WorkerManager's per-worker guard should treat this as a
    /// warning (advance to the next worker) rather than escalate.
    pub fn is_worker_local(&self) -> bool {
        !matches!(self, WorkerError::Fatal(_))
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Unsupported(m) => write!(f, "worker unsupported: {m}"),
            WorkerError::Overload(m) => write!(f, "worker overload: {m}"),
            WorkerError::NoAvailable(m) => write!(f, "worker no available: {m}"),
            WorkerError::Upstream(m) => write!(f, "worker error: {m}"),
            WorkerError::Fatal(m) => write!(f, "fatal: {m}"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Cooperative short-circuit: carries the Response the client should see
/// and bypasses the remainder of the middleware chain and any retry in
/// flight. Never retried.
#[derive(Debug)]
pub struct Termination {
    pub response: Response,
}

impl Termination {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "termination: status {}", self.response.status_code)
    }
}

impl std::error::Error for Termination {}

/// The union of everything that can escape the middleware/retry pipeline
/// for one request.
#[derive(Debug)]
pub enum EngineError {
    Worker(WorkerError),
    Termination(Termination),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Worker(e) => write!(f, "{e}"),
            EngineError::Termination(t) => write!(f, "{t}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<WorkerError> for EngineError {
    fn from(value: WorkerError) -> Self {
        EngineError::Worker(value)
    }
}

impl From<Termination> for EngineError {
    fn from(value: Termination) -> Self {
        EngineError::Termination(value)
    }
}
