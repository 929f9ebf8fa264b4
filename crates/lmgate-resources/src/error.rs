use std::fmt;

#[derive(Debug)]
pub enum PoolError {
    /// No slot became available within the requested timeout.
    Timeout,
    /// A `retrying` sequence exhausted every slot without success.
    NoMoreResource,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Timeout => write!(f, "timed out waiting for a resource"),
            PoolError::NoMoreResource => write!(f, "no more untried resources in this pool"),
        }
    }
}

impl std::error::Error for PoolError {}
