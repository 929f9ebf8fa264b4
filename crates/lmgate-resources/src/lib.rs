pub mod error;
pub mod http_client;
pub mod pool;
pub mod proxy_factory;

pub use error::PoolError;
pub use http_client::HttpClientScope;
pub use pool::{ResourcePool, ResourceSlot, RetryOutcome};
pub use proxy_factory::ProxyFactory;
