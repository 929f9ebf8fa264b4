use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::pool::ResourcePool;

/// One call's worth of egress: acquires a proxy slot from `pool`, hands out
/// a cached [`wreq::Client`] bound to it, and releases the slot on scope
/// exit — discarding it instead if the call was classified as a proxy
/// failure.
pub struct HttpClientScope {
    pool: Arc<ResourcePool>,
    slot: Option<crate::pool::ResourceSlot>,
    pub client: wreq::Client,
}

impl HttpClientScope {
    pub async fn acquire(
        worker_name: &str,
        pool: Arc<ResourcePool>,
        timeout: Duration,
    ) -> Result<Self, crate::error::PoolError> {
        let slot = pool.acquire(timeout).await?;
        let client = client_for(worker_name, &slot.value)?;
        Ok(Self {
            pool,
            slot: Some(slot),
            client,
        })
    }

    /// Call after a request fails in a way classified as a proxy failure
    /// (connection refused/reset through the proxy, proxy-auth rejection).
    pub fn discard_proxy(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.discard();
        }
    }
}

impl Drop for HttpClientScope {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.release();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    worker: String,
    proxy: String,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

fn client_for(worker_name: &str, proxy: &str) -> Result<wreq::Client, crate::error::PoolError> {
    let key = ClientKey {
        worker: worker_name.to_string(),
        proxy: proxy.to_string(),
    };

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap();
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let client = build_client(proxy);
    guard.insert(key, client.clone());
    Ok(client)
}

/// Builds a client bound to one proxy (empty string = direct egress) with
/// a per-client cookie jar and a bounded redirect policy, matching the
/// profile every adapter's scoped call expects.
fn build_client(proxy: &str) -> wreq::Client {
    let mut builder = wreq::Client::builder()
        .cookie_store(true)
        .redirect(wreq::redirect::Policy::limited(9));

    if !proxy.is_empty() {
        if let Ok(p) = wreq::Proxy::all(proxy) {
            builder = builder.proxy(p);
        }
    }

    builder.build().unwrap_or_else(|_| wreq::Client::new())
}
