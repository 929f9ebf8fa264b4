use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Available,
    InUse,
    Cooling,
}

#[derive(Debug, Clone)]
struct SlotEntry {
    id: u64,
    value: String,
    state: SlotState,
}

struct PoolState {
    /// Round-robin order; `cursor` is an index into this vector.
    order: Vec<u64>,
    entries: std::collections::HashMap<u64, SlotEntry>,
    cursor: usize,
    renewing: bool,
}

/// A pool of N opaque string resources (API keys, proxy URLs) with
/// round-robin fair acquisition, optional cooldown-on-release, permanent
/// discard, and optional renewal from a remote URL when exhausted.
///
/// The "mutex + condvar" of the design is realised as a plain
/// [`std::sync::Mutex`] (so release can run synchronously from a Drop
/// impl) paired with a [`tokio::sync::Notify`] for waking waiters.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    notify: Notify,
    next_id: AtomicU64,
    cooldown_time: Duration,
    renew_url: Option<String>,
    repeat: u32,
    separator: String,
    renew_client: wreq::Client,
    /// A null pool immediately yields an empty-string slot and never
    /// blocks; release/discard are no-ops.
    is_null: bool,
}

/// An acquired resource. Dropping it without calling [`release`][Self::release]
/// or [`discard`][Self::discard] releases it without cooldown-bypass — the
/// same cooldown rule as an explicit `release(discard=false)` applies.
pub struct ResourceSlot {
    pool: Arc<ResourcePool>,
    id: u64,
    pub value: String,
    settled: bool,
}

impl ResourceSlot {
    fn null(pool: Arc<ResourcePool>) -> Self {
        Self {
            pool,
            id: 0,
            value: String::new(),
            settled: true,
        }
    }

    pub fn release(mut self) {
        if !self.pool.is_null {
            self.pool.release_slot(self.id, None);
        }
        self.settled = true;
    }

    /// Releases the slot with an explicit cooldown overriding the pool's
    /// configured `cooldown_time`. Used by callers that classify an
    /// upstream failure into a duration themselves (§7's status-to-cooldown
    /// table) rather than relying on one fixed pool-wide cooldown.
    pub fn release_with(mut self, cooldown: Duration) {
        if !self.pool.is_null {
            self.pool.release_slot(self.id, Some(cooldown));
        }
        self.settled = true;
    }

    pub fn discard(mut self) {
        if !self.pool.is_null {
            self.pool.discard_slot(self.id);
        }
        self.settled = true;
    }
}

impl Drop for ResourceSlot {
    fn drop(&mut self) {
        if !self.settled && !self.pool.is_null {
            self.pool.release_slot(self.id, None);
        }
    }
}

impl ResourcePool {
    pub fn new(initial: Vec<String>, cooldown_time: Duration, repeat: u32) -> Arc<Self> {
        Self::with_renewal(initial, cooldown_time, repeat, None, "\n".to_string())
    }

    pub fn with_renewal(
        initial: Vec<String>,
        cooldown_time: Duration,
        repeat: u32,
        renew_url: Option<String>,
        separator: String,
    ) -> Arc<Self> {
        let repeat = repeat.max(1);
        let mut order = Vec::new();
        let mut entries = std::collections::HashMap::new();
        let mut next_id = 0u64;
        for value in &initial {
            for _ in 0..repeat {
                order.push(next_id);
                entries.insert(
                    next_id,
                    SlotEntry {
                        id: next_id,
                        value: value.clone(),
                        state: SlotState::Available,
                    },
                );
                next_id += 1;
            }
        }

        Arc::new(Self {
            state: Mutex::new(PoolState {
                order,
                entries,
                cursor: 0,
                renewing: false,
            }),
            notify: Notify::new(),
            next_id: AtomicU64::new(next_id),
            cooldown_time,
            renew_url,
            repeat,
            separator,
            renew_client: wreq::Client::new(),
            is_null: false,
        })
    }

    /// A pool holding no real resources: acquire always yields the empty
    /// string immediately, release/discard are no-ops.
    pub fn null() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                order: Vec::new(),
                entries: std::collections::HashMap::new(),
                cursor: 0,
                renewing: false,
            }),
            notify: Notify::new(),
            next_id: AtomicU64::new(0),
            cooldown_time: Duration::ZERO,
            renew_url: None,
            repeat: 1,
            separator: "\n".to_string(),
            renew_client: wreq::Client::new(),
            is_null: true,
        })
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    /// Acquires the round-robin next available slot, waiting up to
    /// `timeout` and triggering pool renewal if configured and exhausted.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<ResourceSlot, PoolError> {
        if self.is_null {
            return Ok(ResourceSlot::null(self.clone()));
        }

        let deadline = Instant::now() + timeout;

        loop {
            let mut should_renew = false;
            {
                let mut state = self.state.lock().unwrap();
                if let Some((id, value)) = Self::take_next(&mut state) {
                    return Ok(ResourceSlot {
                        pool: self.clone(),
                        id,
                        value,
                        settled: false,
                    });
                }
                if state.order.is_empty() && self.renew_url.is_some() && !state.renewing {
                    state.renewing = true;
                    should_renew = true;
                }
            }

            if should_renew {
                self.renew().await;
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(PoolError::Timeout);
            }
        }
    }

    /// Takes the next available slot starting at `cursor`, marks it
    /// in-use, and advances the cursor past it.
    fn take_next(state: &mut PoolState) -> Option<(u64, String)> {
        let len = state.order.len();
        if len == 0 {
            return None;
        }
        for step in 0..len {
            let pos = (state.cursor + step) % len;
            let id = state.order[pos];
            if let Some(entry) = state.entries.get_mut(&id) {
                if entry.state == SlotState::Available {
                    entry.state = SlotState::InUse;
                    state.cursor = (pos + 1) % len;
                    return Some((id, entry.value.clone()));
                }
            }
        }
        None
    }

    fn discard_slot(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(&id);
        state.order.retain(|entry_id| *entry_id != id);
        drop(state);
        self.notify.notify_one();
    }

    /// Releases `id` back to the pool, cooling it down for `cooldown`
    /// (falling back to the pool's own `cooldown_time` when the caller
    /// doesn't override it).
    fn release_slot(self: &Arc<Self>, id: u64, cooldown: Option<Duration>) {
        let cooldown = cooldown.unwrap_or(self.cooldown_time);
        let mut state = self.state.lock().unwrap();

        if cooldown.is_zero() {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.state = SlotState::Available;
            }
            drop(state);
            self.notify.notify_one();
            return;
        }

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.state = SlotState::Cooling;
        }
        drop(state);

        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let mut state = pool.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.state = SlotState::Available;
            }
            drop(state);
            pool.notify.notify_one();
        });
    }

    /// Fetches a fresh resource list from `renew_url` (newline- or
    /// `separator`-delimited text), appends it (applying `repeat`), and
    /// wakes all waiters. At most one renewal runs at a time.
    async fn renew(self: &Arc<Self>) {
        let Some(url) = self.renew_url.clone() else {
            let mut state = self.state.lock().unwrap();
            state.renewing = false;
            return;
        };

        let fetched = self
            .renew_client
            .get(&url)
            .send()
            .await
            .ok();
        let text = match fetched {
            Some(resp) => resp.text().await.unwrap_or_default(),
            None => String::new(),
        };

        let mut state = self.state.lock().unwrap();
        for value in text.split(self.separator.as_str()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            for _ in 0..self.repeat {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                state.order.push(id);
                state.entries.insert(
                    id,
                    SlotEntry {
                        id,
                        value: value.to_string(),
                        state: SlotState::Available,
                    },
                );
            }
        }
        state.renewing = false;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Runs `attempt` up to `max_attempts` times, each with a distinct
    /// untried slot. The slot is released (never discarded) after every
    /// attempt. Retries when `is_retryable(&err)` is true, waiting `wait`
    /// between attempts; any other error aborts immediately and propagates.
    pub async fn retrying<F, Fut, T, E>(
        self: &Arc<Self>,
        max_attempts: u32,
        wait: Duration,
        timeout: Duration,
        mut attempt: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryOutcome<E>>
    where
        F: FnMut(&ResourceSlot) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut tried = HashSet::new();
        let mut last_err = None;

        for _ in 0..max_attempts {
            let slot = match self.acquire_untried(timeout, &tried).await {
                Ok(slot) => slot,
                Err(_) => return Err(RetryOutcome::NoMoreResource),
            };
            tried.insert(slot.id);

            let result = attempt(&slot).await;
            slot.release();

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_retryable(&err) {
                        return Err(RetryOutcome::Fatal(err));
                    }
                    last_err = Some(err);
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        match last_err {
            Some(err) => Err(RetryOutcome::Fatal(err)),
            None => Err(RetryOutcome::NoMoreResource),
        }
    }

    async fn acquire_untried(
        self: &Arc<Self>,
        timeout: Duration,
        tried: &HashSet<u64>,
    ) -> Result<ResourceSlot, PoolError> {
        if self.is_null {
            if tried.is_empty() {
                return Ok(ResourceSlot::null(self.clone()));
            }
            return Err(PoolError::NoMoreResource);
        }

        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some((id, value)) = Self::take_next_excluding(&mut state, tried) {
                    return Ok(ResourceSlot {
                        pool: self.clone(),
                        id,
                        value,
                        settled: false,
                    });
                }
                let untried_exists = state.order.iter().any(|id| !tried.contains(id));
                if !untried_exists {
                    return Err(PoolError::NoMoreResource);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(PoolError::Timeout);
            }
        }
    }

    fn take_next_excluding(
        state: &mut PoolState,
        tried: &HashSet<u64>,
    ) -> Option<(u64, String)> {
        let len = state.order.len();
        if len == 0 {
            return None;
        }
        for step in 0..len {
            let pos = (state.cursor + step) % len;
            let id = state.order[pos];
            if tried.contains(&id) {
                continue;
            }
            if let Some(entry) = state.entries.get_mut(&id) {
                if entry.state == SlotState::Available {
                    entry.state = SlotState::InUse;
                    state.cursor = (pos + 1) % len;
                    return Some((id, entry.value.clone()));
                }
            }
        }
        None
    }

    #[cfg(test)]
    pub fn available_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .entries
            .values()
            .filter(|e| e.state == SlotState::Available)
            .count()
    }
}

/// Outcome of a [`ResourcePool::retrying`] call distinguishing pool
/// exhaustion (surfaced by callers as `WorkerOverload`) from the inner
/// closure's own non-retryable error.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    NoMoreResource,
    Fatal(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_fairness() {
        let pool = ResourcePool::new(
            vec!["a".to_string(), "b".to_string()],
            Duration::ZERO,
            1,
        );
        let mut seen = std::collections::HashMap::new();
        for _ in 0..4 {
            let slot = pool.acquire(Duration::from_secs(1)).await.unwrap();
            *seen.entry(slot.value.clone()).or_insert(0) += 1;
            slot.release();
        }
        assert_eq!(seen.get("a"), Some(&2));
        assert_eq!(seen.get("b"), Some(&2));
    }

    #[tokio::test]
    async fn discard_does_not_reappear() {
        let pool = ResourcePool::new(vec!["a".to_string(), "b".to_string()], Duration::ZERO, 1);
        let slot = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(slot.value, "a");
        slot.discard();

        for _ in 0..4 {
            let slot = pool.acquire(Duration::from_secs(1)).await.unwrap();
            assert_eq!(slot.value, "b");
            slot.release();
        }
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let pool = ResourcePool::new(vec!["a".to_string()], Duration::from_secs(60), 1);
        let slot = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let result = pool.acquire(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PoolError::Timeout)));
        slot.release();
    }

    #[tokio::test]
    async fn null_pool_never_blocks() {
        let pool = ResourcePool::null();
        let slot = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(slot.value, "");
        slot.discard();
    }
}
