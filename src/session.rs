//! Time-bounded pool of reusable session tokens
//!
//! Some upstreams hand out an anti-bot cookie on an unauthenticated request
//! and accept it for a while afterwards. The pool keeps those tokens in FIFO
//! order, lazily purging expired ones on every access. The lock is held only
//! for queue manipulation, never across a network call, so two concurrent
//! misses may both probe.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::driver::fetch_response;
use crate::error::{BridgeError, Result};
use crate::http::HttpRequest;
use crate::net::Connector;

pub const SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// A token and the moment it was harvested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub created_at: Instant,
    pub token: String,
}

impl SessionEntry {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            created_at: Instant::now(),
            token: token.into(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

#[derive(Debug)]
pub struct SessionPool {
    entries: Mutex<VecDeque<SessionEntry>>,
    ttl: Duration,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Purge expired entries and take the oldest survivor, if any
    pub fn checkout(&self) -> Option<SessionEntry> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.is_expired(self.ttl));
        if entries.len() < before {
            debug!(purged = before - entries.len(), "purged expired session tokens");
        }
        entries.pop_front()
    }

    /// Take a cached token, or run `probe` to manufacture a new one.
    ///
    /// The probe runs without the lock held. An empty token from the probe is
    /// rejected with [`BridgeError::SessionAcquireFailed`].
    pub async fn acquire<F, Fut>(&self, probe: F) -> Result<SessionEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(entry) = self.checkout() {
            debug!("reusing cached session token");
            return Ok(entry);
        }

        info!("no cached session token, probing upstream");
        let token = probe().await?;
        if token.is_empty() {
            return Err(BridgeError::SessionAcquireFailed(
                "cookie is empty".to_string(),
            ));
        }
        Ok(SessionEntry::new(token))
    }

    /// Return a successfully used entry to the back of the queue.
    ///
    /// The original harvest time is kept, so reuse never extends a token's life.
    pub fn release(&self, entry: SessionEntry) {
        if entry.is_expired(self.ttl) {
            debug!("dropping expired session token on release");
            return;
        }
        self.entries.lock().push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the first `Set-Cookie` value carrying `marker` and reduce it to the
/// bare `name=value` pair
pub fn harvest_token<'a, I>(set_cookies: I, marker: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    set_cookies
        .into_iter()
        .find(|value| value.contains(marker))
        .and_then(|value| value.trim().split(' ').next())
        .map(|pair| pair.trim_end_matches(';').to_string())
}

/// Send an unauthenticated probe and harvest a session token from its
/// `Set-Cookie` headers
pub async fn probe_session_token<C>(
    connector: &C,
    request: &HttpRequest,
    marker: &str,
) -> Result<String>
where
    C: Connector,
{
    let response = fetch_response(connector, request).await?;
    if response.head.status != 200 {
        warn!(status = response.head.status, reason = %response.head.reason, "session probe rejected");
        return Err(BridgeError::SessionAcquireFailed(format!(
            "probe returned {} {}",
            response.head.status, response.head.reason
        )));
    }

    let token = harvest_token(response.head.header_values("set-cookie"), marker)
        .ok_or_else(|| {
            BridgeError::SessionAcquireFailed(format!("no set-cookie carrying `{}`", marker))
        })?;
    if token.is_empty() {
        return Err(BridgeError::SessionAcquireFailed(
            "cookie is empty".to_string(),
        ));
    }
    info!(marker, "harvested session token");
    Ok(token)
}

/// Session pools keyed by upstream name, shared through the process context
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pools: DashMap<String, Arc<SessionPool>>,
    ttl: Option<Duration>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// The pool for `name`, created on first use
    pub fn pool(&self, name: &str) -> Arc<SessionPool> {
        if let Some(pool) = self.pools.get(name) {
            return Arc::clone(&pool);
        }
        let ttl = self.ttl.unwrap_or(SESSION_TTL);
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(SessionPool::with_ttl(ttl)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
