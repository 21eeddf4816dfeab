//! Bucket Registry: per-route rate-limit buckets, re-keyed on server bucket tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::headers::{RateLimitHeaders, deadline_after};
use super::route::RouteSignature;

#[derive(Debug)]
struct BucketState {
    limit: Option<u32>,
    remaining: u32,
    reset_at: Option<Instant>,
    token: Option<String>,
    last_used: Instant,
}

/// One rate-limit bucket. Shared by every route the server maps onto it.
#[derive(Debug)]
pub struct Bucket {
    label: String,
    state: Mutex<BucketState>,
    pending: AtomicUsize,
    in_flight: tokio::sync::Mutex<()>,
}

pub type BucketHandle = Arc<Bucket>;

/// Snapshot of a bucket's prediction, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_at: Option<Instant>,
    pub token: Option<String>,
    pub pending: usize,
}

impl Bucket {
    /// Optimistic bucket: one call allowed, limit unknown until a response says otherwise.
    fn optimistic(label: String, now: Instant) -> Self {
        Self {
            label,
            state: Mutex::new(BucketState {
                limit: None,
                remaining: 1,
                reset_at: None,
                token: None,
                last_used: now,
            }),
            pending: AtomicUsize::new(0),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let state = self.state.lock();
        BucketSnapshot {
            limit: state.limit,
            remaining: state.remaining,
            reset_at: state.reset_at,
            token: state.token.clone(),
            pending: self.pending.load(Ordering::Acquire),
        }
    }

    /// Take one unit of capacity, or report when capacity returns.
    ///
    /// A passed reset refills `remaining` to the known limit first. With no
    /// known reset the call is allowed optimistically.
    pub fn try_reserve(&self, now: Instant) -> Result<(), Instant> {
        let mut state = self.state.lock();
        if let Some(reset_at) = state.reset_at {
            if now >= reset_at {
                state.remaining = state.limit.unwrap_or(1);
                state.reset_at = None;
            } else if state.remaining == 0 {
                return Err(reset_at);
            }
        }
        state.remaining = state.remaining.saturating_sub(1);
        state.last_used = now;
        Ok(())
    }

    /// Apply what a response said about this bucket.
    pub fn apply(&self, limits: &RateLimitHeaders, now: Instant) {
        let mut state = self.state.lock();
        if let Some(limit) = limits.limit {
            state.limit = Some(limit);
        }
        if let Some(remaining) = limits.remaining {
            state.remaining = remaining;
        }
        if let Some(reset_after) = limits.reset_after {
            state.reset_at = Some(deadline_after(now, reset_after));
        }
        if let Some(token) = &limits.bucket {
            state.token = Some(token.clone());
        }
        state.last_used = now;
    }

    /// Hold the bucket closed until `until` (a route-local 429).
    pub fn block_until(&self, until: Instant) {
        let mut state = self.state.lock();
        state.remaining = 0;
        state.reset_at = Some(state.reset_at.map_or(until, |current| current.max(until)));
    }

    /// Serializes calls on this bucket: at most one in flight.
    pub(crate) async fn in_flight(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.in_flight.lock().await
    }

    fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        if self.pending.load(Ordering::Acquire) > 0 {
            return false;
        }
        let state = self.state.lock();
        state.reset_at.is_none_or(|reset_at| reset_at <= now)
            && now.saturating_duration_since(state.last_used) >= idle
    }
}

/// Counts a request as pending on a bucket until dropped.
#[derive(Debug)]
pub struct PendingGuard {
    bucket: BucketHandle,
}

impl PendingGuard {
    pub fn new(bucket: BucketHandle) -> Self {
        bucket.pending.fetch_add(1, Ordering::AcqRel);
        Self { bucket }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.bucket.pending.fetch_sub(1, Ordering::AcqRel);
        self.bucket.state.lock().last_used = Instant::now();
    }
}

#[derive(Default)]
struct RegistryInner {
    routes: HashMap<RouteSignature, BucketHandle>,
    tokens: HashMap<String, BucketHandle>,
}

/// Route signature to bucket map. All mutation happens under one lock.
pub struct BucketRegistry {
    inner: Mutex<RegistryInner>,
    idle_after: Duration,
}

impl BucketRegistry {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            idle_after,
        }
    }

    /// Bucket for a route, creating an optimistic one on first sight.
    pub fn resolve(&self, route: &RouteSignature) -> BucketHandle {
        let mut inner = self.inner.lock();
        inner
            .routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Bucket::optimistic(route.to_string(), Instant::now())))
            .clone()
    }

    /// Apply a response to `bucket` and return the bucket the route now maps to.
    ///
    /// A bucket token already owned by another bucket re-keys the route onto
    /// that one; the server has consolidated them.
    pub fn update(
        &self,
        route: &RouteSignature,
        bucket: &BucketHandle,
        limits: &RateLimitHeaders,
        now: Instant,
    ) -> BucketHandle {
        let mut inner = self.inner.lock();
        let Some(token) = limits.bucket.as_deref() else {
            bucket.apply(limits, now);
            return bucket.clone();
        };

        let target = match inner.tokens.get(token) {
            Some(existing) if !Arc::ptr_eq(existing, bucket) => {
                debug!(
                    route = %route,
                    bucket = token,
                    "route re-keyed onto shared bucket"
                );
                existing.clone()
            }
            _ => bucket.clone(),
        };
        target.apply(limits, now);
        inner.tokens.insert(token.to_owned(), target.clone());
        inner.routes.insert(route.clone(), target.clone());
        target
    }

    /// Drop buckets whose reset has passed and that sat unused for the idle threshold.
    /// Returns the routes that lost their bucket.
    pub fn evict_idle(&self, now: Instant) -> Vec<RouteSignature> {
        let mut inner = self.inner.lock();
        let idle_after = self.idle_after;
        let mut evicted = Vec::new();
        inner.routes.retain(|route, bucket| {
            let keep = !bucket.is_idle(now, idle_after);
            if !keep {
                evicted.push(route.clone());
            }
            keep
        });
        inner
            .tokens
            .retain(|_, bucket| !bucket.is_idle(now, idle_after));
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
