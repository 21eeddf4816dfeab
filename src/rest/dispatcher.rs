//! Request Dispatcher: per-route FIFO workers over a shared bucket registry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use kameo::message::{Context, Message as KameoMessage};
use kameo::prelude::{Actor, ActorRef};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::bucket::{Bucket, BucketRegistry, PendingGuard};
use super::cooldown::GlobalCooldown;
use super::headers::{RateLimitHeaders, deadline_after};
use super::http::{HttpExecutor, RestRequest, RestResponse};
use super::route::RouteSignature;
use crate::core::types::ReconnectStrategy;
use crate::core::{ClientConfig, ClientError, ClientResult, ExponentialBackoff};

/// Fallback wait for a 429 that names no delay at all.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Retry budget shared by every route worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
    pub max_rate_limit_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            max_rate_limit_retries: config.max_rate_limit_retries,
            backoff_base: config.retry_backoff_base(),
            backoff_max: config.retry_backoff_max(),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_max, 2.0).with_jitter(0.5)
    }
}

/// Serializes the calls of one route signature.
pub struct RouteWorker {
    route: RouteSignature,
    http: Arc<dyn HttpExecutor>,
    registry: Arc<BucketRegistry>,
    cooldown: GlobalCooldown,
    policy: RetryPolicy,
}

impl Actor for RouteWorker {
    type Args = Self;
    type Error = ClientError;

    fn name() -> &'static str {
        "RouteWorker"
    }

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        debug!(route = %args.route, "route worker started");
        Ok(args)
    }
}

/// One queued call. The reply is dropped silently if the caller already timed out.
pub struct Execute {
    request: RestRequest,
    reply: oneshot::Sender<ClientResult<RestResponse>>,
    _pending: PendingGuard,
}

impl KameoMessage<Execute> for RouteWorker {
    type Reply = ();

    async fn handle(&mut self, msg: Execute, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let Execute {
            request,
            reply,
            _pending: pending,
        } = msg;
        let result = self.run(&request).await;
        drop(pending);
        if reply.send(result).is_err() {
            debug!(route = %self.route, "caller gone; response discarded");
        }
    }
}

impl RouteWorker {
    /// Take one unit of `bucket`, sleeping through its reset. Returns `false` without
    /// consuming anything once a global cooldown is active.
    async fn reserve(&self, bucket: &Bucket) -> bool {
        loop {
            if self.cooldown.is_active() {
                return false;
            }
            match bucket.try_reserve(Instant::now()) {
                Ok(()) => return true,
                Err(until) => {
                    debug!(
                        route = %self.route,
                        bucket = bucket.label(),
                        wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "bucket exhausted; waiting for reset"
                    );
                    tokio::time::sleep_until(until).await;
                }
            }
        }
    }

    async fn run(&self, request: &RestRequest) -> ClientResult<RestResponse> {
        let mut backoff = self.policy.backoff();
        let mut failures = 0u32;
        let mut rate_limited = 0u32;

        loop {
            self.cooldown.wait().await;

            let bucket = self.registry.resolve(&self.route);
            let in_flight = bucket.in_flight().await;
            if !self.reserve(&bucket).await {
                continue;
            }

            debug!(route = %self.route, path = %request.path, "sending request");
            let response = match self.http.execute(request.clone()).await {
                Ok(response) => response,
                Err(err) => {
                    failures += 1;
                    if failures > self.policy.max_retry_attempts {
                        return Err(ClientError::TransientServer {
                            status: None,
                            message: err.to_string(),
                        });
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        route = %self.route,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "request failed before a response; retrying"
                    );
                    drop(in_flight);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let now = Instant::now();
            let mut limits = RateLimitHeaders::from_headers(&response.headers);
            let status = response.status;

            if status == StatusCode::TOO_MANY_REQUESTS {
                limits.merge_body(&response.body);
                let global = limits.global || limits.scope.as_deref() == Some("global");
                let retry_after = limits
                    .retry_after
                    .or(limits.reset_after)
                    .unwrap_or(DEFAULT_RETRY_AFTER);
                rate_limited += 1;
                if rate_limited > self.policy.max_rate_limit_retries {
                    return Err(ClientError::RateLimited {
                        scope: self.route.to_string(),
                        global,
                        retry_after,
                    });
                }

                warn!(
                    route = %self.route,
                    bucket = bucket.label(),
                    global,
                    retry_after_ms = retry_after.as_millis() as u64,
                    attempt = rate_limited,
                    "rate limited"
                );
                let until = deadline_after(now, retry_after);
                if global {
                    self.cooldown.trigger(until);
                } else {
                    let target = self.registry.update(&self.route, &bucket, &limits, now);
                    target.block_until(until);
                }
                continue;
            }

            self.registry.update(&self.route, &bucket, &limits, now);

            if status.is_success() {
                return Ok(response);
            }
            if status.is_server_error() {
                failures += 1;
                if failures > self.policy.max_retry_attempts {
                    return Err(ClientError::TransientServer {
                        status: Some(status.as_u16()),
                        message: response.text_lossy(),
                    });
                }
                let delay = backoff.next_delay();
                warn!(
                    route = %self.route,
                    status = status.as_u16(),
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "server error; retrying"
                );
                drop(in_flight);
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(ClientError::RequestRejected {
                status: status.as_u16(),
                body: response.text_lossy(),
            });
        }
    }
}

struct DispatcherInner {
    http: Arc<dyn HttpExecutor>,
    registry: Arc<BucketRegistry>,
    cooldown: GlobalCooldown,
    policy: RetryPolicy,
    default_timeout: Duration,
    workers: Mutex<HashMap<RouteSignature, ActorRef<RouteWorker>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

/// Rate-limit aware REST front door. Cheap to clone; clones share buckets and cooldown.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl RequestDispatcher {
    /// Build a dispatcher and start its idle-bucket sweep. Must run inside a tokio runtime.
    pub fn new(config: &ClientConfig, http: Arc<dyn HttpExecutor>) -> Self {
        Self::with_parts(
            http,
            RetryPolicy::from_config(config),
            config.request_timeout_default(),
            config.bucket_idle_eviction_interval(),
        )
    }

    pub fn with_parts(
        http: Arc<dyn HttpExecutor>,
        policy: RetryPolicy,
        default_timeout: Duration,
        eviction_interval: Duration,
    ) -> Self {
        let inner = Arc::new(DispatcherInner {
            http,
            registry: Arc::new(BucketRegistry::new(eviction_interval)),
            cooldown: GlobalCooldown::new(),
            policy,
            default_timeout,
            workers: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), eviction_interval);
        *inner.sweeper.lock() = Some(sweeper);
        Self { inner }
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.inner.registry
    }

    pub fn cooldown(&self) -> &GlobalCooldown {
        &self.inner.cooldown
    }

    /// Submit a call; the route signature is derived from the path.
    pub async fn submit(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> ClientResult<RestResponse> {
        let route = RouteSignature::new(method.clone(), path);
        let request = RestRequest {
            method,
            path: path.to_string(),
            body,
        };
        self.submit_route(route, request, timeout).await
    }

    /// Submit under an explicit route signature.
    ///
    /// Calls on one signature run in submission order. On timeout the call
    /// keeps its place and its eventual result is discarded.
    pub async fn submit_route(
        &self,
        route: RouteSignature,
        request: RestRequest,
        timeout: Option<Duration>,
    ) -> ClientResult<RestResponse> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let (worker, pending) = self.checkout(&route);
        let (reply, response) = oneshot::channel();
        let message = Execute {
            request,
            reply,
            _pending: pending,
        };

        let call = async {
            worker
                .tell(message)
                .send()
                .await
                .map_err(|err| ClientError::ActorError(err.to_string()))?;
            response
                .await
                .map_err(|_| ClientError::ActorError(format!("route worker for {route} stopped")))?
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                context: format!("{route} after {}ms", timeout.as_millis()),
            }),
        }
    }

    /// Worker for a route plus a pending mark on its bucket, taken under one lock
    /// so a concurrent sweep cannot retire either.
    fn checkout(&self, route: &RouteSignature) -> (ActorRef<RouteWorker>, PendingGuard) {
        let mut workers = self.inner.workers.lock();
        let pending = PendingGuard::new(self.inner.registry.resolve(route));
        if let Some(worker) = workers.get(route) {
            if worker.is_alive() {
                return (worker.clone(), pending);
            }
            warn!(route = %route, "route worker stopped unexpectedly; respawning");
        }
        let worker = RouteWorker::spawn(RouteWorker {
            route: route.clone(),
            http: self.inner.http.clone(),
            registry: self.inner.registry.clone(),
            cooldown: self.inner.cooldown.clone(),
            policy: self.inner.policy,
        });
        workers.insert(route.clone(), worker.clone());
        (worker, pending)
    }

    /// Run one eviction pass now. Returns how many routes were retired.
    pub fn sweep(&self) -> usize {
        sweep(&self.inner)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }
}

fn sweep(inner: &DispatcherInner) -> usize {
    let mut workers = inner.workers.lock();
    let evicted = inner.registry.evict_idle(Instant::now());
    for route in &evicted {
        if let Some(worker) = workers.remove(route) {
            tokio::spawn(async move {
                let _ = worker.stop_gracefully().await;
            });
        }
    }
    if !evicted.is_empty() {
        debug!(evicted = evicted.len(), "evicted idle buckets");
    }
    evicted.len()
}

fn spawn_sweeper(inner: Weak<DispatcherInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                info!("dispatcher dropped; bucket sweep stopping");
                break;
            };
            sweep(&inner);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::headers::MAX_RATE_LIMIT_WAIT;
    use crate::testing::MockHttpExecutor;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: 2,
            max_rate_limit_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        }
    }

    fn dispatcher(http: &MockHttpExecutor) -> RequestDispatcher {
        RequestDispatcher::with_parts(
            Arc::new(http.clone()),
            policy(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_body_and_updates_bucket() {
        let http = MockHttpExecutor::new();
        http.reply(
            RestResponse::new(StatusCode::OK, "{}")
                .with_rate_limit(5, 4, Duration::from_secs(2), "b1"),
        );
        let dispatcher = dispatcher(&http);

        let response = dispatcher
            .submit(Method::GET, "/channels/1/messages", None, None)
            .await
            .expect("ok");
        assert_eq!(response.status, StatusCode::OK);

        let bucket = dispatcher
            .registry()
            .resolve(&RouteSignature::new(Method::GET, "/channels/1/messages"));
        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.limit, Some(5));
        assert_eq!(snapshot.remaining, 4);
        assert_eq!(snapshot.token.as_deref(), Some("b1"));
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let http = MockHttpExecutor::new();
        http.reply(RestResponse::new(StatusCode::FORBIDDEN, "missing access"));
        let dispatcher = dispatcher(&http);

        let err = dispatcher
            .submit(Method::POST, "/channels/1/messages", Some(Bytes::from_static(b"{}")), None)
            .await
            .expect_err("rejected");
        assert!(matches!(
            err,
            ClientError::RequestRejected { status: 403, ref body } if body == "missing access"
        ));
        assert_eq!(http.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_exhaust_into_transient_error() {
        let http = MockHttpExecutor::new();
        for _ in 0..3 {
            http.fail("connection reset");
        }
        let dispatcher = dispatcher(&http);

        let err = dispatcher
            .submit(Method::GET, "/gateway/bot", None, None)
            .await
            .expect_err("exhausted");
        assert!(matches!(err, ClientError::TransientServer { status: None, .. }));
        assert_eq!(http.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_are_bounded() {
        let http = MockHttpExecutor::new();
        for _ in 0..4 {
            http.reply(
                RestResponse::new(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after":0.1,"global":false}"#),
            );
        }
        let dispatcher = dispatcher(&http);

        let err = dispatcher
            .submit(Method::GET, "/channels/1/messages", None, None)
            .await
            .expect_err("gave up");
        assert!(matches!(err, ClientError::RateLimited { global: false, .. }));
        assert_eq!(http.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn absurd_retry_after_is_capped_and_the_route_survives() {
        let http = MockHttpExecutor::new();
        http.reply(
            RestResponse::new(StatusCode::TOO_MANY_REQUESTS, "{}").with_header("retry-after", "1e20"),
        );
        let dispatcher = dispatcher(&http);
        let path = "/channels/1/messages";

        let err = dispatcher
            .submit(Method::GET, path, None, Some(Duration::from_secs(1)))
            .await
            .expect_err("still waiting out the limit");
        assert!(matches!(err, ClientError::Timeout { .. }));

        let response = dispatcher
            .submit(Method::GET, path, None, Some(MAX_RATE_LIMIT_WAIT * 3))
            .await
            .expect("route still served");
        assert_eq!(response.status, StatusCode::OK);

        let calls = http.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].at >= calls[0].at + MAX_RATE_LIMIT_WAIT);
        assert!(calls[1].at <= calls[0].at + MAX_RATE_LIMIT_WAIT + Duration::from_secs(1));
        assert_eq!(dispatcher.worker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_worker_is_replaced_on_next_submit() {
        let http = MockHttpExecutor::new();
        let dispatcher = dispatcher(&http);
        let path = "/channels/1/messages";
        let route = RouteSignature::new(Method::GET, path);

        dispatcher
            .submit(Method::GET, path, None, None)
            .await
            .expect("first");
        let worker = dispatcher
            .inner
            .workers
            .lock()
            .get(&route)
            .cloned()
            .expect("worker");
        worker.kill();
        worker.wait_for_shutdown().await;
        assert!(!worker.is_alive());

        dispatcher
            .submit(Method::GET, path, None, None)
            .await
            .expect("served by a fresh worker");
        assert_eq!(dispatcher.worker_count(), 1);
        assert_eq!(http.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_during_cooldown_keeps_bucket_capacity() {
        let http = MockHttpExecutor::new();
        let dispatcher = dispatcher(&http);
        let route = RouteSignature::new(Method::GET, "/channels/1/messages");
        let bucket = dispatcher.registry().resolve(&route);
        let now = Instant::now();
        bucket.apply(
            &RateLimitHeaders {
                limit: Some(5),
                remaining: Some(1),
                reset_after: Some(Duration::from_secs(10)),
                ..RateLimitHeaders::default()
            },
            now,
        );
        dispatcher.cooldown().trigger(now + Duration::from_secs(1));

        let worker = RouteWorker {
            route,
            http: Arc::new(http.clone()),
            registry: dispatcher.inner.registry.clone(),
            cooldown: dispatcher.inner.cooldown.clone(),
            policy: policy(),
        };
        assert!(!worker.reserve(&bucket).await);
        assert_eq!(bucket.snapshot().remaining, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(worker.reserve(&bucket).await);
        assert_eq!(bucket.snapshot().remaining, 0);
        assert!(Instant::now() < now + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_retires_idle_routes() {
        let http = MockHttpExecutor::new();
        http.reply(RestResponse::new(StatusCode::OK, "{}"));
        let dispatcher = dispatcher(&http);
        dispatcher
            .submit(Method::GET, "/channels/1/messages", None, None)
            .await
            .expect("ok");
        assert_eq!(dispatcher.worker_count(), 1);

        assert_eq!(dispatcher.sweep(), 0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(dispatcher.worker_count(), 0);
        assert!(dispatcher.registry().is_empty());
    }
}
