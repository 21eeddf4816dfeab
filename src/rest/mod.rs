pub mod bucket;
pub mod cooldown;
pub mod dispatcher;
pub mod headers;
pub mod http;
pub mod route;

pub use bucket::{Bucket, BucketHandle, BucketRegistry, BucketSnapshot, PendingGuard};
pub use cooldown::GlobalCooldown;
pub use dispatcher::{Execute, RequestDispatcher, RetryPolicy, RouteWorker};
pub use headers::RateLimitHeaders;
pub use http::{HttpExecutor, HttpFuture, ReqwestExecutor, RestRequest, RestResponse};
pub use route::RouteSignature;
