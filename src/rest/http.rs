//! HTTP executor seam between the dispatcher and the network.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use super::headers;
use crate::core::{ClientConfig, ClientError, ClientResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    /// Path relative to the API base, query string included.
    pub path: String,
    pub body: Option<Bytes>,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Attach the bucket headers a rate-limited route answers with.
    pub fn with_rate_limit(
        self,
        limit: u32,
        remaining: u32,
        reset_after: std::time::Duration,
        bucket: &str,
    ) -> Self {
        self.with_header(headers::LIMIT, limit.to_string())
            .with_header(headers::REMAINING, remaining.to_string())
            .with_header(headers::RESET_AFTER, format!("{:.3}", reset_after.as_secs_f64()))
            .with_header(headers::BUCKET, bucket)
    }

    pub fn json(&self) -> ClientResult<sonic_rs::Value> {
        sonic_rs::from_slice(&self.body).map_err(|err| ClientError::Decode(err.to_string()))
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub type HttpFuture = Pin<Box<dyn Future<Output = ClientResult<RestResponse>> + Send + 'static>>;

/// Performs one HTTP exchange. An `Err` means no response arrived at all.
pub trait HttpExecutor: Send + Sync + 'static {
    fn execute(&self, request: RestRequest) -> HttpFuture;
}

impl<E: HttpExecutor + ?Sized> HttpExecutor for Arc<E> {
    fn execute(&self, request: RestRequest) -> HttpFuture {
        (**self).execute(request)
    }
}

const AGENT: &str = concat!("DiscordBot (shardwire, ", env!("CARGO_PKG_VERSION"), ")");

/// `reqwest` executor bound to one API base URL and one token.
#[derive(Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
    base_url: Arc<str>,
    authorization: HeaderValue,
}

impl ReqwestExecutor {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_default())
            .build()
            .map_err(|err| ClientError::Config(format!("http client: {err}")))?;
        let mut authorization = HeaderValue::from_str(&config.authorization())
            .map_err(|_| ClientError::Config("token is not a valid header value".into()))?;
        authorization.set_sensitive(true);

        Ok(Self {
            client,
            base_url: Arc::from(config.api_base_url.trim_end_matches('/')),
            authorization,
        })
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute(&self, request: RestRequest) -> HttpFuture {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method, url)
            .header(AUTHORIZATION, self.authorization.clone())
            .header(USER_AGENT, AGENT);
        if let Some(body) = request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body);
        }

        Box::pin(async move {
            let response = builder.send().await.map_err(|err| ClientError::Transport {
                context: "http send",
                error: err.to_string(),
            })?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|err| ClientError::Transport {
                context: "http body",
                error: err.to_string(),
            })?;
            Ok(RestResponse {
                status,
                headers,
                body,
            })
        })
    }
}
