//! Rate-limit response headers and 429 bodies.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use serde::Deserialize;
use tokio::time::Instant;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Longest wait any server-supplied rate-limit value is allowed to impose.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60 * 60);

/// What one response said about its bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the bucket resets, relative to when the response was read.
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
    #[serde(default)]
    global: bool,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_headers_at(headers, SystemTime::now())
    }

    /// Parse against an explicit wall clock, used to turn `X-RateLimit-Reset` into a delay.
    pub fn from_headers_at(headers: &HeaderMap, now: SystemTime) -> Self {
        let reset_after = parse::<f64>(headers, RESET_AFTER)
            .and_then(seconds)
            .or_else(|| {
                let reset = parse::<f64>(headers, RESET)?;
                let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
                seconds((reset - now).max(0.0))
            });

        Self {
            limit: parse(headers, LIMIT),
            remaining: parse(headers, REMAINING),
            reset_after,
            bucket: text(headers, BUCKET).map(str::to_owned),
            global: text(headers, GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: text(headers, SCOPE).map(str::to_owned),
            retry_after: parse::<f64>(headers, RETRY_AFTER).and_then(seconds),
        }
    }

    /// Fill `retry_after` and `global` from a 429 JSON body where headers left them out.
    pub fn merge_body(&mut self, body: &[u8]) {
        let Ok(parsed) = sonic_rs::from_slice::<RateLimitBody>(body) else {
            return;
        };
        if self.retry_after.is_none() {
            self.retry_after = seconds(parsed.retry_after);
        }
        self.global |= parsed.global;
    }

    /// Any bucket information at all?
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_after.is_none()
            && self.bucket.is_none()
    }
}

fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    text(headers, name)?.parse().ok()
}

/// Non-negative seconds, clamped to [`MAX_RATE_LIMIT_WAIT`]. NaN and negatives are ignored.
fn seconds(value: f64) -> Option<Duration> {
    if value.is_nan() || value < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(value)
            .map_or(MAX_RATE_LIMIT_WAIT, |wait| wait.min(MAX_RATE_LIMIT_WAIT)),
    )
}

/// `now + wait` without overflow; the wait is capped at [`MAX_RATE_LIMIT_WAIT`].
pub fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait.min(MAX_RATE_LIMIT_WAIT)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn reads_bucket_headers() {
        let parsed = RateLimitHeaders::from_headers(&headers(&[
            (LIMIT, "5"),
            (REMAINING, "4"),
            (RESET_AFTER, "1.5"),
            (BUCKET, "abcd"),
        ]));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(4));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd"));
        assert!(!parsed.global);
        assert!(!parsed.is_empty());
    }

    #[test]
    fn reset_after_wins_over_reset() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let both = RateLimitHeaders::from_headers_at(
            &headers(&[(RESET, "1010"), (RESET_AFTER, "2")]),
            now,
        );
        assert_eq!(both.reset_after, Some(Duration::from_secs(2)));

        let only_reset = RateLimitHeaders::from_headers_at(&headers(&[(RESET, "1003.25")]), now);
        assert_eq!(only_reset.reset_after, Some(Duration::from_millis(3250)));

        let past = RateLimitHeaders::from_headers_at(&headers(&[(RESET, "10")]), now);
        assert_eq!(past.reset_after, Some(Duration::ZERO));
    }

    #[test]
    fn global_flag_from_header_or_body() {
        let mut parsed = RateLimitHeaders::from_headers(&headers(&[
            (GLOBAL, "true"),
            (SCOPE, "global"),
            (RETRY_AFTER, "2"),
        ]));
        assert!(parsed.global);
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(parsed.scope.as_deref(), Some("global"));

        let mut bare = RateLimitHeaders::default();
        bare.merge_body(br#"{"message":"You are being rate limited.","retry_after":0.75,"global":true}"#);
        assert!(bare.global);
        assert_eq!(bare.retry_after, Some(Duration::from_millis(750)));

        // header value survives a body that disagrees
        parsed.merge_body(br#"{"retry_after":9,"global":false}"#);
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
        assert!(parsed.global);
    }

    #[test]
    fn oversized_waits_are_clamped() {
        let mut parsed = RateLimitHeaders::from_headers(&headers(&[
            (RETRY_AFTER, "1e20"),
            (RESET_AFTER, "inf"),
        ]));
        assert_eq!(parsed.retry_after, Some(MAX_RATE_LIMIT_WAIT));
        assert_eq!(parsed.reset_after, Some(MAX_RATE_LIMIT_WAIT));

        parsed.retry_after = None;
        parsed.merge_body(br#"{"retry_after":1e300}"#);
        assert_eq!(parsed.retry_after, Some(MAX_RATE_LIMIT_WAIT));

        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), now + MAX_RATE_LIMIT_WAIT);
    }

    #[test]
    fn garbage_is_ignored() {
        let mut parsed = RateLimitHeaders::from_headers(&headers(&[
            (LIMIT, "many"),
            (RESET_AFTER, "-1"),
        ]));
        parsed.merge_body(b"not json");
        assert!(parsed.is_empty());
        assert_eq!(parsed.retry_after, None);
    }
}
