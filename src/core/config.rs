use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use super::inflate::Compression;
use super::types::{ClientError, ClientResult};

const ENV_PREFIX: &str = "SHARDWIRE_";

/// What the coordinator does with a shard that reached the fatal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalRestartPolicy {
    /// Publish the fatal notice and leave the shard stopped.
    #[default]
    Surface,
    /// Restart from scratch after `fatal_restart_cooldown`. Authentication failures are never restarted.
    Restart,
}

/// Client configuration. Every field except `token` has a working default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub token: String,
    pub intents: u64,
    pub gateway_url: String,
    pub api_base_url: String,
    pub compression: Compression,

    pub shard_count: u32,
    pub identify_interval_ms: u64,
    pub identify_max_concurrency: u32,

    /// Consecutive missed heartbeat acks before the connection is declared dead.
    pub heartbeat_ack_grace: u32,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub reconnect_backoff_jitter: f64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub fatal_restart: FatalRestartPolicy,
    pub fatal_restart_cooldown_ms: u64,
    pub gateway_commands_per_minute: u32,
    pub event_buffer: usize,

    pub bucket_idle_eviction_interval_ms: u64,
    pub max_retry_attempts: u32,
    pub max_rate_limit_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub request_timeout_default_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: 0,
            gateway_url: "wss://gateway.discord.gg".to_string(),
            api_base_url: "https://discord.com/api/v10".to_string(),
            compression: Compression::None,
            shard_count: 1,
            identify_interval_ms: 5_000,
            identify_max_concurrency: 1,
            heartbeat_ack_grace: 2,
            reconnect_backoff_base_ms: 1_000,
            reconnect_backoff_max_ms: 60_000,
            reconnect_backoff_jitter: 0.5,
            max_reconnect_attempts: None,
            fatal_restart: FatalRestartPolicy::Surface,
            fatal_restart_cooldown_ms: 30_000,
            gateway_commands_per_minute: 120,
            event_buffer: 1_024,
            bucket_idle_eviction_interval_ms: 300_000,
            max_retry_attempts: 3,
            max_rate_limit_retries: 5,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 8_000,
            request_timeout_default_ms: 15_000,
        }
    }
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Load from `SHARDWIRE_*` environment variables, reading a `.env` file first if present.
    pub fn from_env() -> ClientResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> ClientResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        config.token = var("TOKEN")
            .ok_or_else(|| ClientError::Config(format!("{ENV_PREFIX}TOKEN is not set")))?;
        if let Some(url) = var("GATEWAY_URL") {
            config.gateway_url = url;
        }
        if let Some(url) = var("API_BASE_URL") {
            config.api_base_url = url;
        }
        if let Some(raw) = var("COMPRESSION") {
            config.compression = Compression::parse(&raw).ok_or_else(|| {
                ClientError::Config(format!("{ENV_PREFIX}COMPRESSION: unknown mode {raw:?}"))
            })?;
        }
        if let Some(raw) = var("FATAL_RESTART") {
            config.fatal_restart = match raw.trim().to_ascii_lowercase().as_str() {
                "surface" => FatalRestartPolicy::Surface,
                "restart" => FatalRestartPolicy::Restart,
                _ => {
                    return Err(ClientError::Config(format!(
                        "{ENV_PREFIX}FATAL_RESTART: expected surface|restart, got {raw:?}"
                    )));
                }
            };
        }

        parse_into(&var, "INTENTS", &mut config.intents)?;
        parse_into(&var, "SHARD_COUNT", &mut config.shard_count)?;
        parse_into(&var, "IDENTIFY_INTERVAL_MS", &mut config.identify_interval_ms)?;
        parse_into(
            &var,
            "IDENTIFY_MAX_CONCURRENCY",
            &mut config.identify_max_concurrency,
        )?;
        parse_into(&var, "HEARTBEAT_ACK_GRACE", &mut config.heartbeat_ack_grace)?;
        parse_into(
            &var,
            "RECONNECT_BACKOFF_BASE_MS",
            &mut config.reconnect_backoff_base_ms,
        )?;
        parse_into(
            &var,
            "RECONNECT_BACKOFF_MAX_MS",
            &mut config.reconnect_backoff_max_ms,
        )?;
        parse_into(
            &var,
            "RECONNECT_BACKOFF_JITTER",
            &mut config.reconnect_backoff_jitter,
        )?;
        if var("MAX_RECONNECT_ATTEMPTS").is_some() {
            let mut attempts = 0u32;
            parse_into(&var, "MAX_RECONNECT_ATTEMPTS", &mut attempts)?;
            config.max_reconnect_attempts = Some(attempts);
        }
        parse_into(
            &var,
            "FATAL_RESTART_COOLDOWN_MS",
            &mut config.fatal_restart_cooldown_ms,
        )?;
        parse_into(
            &var,
            "GATEWAY_COMMANDS_PER_MINUTE",
            &mut config.gateway_commands_per_minute,
        )?;
        parse_into(&var, "EVENT_BUFFER", &mut config.event_buffer)?;
        parse_into(
            &var,
            "BUCKET_IDLE_EVICTION_INTERVAL_MS",
            &mut config.bucket_idle_eviction_interval_ms,
        )?;
        parse_into(&var, "MAX_RETRY_ATTEMPTS", &mut config.max_retry_attempts)?;
        parse_into(
            &var,
            "MAX_RATE_LIMIT_RETRIES",
            &mut config.max_rate_limit_retries,
        )?;
        parse_into(&var, "RETRY_BACKOFF_BASE_MS", &mut config.retry_backoff_base_ms)?;
        parse_into(&var, "RETRY_BACKOFF_MAX_MS", &mut config.retry_backoff_max_ms)?;
        parse_into(
            &var,
            "REQUEST_TIMEOUT_DEFAULT_MS",
            &mut config.request_timeout_default_ms,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that can never work, before any connection is attempted.
    pub fn validate(&self) -> ClientResult<()> {
        let token = self.bare_token();
        if token.is_empty() {
            return Err(ClientError::Config("token is empty".to_string()));
        }
        if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ClientError::Config(
                "token contains whitespace or control characters".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(ClientError::Config("shard_count must be at least 1".into()));
        }
        if self.identify_max_concurrency == 0 {
            return Err(ClientError::Config(
                "identify_max_concurrency must be at least 1".into(),
            ));
        }
        if self.heartbeat_ack_grace == 0 {
            return Err(ClientError::Config(
                "heartbeat_ack_grace must be at least 1".into(),
            ));
        }
        if self.reconnect_backoff_base_ms > self.reconnect_backoff_max_ms {
            return Err(ClientError::Config(format!(
                "reconnect backoff base ({}ms) exceeds max ({}ms)",
                self.reconnect_backoff_base_ms, self.reconnect_backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect_backoff_jitter) {
            return Err(ClientError::Config(format!(
                "reconnect_backoff_jitter must be within 0..=1, got {}",
                self.reconnect_backoff_jitter
            )));
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(ClientError::Config(format!(
                "retry backoff base ({}ms) exceeds max ({}ms)",
                self.retry_backoff_base_ms, self.retry_backoff_max_ms
            )));
        }
        if self.event_buffer == 0 {
            return Err(ClientError::Config("event_buffer must be at least 1".into()));
        }
        if self.request_timeout_default_ms == 0 {
            return Err(ClientError::Config(
                "request_timeout_default_ms must be positive".into(),
            ));
        }
        for (name, url, schemes) in [
            ("gateway_url", &self.gateway_url, &["ws://", "wss://"]),
            ("api_base_url", &self.api_base_url, &["http://", "https://"]),
        ] {
            if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(ClientError::Config(format!(
                    "{name} must start with {}: {url}",
                    schemes.join(" or ")
                )));
            }
        }
        Ok(())
    }

    /// Token without a leading `Bot ` prefix.
    pub fn bare_token(&self) -> &str {
        let token = self.token.trim();
        token.strip_prefix("Bot ").unwrap_or(token)
    }

    /// Value for the REST `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.bare_token())
    }

    pub fn identify_interval(&self) -> Duration {
        Duration::from_millis(self.identify_interval_ms)
    }

    pub fn reconnect_backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_base_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn fatal_restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.fatal_restart_cooldown_ms)
    }

    pub fn bucket_idle_eviction_interval(&self) -> Duration {
        Duration::from_millis(self.bucket_idle_eviction_interval_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn request_timeout_default(&self) -> Duration {
        Duration::from_millis(self.request_timeout_default_ms)
    }
}

fn parse_into<T, F>(var: &F, name: &str, slot: &mut T) -> ClientResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse().map_err(|err| {
            ClientError::Config(format!("{ENV_PREFIX}{name}: invalid value {raw:?}: {err}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid_once_a_token_is_set() {
        let config = ClientConfig::new("abc.def.ghi");
        config.validate().unwrap();
        assert_eq!(config.shard_count, 1);
        assert_eq!(config.identify_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_ack_grace, 2);
        assert_eq!(config.authorization(), "Bot abc.def.ghi");
    }

    #[test]
    fn loads_overrides_from_variables() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("TOKEN", "Bot tok"),
            ("SHARD_COUNT", "4"),
            ("COMPRESSION", "stream"),
            ("MAX_RECONNECT_ATTEMPTS", "7"),
            ("FATAL_RESTART", "restart"),
            ("IDENTIFY_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.bare_token(), "tok");
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.compression, Compression::Stream);
        assert_eq!(config.max_reconnect_attempts, Some(7));
        assert_eq!(config.fatal_restart, FatalRestartPolicy::Restart);
        assert_eq!(config.identify_interval(), Duration::from_millis(250));
    }

    #[test]
    fn missing_token_and_bad_numbers_fail_fast() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[])),
            Err(ClientError::Config(_))
        ));
        let err = ClientConfig::from_lookup(lookup(&[("TOKEN", "t"), ("SHARD_COUNT", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("SHARD_COUNT"));
    }

    #[test]
    fn validation_rejects_unworkable_settings() {
        let mut config = ClientConfig::new("has space");
        assert!(config.validate().is_err());

        config.token = "tok".into();
        config.shard_count = 0;
        assert!(config.validate().is_err());

        config.shard_count = 2;
        config.reconnect_backoff_base_ms = 10_000;
        config.reconnect_backoff_max_ms = 1_000;
        assert!(config.validate().is_err());

        config.reconnect_backoff_max_ms = 20_000;
        config.gateway_url = "http://not-a-socket".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ClientConfig =
            sonic_rs::from_str(r#"{"token":"t","shard_count":3,"compression":"payload"}"#)
                .unwrap();
        assert_eq!(config.shard_count, 3);
        assert_eq!(config.compression, Compression::Payload);
        assert_eq!(config.max_retry_attempts, 3);
    }
}
