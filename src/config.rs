use std::time::Duration;

/// What to do when a remote placeholder cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFailurePolicy {
    /// Substitute empty text and keep going.
    Degrade,
    /// Fail the whole job.
    Abort,
}

impl ResolveFailurePolicy {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "abort" => ResolveFailurePolicy::Abort,
            _ => ResolveFailurePolicy::Degrade,
        }
    }
}

/// Upstream completion endpoint settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
    pub embedding_model: String,
    pub request_timeout: Duration,
}

/// Duplex connection tuning.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub max_connections: usize,
    pub outbound_capacity: usize,
    pub send_timeout: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
}

/// Notification retry bounds.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub retry_interval: Duration,
    pub deadline: Duration,
    pub attempt_timeout: Duration,
    pub auth_header_secret: String,
}

/// Placeholder content provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub tika_host: String,
    pub crawl_depth: usize,
    pub crawl_max_pages: usize,
    pub failure_policy: ResolveFailurePolicy,
}

/// Vector-store retrieval settings.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub base_url: String,
    pub distance: f32,
    pub limit: usize,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub auth_header_secret: String,
    pub upstream: UpstreamConfig,
    pub ws: WsConfig,
    pub notify: NotifyConfig,
    pub providers: ProviderConfig,
    pub retrieval: RetrievalConfig,
}

const ENV_KEYS: &[&str] = &[
    "PORT",
    "SENTRY_DSN",
    "ENVIRONMENT",
    "AUTH_HEADER_SECRET",
    "UPSTREAM_BASE_URL",
    "UPSTREAM_API_KEY",
    "DEFAULT_CHAT_MODEL",
    "EMBEDDING_MODEL",
    "TIKA_HOST",
    "VECTOR_STORE_URL",
    "RETRIEVAL_DISTANCE",
    "RETRIEVAL_LIMIT",
    "WS_MAX_CONNECTIONS",
    "WS_OUTBOUND_CAPACITY",
    "WS_SEND_TIMEOUT_SECS",
    "WS_PING_SECS",
    "WS_WRITE_WAIT_SECS",
    "RESOLVE_FAILURE_POLICY",
    "CRAWL_DEPTH",
    "CRAWL_MAX_PAGES",
    "NOTIFY_RETRY_SECS",
    "NOTIFY_DEADLINE_SECS",
    "NOTIFY_ATTEMPT_TIMEOUT_SECS",
];

struct RawEnv(Vec<(&'static str, Option<String>)>);

impl RawEnv {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default))
    }

    fn num(&self, key: &str, default: usize) -> usize {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a key lookup (as values would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = RawEnv(
            ENV_KEYS
                .iter()
                .map(|k| (*k, lookup(k).filter(|v| !v.trim().is_empty())))
                .collect(),
        );
        let text = |key: &str, default: &str| raw.get(key).unwrap_or(default).to_string();

        let auth_header_secret = text("AUTH_HEADER_SECRET", "");

        Config {
            port: raw.get("PORT").and_then(|v| v.parse().ok()).unwrap_or(5012),
            sentry_dsn: raw.get("SENTRY_DSN").map(String::from),
            environment: text("ENVIRONMENT", "local"),
            auth_header_secret: auth_header_secret.clone(),
            upstream: UpstreamConfig {
                base_url: text(
                    "UPSTREAM_BASE_URL",
                    "https://dashscope.aliyuncs.com/compatible-mode/v1",
                ),
                api_key: text("UPSTREAM_API_KEY", ""),
                default_model: text("DEFAULT_CHAT_MODEL", "deepseek-v3"),
                embedding_model: text("EMBEDDING_MODEL", "text-embedding-v3"),
                request_timeout: Duration::from_secs(3 * 60),
            },
            ws: WsConfig {
                max_connections: raw.num("WS_MAX_CONNECTIONS", 10_000),
                outbound_capacity: raw.num("WS_OUTBOUND_CAPACITY", 2).max(1),
                send_timeout: raw.secs("WS_SEND_TIMEOUT_SECS", 5),
                ping_period: raw.secs("WS_PING_SECS", 54),
                write_wait: raw.secs("WS_WRITE_WAIT_SECS", 10),
            },
            notify: NotifyConfig {
                retry_interval: raw.secs("NOTIFY_RETRY_SECS", 2),
                deadline: raw.secs("NOTIFY_DEADLINE_SECS", 60),
                attempt_timeout: raw.secs("NOTIFY_ATTEMPT_TIMEOUT_SECS", 15),
                auth_header_secret,
            },
            providers: ProviderConfig {
                tika_host: text("TIKA_HOST", "http://localhost:9998"),
                crawl_depth: raw.num("CRAWL_DEPTH", 1).max(1),
                crawl_max_pages: raw.num("CRAWL_MAX_PAGES", 20).max(1),
                failure_policy: ResolveFailurePolicy::parse(raw.get("RESOLVE_FAILURE_POLICY")),
            },
            retrieval: RetrievalConfig {
                base_url: text("VECTOR_STORE_URL", "http://localhost:8080"),
                distance: raw.get("RETRIEVAL_DISTANCE")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.5),
                limit: raw.num("RETRIEVAL_LIMIT", 3),
            },
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
