use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use renderhub_core::types::WorkerId;
use renderhub_core::worker_registry::WorkerEndpoint;
use renderhub_dispatch::{CoordinatorConfig, RetryPolicy};
use renderhub_storage::key::DEFAULT_KEY_PREFIX;
use renderhub_storage::StorageConfig;

/// Port workers listen on when only `MAIN_SERVER_IP_URL` is given.
const FALLBACK_WORKER_PORT: u16 = 8001;

/// Id of the single worker derived from `MAIN_SERVER_IP_URL`.
const FALLBACK_WORKER_ID: &str = "ai-0";

const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("No workers configured: set WORKERS or MAIN_SERVER_IP_URL")]
    NoWorkers,
}

/// Server configuration loaded from environment variables.
///
/// Everything except the worker table has a default suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `120`).
    pub request_timeout_secs: u64,
    /// Largest accepted request body (default: 64 MiB).
    pub max_upload_bytes: usize,
    /// Where uploaded sources and reported results are written.
    pub upload_dir: PathBuf,
    /// Bearer secret required on API routes; `None` disables the check.
    pub shared_secret: Option<String>,
    /// The worker pool, in configuration order.
    pub workers: Vec<WorkerEndpoint>,
    pub coordinator: CoordinatorConfig,
    pub storage: StorageConfig,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                     | Default                      |
    /// |-----------------------------|------------------------------|
    /// | `HOST`                      | `0.0.0.0`                    |
    /// | `PORT`                      | `8000`                       |
    /// | `CORS_ORIGINS`              | `http://localhost:5173`      |
    /// | `REQUEST_TIMEOUT_SECS`      | `120`                        |
    /// | `MAX_UPLOAD_BYTES`          | `67108864`                   |
    /// | `UPLOAD_DIR`                | `uploads`                    |
    /// | `SHARED_SECRET`             | unset                        |
    /// | `WORKERS`                   | `id=url,id=url,...`          |
    /// | `MAIN_SERVER_IP_URL`        | used when `WORKERS` is unset |
    /// | `UNITS_PER_BATCH`           | `8`                          |
    /// | `UNIT_TIMEOUT_SECS`         | `600`                        |
    /// | `MAX_UNIT_ATTEMPTS`         | `3`                          |
    /// | `DISPATCH_MAX_RETRIES`      | `3`                          |
    /// | `DISPATCH_RETRY_INITIAL_MS` | `500`                        |
    /// | `DISPATCH_RETRY_MAX_MS`     | `8000`                       |
    /// | `SWEEP_INTERVAL_SECS`       | `5`                          |
    /// | `SESSION_RETENTION_SECS`    | `3600`                       |
    /// | `STORAGE_BACKEND`           | `local`                      |
    /// | `LOCAL_STORAGE_DIR`         | `storage`                    |
    /// | `S3_BUCKET`                 | required for `s3`            |
    /// | `S3_REGION`                 | SDK default                  |
    /// | `S3_ENDPOINT_URL`           | AWS                          |
    /// | `STORAGE_KEY_PREFIX`        | `results`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let host = env.string("HOST", "0.0.0.0");
        let port = env.parse("PORT", 8000u16)?;

        let cors_origins = split_list(&env.string("CORS_ORIGINS", "http://localhost:5173"));

        let request_timeout_secs = env.parse("REQUEST_TIMEOUT_SECS", 120u64)?;
        let max_upload_bytes = env.parse("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        let upload_dir = PathBuf::from(env.string("UPLOAD_DIR", "uploads"));
        let shared_secret = env.get("SHARED_SECRET");

        let workers = match (env.get("WORKERS"), env.get("MAIN_SERVER_IP_URL")) {
            (Some(raw), _) => parse_workers(&raw)?,
            (None, Some(ip)) => vec![fallback_worker(&ip)?],
            (None, None) => return Err(ConfigError::NoWorkers),
        };

        let retry = RetryPolicy {
            max_retries: env.parse("DISPATCH_MAX_RETRIES", 3u32)?,
            initial_delay: Duration::from_millis(env.parse("DISPATCH_RETRY_INITIAL_MS", 500u64)?),
            max_delay: Duration::from_millis(env.parse("DISPATCH_RETRY_MAX_MS", 8000u64)?),
            ..RetryPolicy::default()
        };

        let unit_count = env.parse("UNITS_PER_BATCH", 8u32)?;
        if unit_count == 0 {
            return Err(ConfigError::Invalid {
                var: "UNITS_PER_BATCH",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let coordinator = CoordinatorConfig {
            unit_count,
            unit_timeout: Duration::from_secs(env.parse("UNIT_TIMEOUT_SECS", 600u64)?),
            max_unit_attempts: env.parse("MAX_UNIT_ATTEMPTS", 3u32)?,
            retry,
            sweep_interval: Duration::from_secs(env.parse("SWEEP_INTERVAL_SECS", 5u64)?),
            session_retention: Duration::from_secs(env.parse("SESSION_RETENTION_SECS", 3600u64)?),
            key_prefix: env.string("STORAGE_KEY_PREFIX", DEFAULT_KEY_PREFIX),
        };

        let storage = match env.string("STORAGE_BACKEND", "local").as_str() {
            "local" => StorageConfig::Local {
                root: PathBuf::from(env.string("LOCAL_STORAGE_DIR", "storage")),
            },
            "s3" => StorageConfig::S3 {
                bucket: env
                    .get("S3_BUCKET")
                    .ok_or(ConfigError::Missing { var: "S3_BUCKET" })?,
                region: env.get("S3_REGION"),
                endpoint_url: env.get("S3_ENDPOINT_URL"),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected 'local' or 's3'".into(),
                })
            }
        };

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            max_upload_bytes,
            upload_dir,
            shared_secret,
            workers,
            coordinator,
            storage,
        })
    }
}

/// Parse `WORKERS`: comma-separated `id=url` pairs.
///
/// A worker's report origin is taken from its URL when the host is a
/// literal IP address.
pub fn parse_workers(raw: &str) -> Result<Vec<WorkerEndpoint>, ConfigError> {
    let invalid = |value: &str, reason: String| ConfigError::Invalid {
        var: "WORKERS",
        value: value.to_string(),
        reason,
    };

    let mut workers = Vec::new();
    for entry in split_list(raw) {
        let (id, url) = entry
            .split_once('=')
            .ok_or_else(|| invalid(&entry, "expected id=url".into()))?;
        let id = WorkerId::parse(id.trim()).map_err(|e| invalid(&entry, e.to_string()))?;
        let url = url.trim();
        let origin = origin_of(url).map_err(|reason| invalid(&entry, reason))?;

        workers.push(WorkerEndpoint {
            id,
            url: url.to_string(),
            origin,
        });
    }

    if workers.is_empty() {
        return Err(ConfigError::NoWorkers);
    }
    Ok(workers)
}

/// Single worker at `http://{ip}:8001/run_ai/`.
fn fallback_worker(ip: &str) -> Result<WorkerEndpoint, ConfigError> {
    let ip = ip.trim();
    let url = format!("http://{ip}:{FALLBACK_WORKER_PORT}/run_ai/");
    let origin = origin_of(&url).map_err(|reason| ConfigError::Invalid {
        var: "MAIN_SERVER_IP_URL",
        value: ip.to_string(),
        reason,
    })?;
    let id = WorkerId::parse(FALLBACK_WORKER_ID).map_err(|e| ConfigError::Invalid {
        var: "MAIN_SERVER_IP_URL",
        value: ip.to_string(),
        reason: e.to_string(),
    })?;

    Ok(WorkerEndpoint { id, url, origin })
}

fn origin_of(url: &str) -> Result<Option<IpAddr>, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", parsed.scheme()));
    }
    let host = parsed.host_str().ok_or("missing host")?;
    Ok(host.trim_matches(['[', ']']).parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// A set, non-blank variable.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }
}
