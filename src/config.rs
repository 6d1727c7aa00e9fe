//! Environment-driven service configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeEnv {
    #[default]
    Dev,
    Prod,
    Test,
}

/// Artifact storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactsBackend {
    #[default]
    Fs,
    S3,
}

/// Connection parameters for the S3-compatible object store.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub prefix: String,
    pub use_ssl: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub request_timeout: Duration,
    pub env: RuntimeEnv,
    pub github_token: Option<String>,
    pub database_url: Option<String>,
    pub artifacts_backend: ArtifactsBackend,
    pub artifacts_dir: PathBuf,
    pub artifacts_ttl_hours: u32,
    pub s3: S3Config,
    /// Reserved for external broker adapters; the bundled broker is
    /// in-process and ignores these.
    pub redis_addr: Option<String>,
    pub redis_password: Option<String>,
    pub worker_concurrency: usize,
    /// Queue drain weights, `name=weight` pairs.
    pub worker_queues: Vec<(String, u32)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            request_timeout: Duration::from_secs(15),
            env: RuntimeEnv::Dev,
            github_token: None,
            database_url: None,
            artifacts_backend: ArtifactsBackend::Fs,
            artifacts_dir: PathBuf::from("./data/artifacts"),
            artifacts_ttl_hours: 72,
            s3: S3Config::default(),
            redis_addr: None,
            redis_password: None,
            worker_concurrency: 4,
            worker_queues: vec![
                ("high".to_string(), 6),
                ("default".to_string(), 3),
                ("low".to_string(), 1),
            ],
        }
    }
}

impl Config {
    /// Load from the process environment, validating as it goes.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = env_var("PORT") {
            cfg.port = v
                .parse::<u16>()
                .ok()
                .filter(|p| *p >= 1)
                .ok_or(ConfigError::InvalidValue {
                    key: "PORT",
                    value: v,
                    hint: "must be 1..65535, digits only",
                })?;
        }
        if let Some(v) = env_var("REQUEST_TIMEOUT") {
            cfg.request_timeout = parse_duration(&v).ok_or(ConfigError::InvalidValue {
                key: "REQUEST_TIMEOUT",
                value: v,
                hint: "use a duration like 15s, 2m or 500ms",
            })?;
        }
        if let Some(v) = env_var("ENV") {
            cfg.env = match v.to_ascii_lowercase().as_str() {
                "dev" => RuntimeEnv::Dev,
                "prod" | "production" => RuntimeEnv::Prod,
                "test" => RuntimeEnv::Test,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ENV",
                        value: v,
                        hint: "dev|prod|test",
                    })
                }
            };
        }
        cfg.github_token = env_var("GITHUB_TOKEN");
        cfg.database_url = env_var("DATABASE_URL");

        if let Some(v) = env_var("ARTIFACTS_BACKEND") {
            cfg.artifacts_backend = match v.to_ascii_lowercase().as_str() {
                "fs" => ArtifactsBackend::Fs,
                "s3" => ArtifactsBackend::S3,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ARTIFACTS_BACKEND",
                        value: v,
                        hint: "fs|s3",
                    })
                }
            };
        }
        if let Some(v) = env_var("ARTIFACTS_DIR") {
            cfg.artifacts_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("ARTIFACTS_TTL_HOURS") {
            cfg.artifacts_ttl_hours = v.parse().ok().filter(|h| *h > 0).ok_or(
                ConfigError::InvalidValue {
                    key: "ARTIFACTS_TTL_HOURS",
                    value: v,
                    hint: "positive integer hours",
                },
            )?;
        }

        cfg.s3 = S3Config {
            endpoint: env_var("S3_ENDPOINT").unwrap_or_default(),
            region: env_var("S3_REGION").unwrap_or_default(),
            bucket: env_var("S3_BUCKET").unwrap_or_default(),
            access_key: env_var("S3_ACCESS_KEY").unwrap_or_default(),
            secret_key: env_var("S3_SECRET_KEY").unwrap_or_default(),
            prefix: env_var("S3_PREFIX").unwrap_or_default(),
            use_ssl: env_var("S3_USE_SSL")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
        };

        cfg.redis_addr = env_var("REDIS_ADDR");
        cfg.redis_password = env_var("REDIS_PASSWORD");

        if let Some(v) = env_var("WORKER_CONCURRENCY") {
            cfg.worker_concurrency = v.parse().ok().filter(|c| *c > 0).ok_or(
                ConfigError::InvalidValue {
                    key: "WORKER_CONCURRENCY",
                    value: v,
                    hint: "positive integer",
                },
            )?;
        }
        if let Some(v) = env_var("WORKER_QUEUES") {
            cfg.worker_queues = parse_queue_weights(&v).ok_or(ConfigError::InvalidValue {
                key: "WORKER_QUEUES",
                value: v,
                hint: "comma-separated name=weight pairs",
            })?;
        }

        Ok(cfg)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse `90`, `500ms`, `15s`, `2m` or `1h` into a duration.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (value, unit) = s.split_at(s.find(|c: char| c.is_ascii_alphabetic())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Parse `high=6,default=3,low=1`.
pub fn parse_queue_weights(s: &str) -> Option<Vec<(String, u32)>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, weight) = part.split_once('=')?;
        let weight: u32 = weight.trim().parse().ok()?;
        out.push((name.trim().to_string(), weight));
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "PORT",
        "REQUEST_TIMEOUT",
        "ENV",
        "GITHUB_TOKEN",
        "DATABASE_URL",
        "ARTIFACTS_BACKEND",
        "ARTIFACTS_DIR",
        "ARTIFACTS_TTL_HOURS",
        "WORKER_CONCURRENCY",
        "WORKER_QUEUES",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_when_env_is_empty() {
        clear_env();
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.env, RuntimeEnv::Dev);
        assert_eq!(cfg.artifacts_backend, ArtifactsBackend::Fs);
        assert_eq!(cfg.artifacts_ttl_hours, 72);
        assert_eq!(cfg.worker_concurrency, 4);
        assert_eq!(cfg.worker_queues.len(), 3);
    }

    #[test]
    #[serial]
    fn invalid_port_is_rejected() {
        clear_env();
        std::env::set_var("PORT", "0");
        assert!(Config::load().is_err());
        std::env::set_var("PORT", "notanumber");
        assert!(Config::load().is_err());
        std::env::set_var("PORT", "9099");
        assert_eq!(Config::load().unwrap().port, 9099);
        clear_env();
    }

    #[test]
    #[serial]
    fn env_and_queues_parse() {
        clear_env();
        std::env::set_var("ENV", "prod");
        std::env::set_var("WORKER_QUEUES", "high=8, default=2,low=1");
        std::env::set_var("REQUEST_TIMEOUT", "2m");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.env, RuntimeEnv::Prod);
        assert_eq!(
            cfg.worker_queues,
            vec![
                ("high".to_string(), 8),
                ("default".to_string(), 2),
                ("low".to_string(), 1)
            ]
        );
        assert_eq!(cfg.request_timeout, Duration::from_secs(120));
        clear_env();
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("2x"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn queue_weight_formats() {
        assert_eq!(
            parse_queue_weights("high=6,default=3,low=1"),
            Some(vec![
                ("high".to_string(), 6),
                ("default".to_string(), 3),
                ("low".to_string(), 1)
            ])
        );
        assert_eq!(parse_queue_weights("bad"), None);
        assert_eq!(parse_queue_weights(""), None);
    }
}
