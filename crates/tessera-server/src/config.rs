//! Server configuration loaded from environment variables.
//!
//! All settings have production-safe defaults. Override any variable at
//! container / process startup — no config file required.
//!
//! | Variable                          | Default                  | Description                                 |
//! |-----------------------------------|--------------------------|---------------------------------------------|
//! | `TESSERA_DATA_DIR`                | `~/.tessera`             | Data root (`~` expanded)                    |
//! | `TESSERA_BIND`                    | `http://127.0.0.1:10101` | Bind URI; `http` or `https`; port 0 = any   |
//! | `TESSERA_CLUSTER_REPLICAS`        | `1`                      | Replicas per shard (≥ 1)                    |
//! | `TESSERA_CLUSTER_COORDINATOR`     | `false`                  | This node is the initial coordinator        |
//! | `TESSERA_CLUSTER_DISABLED`        | `false`                  | Static membership, no gossip                |
//! | `TESSERA_CLUSTER_HOSTS`           | (empty)                  | Comma-separated URIs for static membership  |
//! | `TESSERA_CLUSTER_LONG_QUERY_TIME` | `0`                      | Slow-query log threshold in s (0 = off)     |
//! | `TESSERA_ANTI_ENTROPY_INTERVAL`   | `600`                    | Anti-entropy interval in s (0 = off)        |
//! | `TESSERA_METRIC_SERVICE`          | `nop`                    | `prometheus` \| `nop`                       |
//! | `TESSERA_METRIC_POLL_INTERVAL`    | `0`                      | Runtime metrics interval in s (0 = off)     |
//! | `TESSERA_METRIC_DIAGNOSTICS`      | `false`                  | Periodic diagnostics reports                |
//! | `TESSERA_TRANSLATION_PRIMARY_URL` | (empty)                  | Translate primary; empty = this node is it  |
//! | `TESSERA_TLS_CERT`                | (empty)                  | Certificate path (required for `https`)     |
//! | `TESSERA_TLS_KEY`                 | (empty)                  | Certificate key path (required for `https`) |
//! | `TESSERA_TLS_SKIP_VERIFY`         | `false`                  | Skip peer verification                      |
//! | `TESSERA_MAX_WRITES_PER_REQUEST`  | `5000`                   | Reject larger write batches                 |
//! | `TESSERA_LOG_PATH`                | (empty)                  | Log file; empty = stderr                    |
//! | `TESSERA_VERBOSE`                 | `false`                  | Debug-level logging                         |

use std::path::PathBuf;

use tessera_core::Uri;

use crate::error::ServerError;

/// Which statistics backend the server exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricService {
    Prometheus,
    Nop,
}

/// Runtime configuration for a Tessera node.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub bind: String,

    pub replica_n: usize,
    pub coordinator: bool,
    pub cluster_disabled: bool,
    pub cluster_hosts: Vec<String>,
    pub long_query_time_secs: u64,

    pub anti_entropy_interval_secs: u64,

    pub metric_service: MetricService,
    pub metric_poll_interval_secs: u64,
    pub metric_diagnostics: bool,

    pub translation_primary_url: String,

    pub tls_certificate_path: String,
    pub tls_certificate_key_path: String,
    pub tls_skip_verify: bool,

    pub max_writes_per_request: usize,

    pub log_path: String,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.tessera".to_string(),
            bind: "http://127.0.0.1:10101".to_string(),
            replica_n: 1,
            coordinator: false,
            cluster_disabled: false,
            cluster_hosts: Vec::new(),
            long_query_time_secs: 0,
            anti_entropy_interval_secs: 600,
            metric_service: MetricService::Nop,
            metric_poll_interval_secs: 0,
            metric_diagnostics: false,
            translation_primary_url: String::new(),
            tls_certificate_path: String::new(),
            tls_certificate_key_path: String::new(),
            tls_skip_verify: false,
            max_writes_per_request: 5000,
            log_path: String::new(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, applying defaults
    /// where a variable is absent or unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            data_dir: env_str("TESSERA_DATA_DIR", &defaults.data_dir),
            bind: env_str("TESSERA_BIND", &defaults.bind),
            replica_n: env_parse("TESSERA_CLUSTER_REPLICAS", defaults.replica_n),
            coordinator: env_bool("TESSERA_CLUSTER_COORDINATOR"),
            cluster_disabled: env_bool("TESSERA_CLUSTER_DISABLED"),
            cluster_hosts: env_csv("TESSERA_CLUSTER_HOSTS"),
            long_query_time_secs: env_parse("TESSERA_CLUSTER_LONG_QUERY_TIME", 0),
            anti_entropy_interval_secs: env_parse(
                "TESSERA_ANTI_ENTROPY_INTERVAL",
                defaults.anti_entropy_interval_secs,
            ),
            metric_service: match env_str("TESSERA_METRIC_SERVICE", "nop").as_str() {
                "prometheus" => MetricService::Prometheus,
                _ => MetricService::Nop,
            },
            metric_poll_interval_secs: env_parse("TESSERA_METRIC_POLL_INTERVAL", 0),
            metric_diagnostics: env_bool("TESSERA_METRIC_DIAGNOSTICS"),
            translation_primary_url: env_str("TESSERA_TRANSLATION_PRIMARY_URL", ""),
            tls_certificate_path: env_str("TESSERA_TLS_CERT", ""),
            tls_certificate_key_path: env_str("TESSERA_TLS_KEY", ""),
            tls_skip_verify: env_bool("TESSERA_TLS_SKIP_VERIFY"),
            max_writes_per_request: env_parse(
                "TESSERA_MAX_WRITES_PER_REQUEST",
                defaults.max_writes_per_request,
            ),
            log_path: env_str("TESSERA_LOG_PATH", ""),
            verbose: env_bool("TESSERA_VERBOSE"),
        }
    }

    /// Parse the bind URI and cross-check the TLS options.
    pub fn validate(&self) -> Result<Uri, ServerError> {
        let uri = Uri::parse(&self.bind)
            .map_err(|e| ServerError::Config(format!("bind address: {e}")))?;
        match uri.scheme.as_str() {
            "http" => {}
            "https" => {
                if self.tls_certificate_path.is_empty() {
                    return Err(ServerError::Config(
                        "TESSERA_TLS_CERT is required for an https bind".to_string(),
                    ));
                }
                if self.tls_certificate_key_path.is_empty() {
                    return Err(ServerError::Config(
                        "TESSERA_TLS_KEY is required for an https bind".to_string(),
                    ));
                }
            }
            other => {
                return Err(ServerError::Config(format!("unsupported scheme '{other}'")));
            }
        }
        if self.replica_n == 0 {
            return Err(ServerError::Config(
                "TESSERA_CLUSTER_REPLICAS must be at least 1".to_string(),
            ));
        }
        Ok(uri)
    }

    /// Data directory with a leading `~/` expanded against `$HOME`.
    pub fn expanded_data_dir(&self) -> Result<PathBuf, ServerError> {
        expand_home(&self.data_dir)
    }
}

fn expand_home(path: &str) -> Result<PathBuf, ServerError> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME")
                .map_err(|_| ServerError::Config("no home directory to expand '~'".to_string()))?;
            Ok(PathBuf::from(home).join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => match v.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                eprintln!("WARNING: env var {key}={v:?} is not valid; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
