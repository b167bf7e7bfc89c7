use crate::types::Domain;
use crate::upstream::RetryPolicy;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT_MS: u64 = 2_500;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MEMORY_CAPACITY: u64 = 10_000;
/// Ten years
const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("missing environment variable {0}")]
    MissingVar(String),
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidVar { name: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(#[from] ConfigValidationError),
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("upstream timeout cannot be 0")]
    ZeroTimeout,

    #[error("cache TTL for {0} cannot be 0")]
    ZeroTtl(Domain),

    #[error("cache TTL for {domain} is {secs}s, the maximum is {max}s")]
    TtlTooLarge { domain: Domain, secs: u64, max: u64 },

    #[error("base URL for {domain} must be http or https, got {scheme}")]
    UnsupportedScheme { domain: Domain, scheme: String },

    #[error("memory cache capacity cannot be 0")]
    ZeroCapacity,
}

/// Gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Retry and timeout settings shared by every domain's upstream
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Where cache entries are kept
    #[serde(default)]
    pub cache: CacheStoreConfig,
    pub domains: DomainsConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamSettings {
    /// Bound on a single attempt, including reading the body
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, doubled for every following one
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl UpstreamSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_memory_capacity() -> u64 {
    DEFAULT_MEMORY_CAPACITY
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CacheStoreConfig {
    Memory {
        #[serde(default = "default_memory_capacity")]
        max_capacity: u64,
    },
    Filesystem {
        base_dir: PathBuf,
    },
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        CacheStoreConfig::Memory {
            max_capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DomainConfig {
    /// Address of the domain's upstream API
    pub base_url: Url,
    /// Falls back to the domain default when unset
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DomainsConfig {
    pub recalls: DomainConfig,
    pub complaints: DomainConfig,
    pub investigations: DomainConfig,
}

impl DomainsConfig {
    pub fn get(&self, domain: Domain) -> &DomainConfig {
        match domain {
            Domain::Recalls => &self.recalls,
            Domain::Complaints => &self.complaints,
            Domain::Investigations => &self.investigations,
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: GatewayConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the config from `UPSTREAM_*`, `CACHE_TTL_SECONDS_<DOMAIN>`,
    /// `UPSTREAM_BASE_URL_<DOMAIN>` and `CACHE_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream = UpstreamSettings {
            timeout_ms: parse_var(&lookup, "UPSTREAM_TIMEOUT_MS")?.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: parse_var(&lookup, "UPSTREAM_MAX_RETRIES")?
                .unwrap_or(DEFAULT_MAX_RETRIES),
            backoff_base_ms: parse_var(&lookup, "UPSTREAM_BACKOFF_BASE_MS")?
                .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
        };

        let cache = match lookup("CACHE_DIR") {
            Some(dir) => CacheStoreConfig::Filesystem {
                base_dir: PathBuf::from(dir),
            },
            None => CacheStoreConfig::default(),
        };

        let domain_config = |domain: Domain| -> Result<DomainConfig, ConfigError> {
            let suffix = domain.as_str().to_ascii_uppercase();
            let url_var = format!("UPSTREAM_BASE_URL_{suffix}");
            let base_url = parse_var::<Url, _>(&lookup, &url_var)?
                .ok_or(ConfigError::MissingVar(url_var))?;
            Ok(DomainConfig {
                base_url,
                cache_ttl_secs: parse_var(&lookup, &format!("CACHE_TTL_SECONDS_{suffix}"))?,
            })
        };

        let config = GatewayConfig {
            upstream,
            cache,
            domains: DomainsConfig {
                recalls: domain_config(Domain::Recalls)?,
                complaints: domain_config(Domain::Complaints)?,
                investigations: domain_config(Domain::Investigations)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.upstream.timeout_ms == 0 {
            return Err(ConfigValidationError::ZeroTimeout);
        }

        if let CacheStoreConfig::Memory { max_capacity: 0 } = self.cache {
            return Err(ConfigValidationError::ZeroCapacity);
        }

        for domain in Domain::ALL {
            let domain_config = self.domains.get(domain);

            if domain_config.cache_ttl_secs == Some(0) {
                return Err(ConfigValidationError::ZeroTtl(domain));
            }

            if let Some(secs) = domain_config.cache_ttl_secs
                && secs > MAX_TTL_SECS
            {
                return Err(ConfigValidationError::TtlTooLarge {
                    domain,
                    secs,
                    max: MAX_TTL_SECS,
                });
            }

            let scheme = domain_config.base_url.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(ConfigValidationError::UnsupportedScheme {
                    domain,
                    scheme: scheme.to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn ttl(&self, domain: Domain) -> Duration {
        let secs = self
            .domains
            .get(domain)
            .cache_ttl_secs
            .unwrap_or_else(|| domain.default_ttl_secs());
        Duration::from_secs(secs)
    }

    pub fn base_url(&self, domain: Domain) -> &Url {
        &self.domains.get(domain).base_url
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar {
                name: name.to_string(),
                value,
            }),
    }
}
