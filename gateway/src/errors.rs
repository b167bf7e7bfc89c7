use std::time::Duration;
use thiserror::Error;

/// Bad caller input. Raised before the cache or the registry is touched.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("either a VIN or year, make and model are required")]
    MissingIdentity,

    #[error("invalid VIN: {0}")]
    InvalidVin(String),

    #[error("model year out of range: {0}")]
    InvalidYear(u16),

    #[error("{0} must not be blank")]
    Blank(&'static str),

    #[error("unknown domain: {0}")]
    UnknownDomain(String),
}

/// Failure talking to an upstream data source. Every variant except
/// `RetriesExhausted` describes a single attempt.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream unavailable after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<UpstreamError>,
    },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("cache write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("cache entry could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cache entry could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoalesceError {
    #[error("the shared fetch was cancelled before it settled")]
    Cancelled,
}

/// The only failures the gateway surfaces to its callers. Upstream and cache
/// failures are absorbed into a degraded or uncached result instead.
#[derive(Error, Debug, PartialEq)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("fetch cancelled: {0}")]
    Cancelled(#[from] CoalesceError),
}
