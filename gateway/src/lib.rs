//! Aggregates vehicle safety data (recalls, complaints, investigations) from
//! upstream sources behind a cache, with concurrent identical lookups
//! coalesced into a single upstream fetch.

pub mod cache_store;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod errors;
mod gateway;
pub mod metrics_defs;
pub mod normalizer;
pub mod types;
pub mod upstream;

#[cfg(test)]
mod testutils;

pub use crate::gateway::AggregationGateway;
pub use config::GatewayConfig;
pub use errors::{GatewayError, ValidationError};
pub use types::{Domain, GatewayResult, NormalizedRecord, VehicleQuery};
