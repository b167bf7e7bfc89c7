//! Maps each domain's upstream schema onto [`NormalizedRecord`].
//!
//! Upstream bodies are parsed into a tagged union of per-domain payload types.
//! Every payload type implements [`Normalizer`]; [`RawPayload`] dispatches on
//! the domain tag. Normalizing is pure: no I/O, and `fetched_at` is supplied
//! by the caller.

mod complaints;
mod investigations;
mod recalls;

pub use complaints::{ComplaintItem, ComplaintsPayload};
pub use investigations::{InvestigationItem, InvestigationsPayload};
pub use recalls::{RecallItem, RecallsPayload};

use crate::types::{DedupKey, Domain, NormalizedRecord, RecordSource, Scalar, VehicleIdentity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// What every record produced by one fetch carries.
#[derive(Clone, Copy, Debug)]
pub struct RecordContext<'a> {
    pub dedup_key: &'a DedupKey,
    pub identity: &'a VehicleIdentity,
    pub fetched_at: SystemTime,
}

pub trait Normalizer {
    fn normalize(&self, ctx: &RecordContext<'_>) -> Vec<NormalizedRecord>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawPayload {
    Recalls(RecallsPayload),
    Complaints(ComplaintsPayload),
    Investigations(InvestigationsPayload),
}

impl RawPayload {
    /// Parses an upstream body with the schema of `domain`. Bodies that are not
    /// JSON or lack the `results` array are rejected.
    pub fn parse(domain: Domain, body: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match domain {
            Domain::Recalls => RawPayload::Recalls(serde_json::from_slice(body)?),
            Domain::Complaints => RawPayload::Complaints(serde_json::from_slice(body)?),
            Domain::Investigations => RawPayload::Investigations(serde_json::from_slice(body)?),
        })
    }

    pub fn domain(&self) -> Domain {
        match self {
            RawPayload::Recalls(_) => Domain::Recalls,
            RawPayload::Complaints(_) => Domain::Complaints,
            RawPayload::Investigations(_) => Domain::Investigations,
        }
    }
}

impl Normalizer for RawPayload {
    fn normalize(&self, ctx: &RecordContext<'_>) -> Vec<NormalizedRecord> {
        match self {
            RawPayload::Recalls(payload) => payload.normalize(ctx),
            RawPayload::Complaints(payload) => payload.normalize(ctx),
            RawPayload::Investigations(payload) => payload.normalize(ctx),
        }
    }
}

/// Builds the envelope shared by all domains. Items without a usable natural
/// id are keyed by their position under the dedup key.
fn build_record(
    domain: Domain,
    ctx: &RecordContext<'_>,
    natural_id: Option<String>,
    index: usize,
    fields: BTreeMap<String, Scalar>,
) -> NormalizedRecord {
    let id = natural_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("{}#{index}", ctx.dedup_key));

    NormalizedRecord {
        id,
        domain,
        dedup_key: ctx.dedup_key.clone(),
        vehicle_identity: ctx.identity.clone(),
        fields,
        source: RecordSource::Upstream,
        fetched_at: ctx.fetched_at,
    }
}

fn field(name: &str, value: impl Into<Scalar>) -> (String, Scalar) {
    (name.to_string(), value.into())
}

/// A field of the wrong type becomes `None` instead of failing the payload.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Integer field that may also arrive as a numeric string.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// `results` must be an array. Entries that are not objects are skipped.
fn lenient_items<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = Vec::<Value>::deserialize(deserializer)?;
    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| T::deserialize(item).ok())
        .collect())
}
