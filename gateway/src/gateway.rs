//! The public entry point. A lookup is validated, answered from the cache when
//! a fresh entry exists, and otherwise fetched from upstream through the
//! coalescing registry so identical concurrent lookups share one fetch.

use crate::cache_store::{CacheEntry, CacheStore, store_from_config};
use crate::clock::{Clock, SystemClock};
use crate::coalesce::CoalescingRegistry;
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::metrics_defs::{
    CACHE_HIT, CACHE_MISS, CACHE_READ_ERROR, CACHE_WRITE_ERROR, GATEWAY_DEGRADED, GATEWAY_DURATION,
};
use crate::normalizer::{Normalizer, RecordContext};
use crate::types::{
    DedupKey, Domain, GatewayResult, NormalizedRecord, RecordSource, VehicleIdentity, VehicleQuery,
};
use crate::upstream::{ReqwestTransport, Transport, UpstreamClient};
use shared::{counter, histogram};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct AggregationGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    store: Arc<dyn CacheStore>,
    upstream: UpstreamClient,
    clock: Arc<dyn Clock>,
    in_flight: CoalescingRegistry<GatewayResult>,
}

impl AggregationGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let upstream = UpstreamClient::from_config(&config, transport);
        AggregationGateway {
            inner: Arc::new(GatewayInner {
                config,
                store,
                upstream,
                clock,
                in_flight: CoalescingRegistry::new(),
            }),
        }
    }

    /// Gateway with the configured cache store, a reqwest transport and the
    /// system clock.
    pub fn from_config(config: GatewayConfig) -> Self {
        let store = store_from_config(&config.cache);
        Self::new(
            config,
            store,
            Arc::new(ReqwestTransport::new()),
            Arc::new(SystemClock),
        )
    }

    /// Number of upstream fetches currently shared through the registry.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.in_flight()
    }

    /// Returns the normalized records for a vehicle in one domain.
    ///
    /// Only invalid input and cancellation of the shared fetch are errors.
    /// An upstream that stays unavailable yields a degraded result with no
    /// records, and cache failures only cost a cache hit.
    pub async fn get_vehicle_data(
        &self,
        domain: Domain,
        query: &VehicleQuery,
    ) -> Result<GatewayResult, GatewayError> {
        let started = Instant::now();
        let identity = query.identity()?;
        let key = DedupKey::new(domain, &identity);

        if let Some(records) = self.inner.cached_records(domain, &key).await {
            let result = GatewayResult::cached(records, elapsed_ms(started));
            record_duration(domain, "hit", started);
            return Ok(result);
        }

        let inner = Arc::clone(&self.inner);
        let fetch_key = key.clone();
        let result = self
            .inner
            .in_flight
            .join_or_start(key.as_str(), move || async move {
                inner.fetch_fresh(domain, fetch_key, identity).await
            })
            .await?;

        let outcome = if result.degraded { "degraded" } else { "fresh" };
        record_duration(domain, outcome, started);
        Ok(result)
    }
}

impl GatewayInner {
    /// Records of a fresh entry, marked as served from the cache. Stale
    /// entries and read failures are misses.
    async fn cached_records(&self, domain: Domain, key: &DedupKey) -> Option<Vec<NormalizedRecord>> {
        let entry = match self.store.get(domain, key).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(%domain, dedup_key = %key, error = %err, "cache read failed, treating as miss");
                counter!(CACHE_READ_ERROR, "domain" => domain.as_str()).increment(1);
                None
            }
        };

        match entry {
            Some(entry) if entry.is_fresh(self.clock.now()) => {
                counter!(CACHE_HIT, "domain" => domain.as_str()).increment(1);
                tracing::debug!(%domain, dedup_key = %key, "cache hit");
                let mut records = entry.payload;
                for record in &mut records {
                    record.source = RecordSource::Cache;
                }
                Some(records)
            }
            entry => {
                if entry.is_some() {
                    tracing::debug!(%domain, dedup_key = %key, "cache entry expired");
                }
                counter!(CACHE_MISS, "domain" => domain.as_str()).increment(1);
                None
            }
        }
    }

    /// The shared fetch. Runs once per coalesced group and never fails: an
    /// exhausted upstream becomes a degraded result, which is not cached.
    async fn fetch_fresh(
        &self,
        domain: Domain,
        key: DedupKey,
        identity: VehicleIdentity,
    ) -> GatewayResult {
        let started = Instant::now();

        let payload = match self.upstream.fetch(domain, &identity).await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%domain, dedup_key = %key, error = %err, "returning degraded result");
                counter!(GATEWAY_DEGRADED, "domain" => domain.as_str()).increment(1);
                return GatewayResult::degraded(elapsed_ms(started));
            }
        };

        let fetched_at = self.clock.now();
        let records = payload.normalize(&RecordContext {
            dedup_key: &key,
            identity: &identity,
            fetched_at,
        });

        let entry = CacheEntry::new(domain, key, records, self.config.ttl(domain), fetched_at);
        if let Err(err) = self.store.put(&entry).await {
            tracing::warn!(%domain, dedup_key = %entry.dedup_key, error = %err, "cache write failed");
            counter!(CACHE_WRITE_ERROR, "domain" => domain.as_str()).increment(1);
        }

        GatewayResult::fresh(entry.payload, elapsed_ms(started))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn record_duration(domain: Domain, outcome: &'static str, started: Instant) {
    histogram!(GATEWAY_DURATION, "domain" => domain.as_str(), "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());
}
