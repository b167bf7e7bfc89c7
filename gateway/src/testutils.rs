use crate::cache_store::{CacheEntry, CacheStore, InMemoryCacheStore};
use crate::config::GatewayConfig;
use crate::errors::{CacheError, UpstreamError};
use crate::types::{
    DedupKey, Domain, NormalizedRecord, RecordSource, Scalar, VehicleIdentity, VehicleQuery,
};
use crate::upstream::{Transport, TransportResponse};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use url::Url;

pub const RECALLS_BODY: &str = r#"{
    "Count": 2,
    "Message": "Results returned successfully",
    "results": [
        {
            "Manufacturer": "Ford Motor Company",
            "NHTSACampaignNumber": "21V708000",
            "parkIt": false,
            "parkOutSide": false,
            "overTheAirUpdate": false,
            "ReportReceivedDate": "15/09/2021",
            "Component": "ELECTRICAL SYSTEM",
            "Summary": "The rear view camera image may not display.",
            "Consequence": "A rear view camera that does not display increases the risk of a crash.",
            "Remedy": "Dealers will update the software, free of charge."
        },
        {
            "Manufacturer": "Ford Motor Company",
            "NHTSACampaignNumber": "22V123000",
            "parkIt": true,
            "ReportReceivedDate": "02/03/2022",
            "Component": "FUEL SYSTEM, GASOLINE",
            "Summary": "A fuel injector may crack."
        }
    ]
}"#;

pub const INVESTIGATIONS_BODY: &str = r#"{
    "results": [
        {
            "investigationNumber": "PE23004",
            "investigationType": "Preliminary Evaluation",
            "subject": "Unexpected automatic emergency braking",
            "description": "Reports of braking with no obstruction in the path.",
            "openDate": "2023-05-10",
            "status": "Open",
            "components": "FORWARD COLLISION AVOIDANCE"
        }
    ]
}"#;

pub const TEST_VIN: &str = "1FTEW1CP7MKD73632";

pub fn vin_identity() -> VehicleIdentity {
    VehicleIdentity::Vin(TEST_VIN.into())
}

pub fn ymm_identity() -> VehicleIdentity {
    VehicleIdentity::YearMakeModel {
        year: 2023,
        make: "Toyota".into(),
        model: "Camry".into(),
    }
}

pub fn camry_query() -> VehicleQuery {
    VehicleQuery::by_model(2023, "Toyota", "Camry")
}

pub fn recall_record(key: &DedupKey, id: &str, fetched_at: SystemTime) -> NormalizedRecord {
    NormalizedRecord {
        id: id.to_string(),
        domain: Domain::Recalls,
        dedup_key: key.clone(),
        vehicle_identity: vin_identity(),
        fields: BTreeMap::from([("component".to_string(), Scalar::from("BRAKES"))]),
        source: RecordSource::Upstream,
        fetched_at,
    }
}

pub fn test_config() -> GatewayConfig {
    let yaml = r#"
domains:
    recalls: {base_url: "http://upstream.test/recalls"}
    complaints: {base_url: "http://upstream.test/complaints"}
    investigations: {base_url: "http://upstream.test/investigations"}
"#;
    serde_yaml::from_str(yaml).unwrap()
}

#[derive(Clone, Debug)]
pub enum FakeResponse {
    /// 200 with the given body
    Ok(&'static str),
    Status(u16),
    /// Never answers
    Hang,
    /// Connection level failure
    Error,
}

/// Transport answering from a script, then from a fallback response. Records
/// every call.
pub struct FakeTransport {
    script: Mutex<VecDeque<FakeResponse>>,
    fallback: FakeResponse,
    delay: Duration,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    urls: Mutex<Vec<Url>>,
}

impl FakeTransport {
    pub fn always(response: FakeResponse) -> Self {
        Self::scripted(Vec::new(), response)
    }

    pub fn scripted(script: Vec<FakeResponse>, fallback: FakeResponse) -> Self {
        FakeTransport {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
        }
    }

    /// Every response is delayed, which keeps fetches in flight long enough
    /// for concurrent callers to pile up.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: Url) -> Result<TransportResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(Instant::now());
        self.urls.lock().push(url);
        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match response {
            FakeResponse::Ok(body) => Ok(TransportResponse {
                status: 200,
                body: Bytes::from_static(body.as_bytes()),
            }),
            FakeResponse::Status(status) => Ok(TransportResponse {
                status,
                body: Bytes::new(),
            }),
            FakeResponse::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(UpstreamError::Transport("hung".into()))
            }
            FakeResponse::Error => Err(UpstreamError::Transport("connection refused".into())),
        }
    }
}

/// In-memory store whose reads or writes can be made to fail.
pub struct FailingCacheStore {
    inner: InMemoryCacheStore,
    fail_reads: bool,
    fail_writes: bool,
}

impl FailingCacheStore {
    pub fn new(fail_reads: bool, fail_writes: bool) -> Self {
        FailingCacheStore {
            inner: InMemoryCacheStore::new(100),
            fail_reads,
            fail_writes,
        }
    }
}

#[async_trait]
impl CacheStore for FailingCacheStore {
    async fn get(&self, domain: Domain, key: &DedupKey) -> Result<Option<CacheEntry>, CacheError> {
        if self.fail_reads {
            return Err(CacheError::Read(io::Error::other("disk on fire")));
        }
        self.inner.get(domain, key).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        if self.fail_writes {
            return Err(CacheError::Write(io::Error::other("disk full")));
        }
        self.inner.put(entry).await
    }
}
