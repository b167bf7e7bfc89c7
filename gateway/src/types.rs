use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

const MIN_MODEL_YEAR: u16 = 1886;
const MAX_MODEL_YEAR: u16 = 2100;
const VIN_LENGTH: usize = 17;

/// The regulatory data sets the gateway can fetch for a vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Recalls,
    Complaints,
    Investigations,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Recalls, Domain::Complaints, Domain::Investigations];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Domain::Recalls => "recalls",
            Domain::Complaints => "complaints",
            Domain::Investigations => "investigations",
        }
    }

    /// Cache lifetime used when the config does not set one for the domain.
    pub const fn default_ttl_secs(&self) -> u64 {
        match self {
            Domain::Recalls => 3_600,
            Domain::Complaints => 86_400,
            Domain::Investigations => 172_800,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recalls" => Ok(Domain::Recalls),
            "complaints" => Ok(Domain::Complaints),
            "investigations" => Ok(Domain::Investigations),
            other => Err(ValidationError::UnknownDomain(other.to_string())),
        }
    }
}

/// Caller supplied vehicle lookup. Either `vin` or all of `year`, `make` and
/// `model` must be present.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VehicleQuery {
    pub vin: Option<String>,
    pub year: Option<u16>,
    pub make: Option<String>,
    pub model: Option<String>,
}

impl VehicleQuery {
    pub fn by_vin(vin: impl Into<String>) -> Self {
        VehicleQuery {
            vin: Some(vin.into()),
            ..Default::default()
        }
    }

    pub fn by_model(year: u16, make: impl Into<String>, model: impl Into<String>) -> Self {
        VehicleQuery {
            vin: None,
            year: Some(year),
            make: Some(make.into()),
            model: Some(model.into()),
        }
    }

    /// Validates the query and reduces it to the identity used for lookups.
    /// A present VIN always wins over year/make/model.
    pub fn identity(&self) -> Result<VehicleIdentity, ValidationError> {
        if let Some(vin) = self.vin.as_deref().map(str::trim)
            && !vin.is_empty()
        {
            return normalize_vin(vin).map(VehicleIdentity::Vin);
        }

        let (Some(year), Some(make), Some(model)) = (self.year, &self.make, &self.model) else {
            return Err(ValidationError::MissingIdentity);
        };

        if !(MIN_MODEL_YEAR..=MAX_MODEL_YEAR).contains(&year) {
            return Err(ValidationError::InvalidYear(year));
        }

        let make = make.trim();
        let model = model.trim();
        if make.is_empty() {
            return Err(ValidationError::Blank("make"));
        }
        if model.is_empty() {
            return Err(ValidationError::Blank("model"));
        }

        Ok(VehicleIdentity::YearMakeModel {
            year,
            make: make.to_string(),
            model: model.to_string(),
        })
    }
}

fn normalize_vin(vin: &str) -> Result<String, ValidationError> {
    let vin = vin.to_ascii_uppercase();
    let valid = vin.len() == VIN_LENGTH
        && vin
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c, 'I' | 'O' | 'Q'));

    if valid {
        Ok(vin)
    } else {
        Err(ValidationError::InvalidVin(vin))
    }
}

/// The vehicle identity a lookup was performed with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VehicleIdentity {
    Vin(String),
    YearMakeModel {
        year: u16,
        make: String,
        model: String,
    },
}

impl fmt::Display for VehicleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleIdentity::Vin(vin) => f.write_str(vin),
            VehicleIdentity::YearMakeModel { year, make, model } => {
                write!(f, "{year}|{make}|{model}")
            }
        }
    }
}

/// Identifies "which vehicle, which domain" for both the cache and in-flight
/// coalescing. The domain is always the first segment so keys never collide
/// across domains.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(domain: Domain, identity: &VehicleIdentity) -> Self {
        let key = match identity {
            VehicleIdentity::Vin(vin) => format!("{domain}:vin:{vin}"),
            VehicleIdentity::YearMakeModel { year, make, model } => format!(
                "{domain}:ymm:{year}|{}|{}",
                escape_segment(make),
                escape_segment(model)
            ),
        };
        DedupKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Lowercased and percent-encoded, so a '|' inside a make or model cannot
// shift the segment boundaries.
fn escape_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.to_lowercase().as_bytes()).collect()
}

/// A single field value of a normalized record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Upstream,
    Cache,
}

/// Canonical envelope for recalls, complaints and investigations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub domain: Domain,
    pub dedup_key: DedupKey,
    pub vehicle_identity: VehicleIdentity,
    pub fields: BTreeMap<String, Scalar>,
    pub source: RecordSource,
    pub fetched_at: SystemTime,
}

/// What every caller of the gateway receives, including callers that joined an
/// in-flight fetch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GatewayResult {
    pub records: Vec<NormalizedRecord>,
    pub degraded: bool,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
}

impl GatewayResult {
    pub fn cached(records: Vec<NormalizedRecord>, elapsed_ms: u64) -> Self {
        GatewayResult {
            records,
            degraded: false,
            cache_hit: true,
            elapsed_ms,
        }
    }

    pub fn fresh(records: Vec<NormalizedRecord>, elapsed_ms: u64) -> Self {
        GatewayResult {
            records,
            degraded: false,
            cache_hit: false,
            elapsed_ms,
        }
    }

    pub fn degraded(elapsed_ms: u64) -> Self {
        GatewayResult {
            records: Vec::new(),
            degraded: true,
            cache_hit: false,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_parsing() {
        assert_eq!("recalls".parse::<Domain>().unwrap(), Domain::Recalls);
        assert_eq!(" Complaints ".parse::<Domain>().unwrap(), Domain::Complaints);
        assert_eq!(
            "INVESTIGATIONS".parse::<Domain>().unwrap(),
            Domain::Investigations
        );
        assert!(matches!(
            "warranty".parse::<Domain>(),
            Err(ValidationError::UnknownDomain(_))
        ));
    }

    #[test]
    fn test_vin_identity() {
        let query = VehicleQuery::by_vin(" 1ftew1cp7mkd73632 ");
        assert_eq!(
            query.identity().unwrap(),
            VehicleIdentity::Vin("1FTEW1CP7MKD73632".into())
        );

        // VIN wins over year/make/model
        let query = VehicleQuery {
            vin: Some("1FTEW1CP7MKD73632".into()),
            ..VehicleQuery::by_model(2021, "Ford", "F-150")
        };
        assert!(matches!(query.identity().unwrap(), VehicleIdentity::Vin(_)));
    }

    #[test]
    fn test_identity_validation_errors() {
        assert!(matches!(
            VehicleQuery::default().identity(),
            Err(ValidationError::MissingIdentity)
        ));

        // Blank VIN and partial year/make/model
        let query = VehicleQuery {
            vin: Some("   ".into()),
            year: Some(2023),
            make: Some("Toyota".into()),
            model: None,
        };
        assert!(matches!(
            query.identity(),
            Err(ValidationError::MissingIdentity)
        ));

        // Too short
        assert!(matches!(
            VehicleQuery::by_vin("1FTEW1CP7").identity(),
            Err(ValidationError::InvalidVin(_))
        ));

        // 'O' is never used in a VIN
        assert!(matches!(
            VehicleQuery::by_vin("1FTEW1CP7MKD7363O").identity(),
            Err(ValidationError::InvalidVin(_))
        ));

        assert!(matches!(
            VehicleQuery::by_model(1700, "Toyota", "Camry").identity(),
            Err(ValidationError::InvalidYear(1700))
        ));

        assert!(matches!(
            VehicleQuery::by_model(2023, " ", "Camry").identity(),
            Err(ValidationError::Blank("make"))
        ));
    }

    #[test]
    fn test_dedup_keys() {
        let vin = VehicleIdentity::Vin("1FTEW1CP7MKD73632".into());
        assert_eq!(
            DedupKey::new(Domain::Recalls, &vin).as_str(),
            "recalls:vin:1FTEW1CP7MKD73632"
        );

        // Domains never share a key
        assert_ne!(
            DedupKey::new(Domain::Recalls, &vin),
            DedupKey::new(Domain::Complaints, &vin)
        );

        let camry = VehicleQuery::by_model(2023, "Toyota", "Camry")
            .identity()
            .unwrap();
        let camry_upper = VehicleQuery::by_model(2023, "TOYOTA ", "camry")
            .identity()
            .unwrap();
        assert_eq!(
            DedupKey::new(Domain::Investigations, &camry).as_str(),
            "investigations:ymm:2023|toyota|camry"
        );
        assert_eq!(
            DedupKey::new(Domain::Investigations, &camry),
            DedupKey::new(Domain::Investigations, &camry_upper)
        );

        // A separator inside a segment must not collide with a different split
        let a = VehicleIdentity::YearMakeModel {
            year: 2020,
            make: "a|b".into(),
            model: "c".into(),
        };
        let b = VehicleIdentity::YearMakeModel {
            year: 2020,
            make: "a".into(),
            model: "b|c".into(),
        };
        assert_ne!(
            DedupKey::new(Domain::Recalls, &a),
            DedupKey::new(Domain::Recalls, &b)
        );
    }

    #[test]
    fn test_scalar_serialization() {
        let fields: BTreeMap<String, Scalar> = BTreeMap::from([
            ("crash".to_string(), Scalar::from(true)),
            ("injuries".to_string(), Scalar::from(2_i64)),
            ("summary".to_string(), Scalar::from("brakes")),
            ("remedy".to_string(), Scalar::from(None::<String>)),
        ]);

        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(
            json,
            r#"{"crash":true,"injuries":2,"remedy":null,"summary":"brakes"}"#
        );

        let parsed: BTreeMap<String, Scalar> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fields);
    }

    #[test]
    fn test_identity_serialization() {
        let vin = VehicleIdentity::Vin("1FTEW1CP7MKD73632".into());
        let json = serde_json::to_string(&vin).unwrap();
        assert_eq!(json, r#"{"type":"vin","value":"1FTEW1CP7MKD73632"}"#);
        assert_eq!(serde_json::from_str::<VehicleIdentity>(&json).unwrap(), vin);

        let camry = VehicleIdentity::YearMakeModel {
            year: 2023,
            make: "Toyota".into(),
            model: "Camry".into(),
        };
        let json = serde_json::to_string(&camry).unwrap();
        assert_eq!(
            json,
            r#"{"type":"year_make_model","value":{"year":2023,"make":"Toyota","model":"Camry"}}"#
        );
        assert_eq!(serde_json::from_str::<VehicleIdentity>(&json).unwrap(), camry);
    }

    #[test]
    fn test_gateway_result_serialization() {
        let vin = VehicleIdentity::Vin("1FTEW1CP7MKD73632".into());
        let key = DedupKey::new(Domain::Recalls, &vin);
        let record = NormalizedRecord {
            id: "21V708000".into(),
            domain: Domain::Recalls,
            dedup_key: key,
            vehicle_identity: vin,
            fields: BTreeMap::from([("component".to_string(), Scalar::from("BRAKES"))]),
            source: RecordSource::Upstream,
            fetched_at: SystemTime::UNIX_EPOCH,
        };

        let json: serde_json::Value =
            serde_json::to_value(GatewayResult::fresh(vec![record], 12)).unwrap();
        assert_eq!(json["degraded"], false);
        assert_eq!(json["cache_hit"], false);
        assert_eq!(json["elapsed_ms"], 12);
        assert_eq!(json["records"][0]["id"], "21V708000");
        assert_eq!(json["records"][0]["source"], "upstream");
        assert_eq!(json["records"][0]["dedup_key"], "recalls:vin:1FTEW1CP7MKD73632");
        assert_eq!(json["records"][0]["vehicle_identity"]["value"], "1FTEW1CP7MKD73632");
    }
}
