use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Characters escaped in proxy credentials; RFC 3986 unreserved ones pass through.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Transaction type a listing is offered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Rent,
    Sale,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Rent => "rent",
            TransactionType::Sale => "sale",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rent" | "rental" | "lease" => Ok(TransactionType::Rent),
            "sale" | "buy" | "purchase" => Ok(TransactionType::Sale),
            _ => Err(format!("Unknown transaction type: {}", s)),
        }
    }
}

/// How much of the origin a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeScope {
    /// Every listing of the transaction type.
    All,
    /// Only recently added or changed listings.
    Recent,
}

/// An unparsed per-listing document handed to the extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    /// Where the document came from, if known.
    pub source_url: Option<String>,
    pub body: String,
}

impl RawDocument {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            source_url: None,
            body: body.into(),
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

/// A listing as produced by the extractor.
///
/// `data` is opaque to the pipeline; only `external_id` matters for
/// new-vs-updated accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Stable key assigned by the origin (MLS-number analogue).
    pub external_id: String,
    pub transaction: TransactionType,
    pub url: Option<String>,
    pub price: Option<f64>,
    pub images: Vec<String>,
    pub data: serde_json::Value,
}

impl ListingRecord {
    /// SHA-256 of the extracted payload, used to spot content changes.
    pub fn data_hash(&self) -> String {
        compute_hash(&self.data.to_string())
    }
}

/// Result of an idempotent listing upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub was_new: bool,
}

/// A persisted listing selected for re-fetching.
#[derive(Debug, Clone)]
pub struct StaleListing {
    pub id: Uuid,
    pub external_id: String,
    pub transaction: TransactionType,
    pub url: Option<String>,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingCounts {
    pub total: u64,
    pub active: u64,
}

// ---------------------------------------------------------------------------
// Proxies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks5" | "socks" => Ok(ProxyProtocol::Socks5),
            _ => Err(format!("Unknown proxy protocol: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

/// A proxy with its reliability score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: Uuid,
    pub address: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub credentials: Option<ProxyCredentials>,
    pub country: Option<String>,
    pub active: bool,
    /// Exponentially weighted score in `[0, 100]`.
    pub success_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_tested: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
}

impl ProxyRecord {
    /// Proxy URL in the form `scheme://[user:pass@]host:port`.
    pub fn url(&self) -> String {
        match &self.credentials {
            Some(c) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol,
                utf8_percent_encode(&c.username, USERINFO),
                utf8_percent_encode(&c.password, USERINFO),
                self.address,
                self.port
            ),
            None => format!("{}://{}:{}", self.protocol, self.address, self.port),
        }
    }

    /// Display label that never includes credentials.
    pub fn label(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }
}

/// Request to register a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProxy {
    pub address: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub credentials: Option<ProxyCredentials>,
    pub country: Option<String>,
}

impl NewProxy {
    pub fn new(address: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            address: address.into(),
            port,
            protocol,
            credentials: None,
            country: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(ProxyCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }
}

/// Where a proxy outcome was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    /// A real fetch through the proxy.
    Live,
    /// A dedicated health check.
    HealthCheck,
}

/// One observation of a proxy's behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProxyOutcome {
    pub source: OutcomeSource,
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub at: DateTime<Utc>,
}

impl ProxyOutcome {
    pub fn live(success: bool, response_time_ms: Option<u64>) -> Self {
        Self {
            source: OutcomeSource::Live,
            success,
            response_time_ms,
            at: Utc::now(),
        }
    }

    pub fn health_check(success: bool, response_time_ms: Option<u64>) -> Self {
        Self {
            source: OutcomeSource::HealthCheck,
            success,
            response_time_ms,
            at: Utc::now(),
        }
    }
}

/// Score and activation state after an outcome was applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProxyScore {
    pub success_rate: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyStats {
    pub total: u64,
    pub active: u64,
    pub avg_success_rate: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// Request log
// ---------------------------------------------------------------------------

/// One outbound request attempt, as persisted for quota accounting.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub url: String,
    pub proxy_id: Option<Uuid>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub at: DateTime<Utc>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
