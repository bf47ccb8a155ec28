//! Calgary Open Data (Socrata) client and the per-record normalizer.
//!
//! The client paginates the business-license resource with offset/limit
//! queries and fetches dataset catalog metadata best-effort. The normalizer
//! turns one raw row into a [`NormalizedRecord`], dropping rows whose
//! coordinates fall outside the Calgary envelope.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use yycmap_core::{within_envelope, DatasetMetadata, NormalizedRecord, Status};

pub const CRATE_NAME: &str = "yycmap-source";

pub const DEFAULT_BASE_URL: &str = "https://data.calgary.ca";
/// Business Licenses dataset on the Calgary open-data portal.
pub const DATASET_ID: &str = "vdjc-pybd";
pub const PAGE_SIZE: usize = 5000;
pub const MAX_RECORDS: usize = 50_000;

/// One raw row as the Socrata resource endpoint returns it. Nothing here is
/// guaranteed: every field may be missing or malformed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLicense {
    pub getbusid: Option<String>,
    pub tradename: Option<String>,
    pub licencetypes: Option<String>,
    pub jobstatusdesc: Option<String>,
    pub first_iss_dt: Option<String>,
    pub exp_dt: Option<String>,
    pub address: Option<String>,
    pub comdistnm: Option<String>,
    pub comdistcd: Option<String>,
    pub point: Option<RawPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPoint {
    pub coordinates: Option<Vec<f64>>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    /// A failed first page means no dataset at all; the cycle must fail
    /// rather than publish an empty artifact.
    #[error("first page request failed: {0}")]
    FirstPage(#[source] reqwest::Error),
}

/// Result of one full paginated fetch. `truncated` is set when a later page
/// failed and the accumulated prefix was kept.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawLicense>,
    pub metadata: Option<DatasetMetadata>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct SocrataConfig {
    pub base_url: String,
    pub dataset: String,
    pub user_agent: String,
    pub page_size: usize,
    pub max_records: usize,
    /// Timeout for one record-page request.
    pub page_timeout: Duration,
    /// Timeout for the catalog metadata request.
    pub metadata_timeout: Duration,
    /// Courtesy pause between page requests.
    pub page_delay: Duration,
}

impl Default for SocrataConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset: DATASET_ID.to_string(),
            user_agent: "yycmap-bot/0.1".to_string(),
            page_size: PAGE_SIZE,
            max_records: MAX_RECORDS,
            page_timeout: Duration::from_secs(60),
            metadata_timeout: Duration::from_secs(30),
            page_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct SocrataClient {
    client: reqwest::Client,
    config: SocrataConfig,
}

/// Deserialized slice of the catalog `views` response.
#[derive(Debug, Deserialize)]
struct ViewsResponse {
    #[serde(rename = "rowsUpdatedAt")]
    rows_updated_at: Option<i64>,
    name: Option<String>,
    description: Option<String>,
}

impl SocrataClient {
    pub fn new(config: SocrataConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(SourceError::Client)?;
        Ok(Self { client, config })
    }

    fn resource_url(&self) -> String {
        format!("{}/resource/{}.json", self.config.base_url, self.config.dataset)
    }

    fn views_url(&self) -> String {
        format!("{}/api/views/{}.json", self.config.base_url, self.config.dataset)
    }

    /// Fetches every page (newest issue date first) up to the record
    /// ceiling, plus best-effort dataset metadata.
    ///
    /// A first-page failure aborts the fetch; a later-page failure stops
    /// pagination and returns the accumulated records as a truncated
    /// outcome.
    pub async fn fetch_all(&self, run_id: Uuid) -> Result<FetchOutcome, SourceError> {
        let metadata = self.fetch_metadata(run_id).await;

        let mut records: Vec<RawLicense> = Vec::new();
        let mut truncated = false;
        let mut offset = 0usize;

        while records.len() < self.config.max_records {
            match self.fetch_page(offset).await {
                Ok(batch) => {
                    if batch.is_empty() {
                        break;
                    }
                    info!(
                        %run_id,
                        offset,
                        batch = batch.len(),
                        total = records.len() + batch.len(),
                        "fetched license page"
                    );
                    records.extend(batch);
                    offset += self.config.page_size;
                    if !self.config.page_delay.is_zero() {
                        tokio::time::sleep(self.config.page_delay).await;
                    }
                }
                Err(err) if offset == 0 => return Err(SourceError::FirstPage(err)),
                Err(err) => {
                    warn!(%run_id, offset, error = %err, "page fetch failed, keeping partial dataset");
                    truncated = true;
                    break;
                }
            }
        }

        if records.len() >= self.config.max_records {
            warn!(
                %run_id,
                total = records.len(),
                ceiling = self.config.max_records,
                "record ceiling reached, stopping pagination"
            );
        }

        Ok(FetchOutcome {
            records,
            metadata,
            truncated,
        })
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<RawLicense>, reqwest::Error> {
        self.client
            .get(self.resource_url())
            .query(&[
                ("$limit", self.config.page_size.to_string()),
                ("$offset", offset.to_string()),
                ("$order", "first_iss_dt DESC".to_string()),
            ])
            .timeout(self.config.page_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Metadata is a side channel: any failure degrades to `None` without
    /// touching the main fetch.
    async fn fetch_metadata(&self, run_id: Uuid) -> Option<DatasetMetadata> {
        match self.try_fetch_metadata().await {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!(%run_id, error = %err, "dataset metadata unavailable");
                None
            }
        }
    }

    async fn try_fetch_metadata(&self) -> Result<DatasetMetadata, reqwest::Error> {
        let views: ViewsResponse = self
            .client
            .get(self.views_url())
            .timeout(self.config.metadata_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(DatasetMetadata {
            last_updated: views
                .rows_updated_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            name: views.name,
            description: views.description,
        })
    }
}

pub const SYNTHETIC_ID_PREFIX: &str = "CL";

/// Seam for deriving an id when the source row carries none. Kept behind a
/// trait so the synthetic policy can be swapped for a stable one without
/// touching the normalizer.
pub trait IdPolicy {
    fn id_for(&self, raw: &RawLicense, index: usize) -> String;
}

/// Default policy: `CL_<index>_<generation-epoch-millis>`. Such ids are NOT
/// reproducible across refresh cycles — the same business gets a fresh id
/// every run it is missing a source id.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticId {
    pub generated_at_ms: i64,
}

impl IdPolicy for SyntheticId {
    fn id_for(&self, _raw: &RawLicense, index: usize) -> String {
        format!("{SYNTHETIC_ID_PREFIX}_{index}_{}", self.generated_at_ms)
    }
}

/// Alternative policy: a digest over fields that don't change between
/// refreshes, so the same business keeps its id. Not wired as the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHashId;

impl IdPolicy for ContentHashId {
    fn id_for(&self, raw: &RawLicense, _index: usize) -> String {
        let mut hasher = Sha256::new();
        for field in [
            raw.tradename.as_deref(),
            raw.address.as_deref(),
            raw.licencetypes.as_deref(),
            raw.first_iss_dt.as_deref(),
        ] {
            hasher.update(field.unwrap_or_default().as_bytes());
            hasher.update(b"\x1f");
        }
        let digest = hex::encode(hasher.finalize());
        format!("{SYNTHETIC_ID_PREFIX}_{}", &digest[..16])
    }
}

/// Priority-ordered keyword classifier over the raw status phrase. Total:
/// every input maps to exactly one status. The progress keywords are checked
/// first because a phrase can contain several tokens at once.
pub fn classify_status(phrase: &str) -> Status {
    let phrase = phrase.to_lowercase();
    if ["progress", "move", "close"]
        .iter()
        .any(|k| phrase.contains(*k))
    {
        return Status::InProgress;
    }
    if ["pending", "invoiced", "notification"]
        .iter()
        .any(|k| phrase.contains(*k))
    {
        return Status::Pending;
    }
    // "licensed" and the conservative default both land here.
    Status::Active
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn coordinates(raw: &RawLicense) -> Option<(f64, f64)> {
    let coords = raw.point.as_ref()?.coordinates.as_ref()?;
    let longitude = *coords.first()?;
    let latitude = *coords.get(1)?;
    within_envelope(longitude, latitude).then_some((longitude, latitude))
}

/// Maps one raw row to its canonical shape, or `None` when the coordinates
/// are absent or outside the envelope (a filter, not an error).
pub fn normalize(raw: &RawLicense, index: usize, ids: &dyn IdPolicy) -> Option<NormalizedRecord> {
    let (longitude, latitude) = coordinates(raw)?;

    let id = trimmed(raw.getbusid.as_deref()).unwrap_or_else(|| ids.id_for(raw, index));
    let license_types = raw.licencetypes.clone().unwrap_or_default();
    let business_type = license_types
        .split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Business")
        .to_string();
    let sub_type = license_types
        .split('\n')
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(NormalizedRecord {
        id,
        name: trimmed(raw.tradename.as_deref()).unwrap_or_else(|| "Unnamed Business".to_string()),
        business_type,
        sub_type,
        license_types,
        longitude,
        latitude,
        status: classify_status(raw.jobstatusdesc.as_deref().unwrap_or_default()),
        community: trimmed(raw.comdistnm.as_deref()).unwrap_or_else(|| "Unknown".to_string()),
        ward: trimmed(raw.comdistcd.as_deref()),
        address: trimmed(raw.address.as_deref()),
        postal_code: None,
        issued_date: trimmed(raw.first_iss_dt.as_deref()),
        expiry_date: trimmed(raw.exp_dt.as_deref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_at(longitude: f64, latitude: f64) -> RawLicense {
        RawLicense {
            getbusid: Some("BL900100".to_string()),
            tradename: Some("Sunnyside Grocery".to_string()),
            licencetypes: Some("RETAIL DEALER - PREMISES, FOOD SERVICE\nCONVENIENCE STORE".to_string()),
            jobstatusdesc: Some("Licensed".to_string()),
            first_iss_dt: Some("2021-05-10T00:00:00.000".to_string()),
            exp_dt: Some("2026-09-30T00:00:00.000".to_string()),
            address: Some("803 3 AV NW".to_string()),
            comdistnm: Some("SUNNYSIDE".to_string()),
            comdistcd: Some("07".to_string()),
            point: Some(RawPoint {
                coordinates: Some(vec![longitude, latitude]),
            }),
        }
    }

    fn ids() -> SyntheticId {
        SyntheticId {
            generated_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn status_classifier_is_total_and_priority_ordered() {
        assert_eq!(classify_status("Move in Progress"), Status::InProgress);
        assert_eq!(classify_status("Close in Progress"), Status::InProgress);
        assert_eq!(classify_status("Pending Renewal"), Status::Pending);
        assert_eq!(classify_status("Renewal Invoiced"), Status::Pending);
        assert_eq!(classify_status("Renewal Notification Sent"), Status::Pending);
        assert_eq!(classify_status("Licensed"), Status::Active);
        assert_eq!(classify_status("Renewal Licensed"), Status::Active);
        assert_eq!(classify_status(""), Status::Active);
        assert_eq!(classify_status("anything else"), Status::Active);
        // A phrase carrying several tokens resolves by priority, not by
        // whichever keyword happens to match first lexically.
        assert_eq!(classify_status("Licensed - Move in Progress"), Status::InProgress);
        assert_eq!(classify_status("Pending Closure"), Status::InProgress);
    }

    #[test]
    fn envelope_boundaries_are_inclusive() {
        for (lng, lat) in [(-115.0, 50.5), (-113.0, 51.5), (-114.05, 51.04)] {
            assert!(
                normalize(&raw_at(lng, lat), 0, &ids()).is_some(),
                "({lng}, {lat}) should pass"
            );
        }
        for (lng, lat) in [
            (-115.0001, 51.0),
            (-112.9999, 51.0),
            (-114.0, 50.4999),
            (-114.0, 51.5001),
            (0.0, 0.0),
        ] {
            assert!(
                normalize(&raw_at(lng, lat), 0, &ids()).is_none(),
                "({lng}, {lat}) should be dropped"
            );
        }
    }

    #[test]
    fn records_without_coordinates_are_dropped() {
        let mut raw = raw_at(-114.0, 51.0);
        raw.point = None;
        assert!(normalize(&raw, 0, &ids()).is_none());

        let mut raw = raw_at(-114.0, 51.0);
        raw.point = Some(RawPoint { coordinates: None });
        assert!(normalize(&raw, 0, &ids()).is_none());

        let mut raw = raw_at(-114.0, 51.0);
        raw.point = Some(RawPoint {
            coordinates: Some(vec![-114.0]),
        });
        assert!(normalize(&raw, 0, &ids()).is_none());
    }

    #[test]
    fn source_id_is_used_verbatim_when_present() {
        let record = normalize(&raw_at(-114.0, 51.0), 7, &ids()).unwrap();
        assert_eq!(record.id, "BL900100");
    }

    #[test]
    fn missing_source_id_gets_the_synthetic_pattern() {
        let mut raw = raw_at(-114.0, 51.0);
        raw.getbusid = Some("   ".to_string());
        let record = normalize(&raw, 7, &ids()).unwrap();
        assert_eq!(record.id, "CL_7_1700000000000");

        raw.getbusid = None;
        let record = normalize(&raw, 8, &ids()).unwrap();
        assert_eq!(record.id, "CL_8_1700000000000");
    }

    #[test]
    fn content_hash_ids_are_stable_and_well_formed() {
        let raw = raw_at(-114.0, 51.0);
        let a = ContentHashId.id_for(&raw, 0);
        let b = ContentHashId.id_for(&raw, 99);
        assert_eq!(a, b, "index must not influence the digest");
        assert!(a.starts_with("CL_"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));

        let mut other = raw_at(-114.0, 51.0);
        other.tradename = Some("Different Name".to_string());
        assert_ne!(a, ContentHashId.id_for(&other, 0));
    }

    #[test]
    fn type_and_subtype_come_from_the_multivalue_field() {
        let record = normalize(&raw_at(-114.0, 51.0), 0, &ids()).unwrap();
        assert_eq!(record.business_type, "RETAIL DEALER - PREMISES");
        assert_eq!(record.sub_type.as_deref(), Some("CONVENIENCE STORE"));
        assert_eq!(
            record.license_types,
            "RETAIL DEALER - PREMISES, FOOD SERVICE\nCONVENIENCE STORE"
        );

        let mut raw = raw_at(-114.0, 51.0);
        raw.licencetypes = None;
        let record = normalize(&raw, 0, &ids()).unwrap();
        assert_eq!(record.business_type, "Business");
        assert!(record.sub_type.is_none());
    }

    #[test]
    fn absent_optionals_stay_none_and_defaults_apply() {
        let raw = RawLicense {
            point: Some(RawPoint {
                coordinates: Some(vec![-114.0, 51.0]),
            }),
            getbusid: Some("BL1".to_string()),
            ..RawLicense::default()
        };
        let record = normalize(&raw, 0, &ids()).unwrap();
        assert_eq!(record.name, "Unnamed Business");
        assert_eq!(record.community, "Unknown");
        assert_eq!(record.business_type, "Business");
        assert!(record.ward.is_none());
        assert!(record.address.is_none());
        assert!(record.postal_code.is_none());
        assert!(record.issued_date.is_none());
        assert!(record.expiry_date.is_none());
    }

    #[test]
    fn fields_are_trimmed() {
        let mut raw = raw_at(-114.0, 51.0);
        raw.tradename = Some("  Sunnyside Grocery  ".to_string());
        raw.comdistcd = Some(" 07 ".to_string());
        let record = normalize(&raw, 0, &ids()).unwrap();
        assert_eq!(record.name, "Sunnyside Grocery");
        assert_eq!(record.ward.as_deref(), Some("07"));
    }
}
