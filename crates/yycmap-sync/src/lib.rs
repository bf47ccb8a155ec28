//! Refresh pipeline orchestration: fetch → normalize → split → persist.
//!
//! One cycle runs end to end with no internal retry; any fatal error
//! propagates to the caller, and the next scheduled invocation is the retry
//! mechanism. Record-level validation failures never escalate — they are
//! dropped and counted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;
use yycmap_core::{DatasetMetadata, HeavyRecord, LightCollection, NormalizedRecord};
use yycmap_source::{normalize, IdPolicy, SocrataClient, SocrataConfig, SyntheticId};
use yycmap_storage::ArtifactStore;

pub const CRATE_NAME: &str = "yycmap-sync";

/// Twice daily at 00:00 and 12:00 (seconds-first cron).
pub const DEFAULT_REFRESH_CRON: &str = "0 0 0,12 * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub base_url: String,
    pub user_agent: String,
    pub page_timeout_secs: u64,
    pub metadata_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub cache_capacity: usize,
    pub cache_ttl_minutes: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("YYCMAP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./public/data")),
            base_url: std::env::var("YYCMAP_SOURCE_BASE_URL")
                .unwrap_or_else(|_| yycmap_source::DEFAULT_BASE_URL.to_string()),
            user_agent: std::env::var("YYCMAP_USER_AGENT")
                .unwrap_or_else(|_| "yycmap-bot/0.1".to_string()),
            page_timeout_secs: std::env::var("YYCMAP_PAGE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            metadata_timeout_secs: std::env::var("YYCMAP_METADATA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: std::env::var("YYCMAP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("YYCMAP_REFRESH_CRON")
                .unwrap_or_else(|_| DEFAULT_REFRESH_CRON.to_string()),
            cache_capacity: std::env::var("YYCMAP_CACHE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(yycmap_storage::DEFAULT_CACHE_CAPACITY),
            cache_ttl_minutes: std::env::var("YYCMAP_CACHE_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes * 60)
    }

    fn socrata(&self) -> SocrataConfig {
        SocrataConfig {
            base_url: self.base_url.clone(),
            user_agent: self.user_agent.clone(),
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            metadata_timeout: Duration::from_secs(self.metadata_timeout_secs),
            ..SocrataConfig::default()
        }
    }
}

/// Outcome of one refresh cycle, logged and returned to the trigger.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub valid: usize,
    pub skipped: usize,
    pub truncated: bool,
    pub heavy_files: usize,
    pub heavy_bytes: u64,
    pub light_bytes: u64,
}

/// Normalizes a raw batch in input order, dropping invalid rows and counting
/// the skips.
pub fn normalize_batch(
    raw: &[yycmap_source::RawLicense],
    ids: &dyn IdPolicy,
) -> (Vec<NormalizedRecord>, usize) {
    let mut records = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;
    for (index, row) in raw.iter().enumerate() {
        match normalize(row, index, ids) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    (records, skipped)
}

/// Projects a normalized batch into the light aggregate and its heavy
/// fan-out, preserving input order.
pub fn split(
    records: &[NormalizedRecord],
    metadata: Option<&DatasetMetadata>,
    generated_at: DateTime<Utc>,
) -> (LightCollection, Vec<HeavyRecord>) {
    let features = records.iter().map(NormalizedRecord::to_light_feature).collect();
    let heavies = records.iter().map(NormalizedRecord::to_heavy).collect();
    (
        LightCollection::new(features, metadata, generated_at),
        heavies,
    )
}

pub struct RefreshPipeline {
    config: SyncConfig,
    client: SocrataClient,
    store: ArtifactStore,
}

impl RefreshPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let client = SocrataClient::new(config.socrata()).context("building source client")?;
        let store = ArtifactStore::new(config.data_dir.clone());
        Ok(Self {
            config,
            client,
            store,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// One full cycle. Persistence only happens after the whole batch is
    /// normalized, and the store swaps artifacts atomically, so a failure
    /// anywhere leaves the previous cycle's output untouched.
    pub async fn run_once(&self) -> Result<RefreshSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, data_dir = %self.config.data_dir.display(), "starting refresh cycle");

        let outcome = self
            .client
            .fetch_all(run_id)
            .await
            .context("fetching source records")?;
        let fetched = outcome.records.len();

        let generated_at = Utc::now();
        let ids = SyntheticId {
            generated_at_ms: generated_at.timestamp_millis(),
        };
        let (records, skipped) = normalize_batch(&outcome.records, &ids);
        let (light, heavies) = split(&records, outcome.metadata.as_ref(), generated_at);

        let report = self
            .store
            .replace_all(&light, &heavies)
            .await
            .context("persisting artifacts")?;

        let finished_at = Utc::now();
        let summary = RefreshSummary {
            run_id,
            started_at,
            finished_at,
            fetched,
            valid: records.len(),
            skipped,
            truncated: outcome.truncated,
            heavy_files: report.heavy_files,
            heavy_bytes: report.heavy_bytes,
            light_bytes: report.light_bytes,
        };
        info!(
            %run_id,
            fetched = summary.fetched,
            valid = summary.valid,
            skipped = summary.skipped,
            truncated = summary.truncated,
            light_bytes = summary.light_bytes,
            heavy_files = summary.heavy_files,
            heavy_bytes = summary.heavy_bytes,
            "refresh cycle complete"
        );
        Ok(summary)
    }
}

pub async fn run_refresh_once_from_env() -> Result<RefreshSummary> {
    RefreshPipeline::new(SyncConfig::from_env())?.run_once().await
}

/// Wires the refresh job onto a cron scheduler. Each firing runs one cycle
/// and logs the outcome; a failed cycle is logged and left for the next
/// firing.
pub async fn build_scheduler(pipeline: Arc<RefreshPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().refresh_cron.clone();
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_job_id, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    valid = summary.valid,
                    skipped = summary.skipped,
                    "scheduled refresh complete"
                ),
                Err(err) => error!(error = format!("{err:#}"), "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron {cron}"))?;
    scheduler.add(job).await.context("adding refresh job")?;
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yycmap_core::Status;
    use yycmap_source::{RawLicense, RawPoint};

    fn raw(getbusid: &str, lng: f64, lat: f64, status: &str) -> RawLicense {
        RawLicense {
            getbusid: Some(getbusid.to_string()),
            tradename: Some("Some Business".to_string()),
            licencetypes: Some("FOOD SERVICE".to_string()),
            jobstatusdesc: Some(status.to_string()),
            point: Some(RawPoint {
                coordinates: Some(vec![lng, lat]),
            }),
            ..RawLicense::default()
        }
    }

    fn ids() -> SyntheticId {
        SyntheticId {
            generated_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn split_round_trips_every_record() {
        let batch = vec![
            raw("BL1", -114.1, 51.0, "Licensed"),
            raw("BL2", -114.2, 51.1, "Pending Renewal"),
            raw("BL3", -113.9, 50.9, "Move in Progress"),
        ];
        let (records, skipped) = normalize_batch(&batch, &ids());
        assert_eq!(skipped, 0);

        let (light, heavies) = split(&records, None, Utc::now());
        assert_eq!(light.count, 3);
        assert_eq!(light.features.len(), 3);
        assert_eq!(heavies.len(), 3);

        let light_ids: Vec<_> = light.features.iter().map(|f| f.properties.id.as_str()).collect();
        let heavy_ids: Vec<_> = heavies.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(light_ids, vec!["BL1", "BL2", "BL3"]);
        assert_eq!(light_ids, heavy_ids);
    }

    #[test]
    fn three_record_scenario_counts_statuses_and_skips() {
        let batch = vec![
            raw("BL1", -114.1, 51.0, "Licensed"),
            raw("BL2", 0.0, 0.0, "Licensed"),
            // Empty source id forces the synthetic policy.
            raw("", -114.05, 51.02, "Pending Renewal"),
        ];

        let (records, skipped) = normalize_batch(&batch, &ids());
        assert_eq!(skipped, 1);

        let (light, heavies) = split(&records, None, Utc::now());
        assert_eq!(light.count, 2);
        assert_eq!(heavies.len(), 2);
        assert_eq!(light.features[0].properties.status, Status::Active);
        assert_eq!(light.features[1].properties.status, Status::Pending);
        // The record with an empty source id gets the synthetic pattern,
        // stamped with its raw batch index.
        assert_eq!(light.features[1].properties.id, "CL_2_1700000000000");
    }

    #[test]
    fn split_carries_dataset_metadata_into_the_aggregate() {
        let batch = vec![raw("BL1", -114.1, 51.0, "Licensed")];
        let (records, _) = normalize_batch(&batch, &ids());
        let metadata = DatasetMetadata {
            last_updated: None,
            name: Some("Calgary Business Licences".to_string()),
            description: None,
        };
        let (light, _) = split(&records, Some(&metadata), Utc::now());
        assert_eq!(light.dataset_name, "Calgary Business Licences");
    }
}
