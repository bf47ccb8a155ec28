//! Core domain model and persisted artifact schemas for the YYC license map.
//!
//! The JSON shapes of [`LightCollection`] and [`HeavyRecord`] are an
//! interchange contract with the map UI; field names and nesting must not
//! drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "yycmap-core";

/// Calgary bounding envelope. Records outside it are dropped at
/// normalization time and never persisted.
pub const LONGITUDE_MIN: f64 = -115.0;
pub const LONGITUDE_MAX: f64 = -113.0;
pub const LATITUDE_MIN: f64 = 50.5;
pub const LATITUDE_MAX: f64 = 51.5;

/// Inclusive on all four edges.
pub fn within_envelope(longitude: f64, latitude: f64) -> bool {
    (LONGITUDE_MIN..=LONGITUDE_MAX).contains(&longitude)
        && (LATITUDE_MIN..=LATITUDE_MAX).contains(&latitude)
}

/// Simplified license status derived from the source's free-text phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Pending,
    InProgress,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
        }
    }
}

/// Canonical per-record representation derived once per refresh cycle.
///
/// Invariant: `id` is non-empty and `(longitude, latitude)` satisfies
/// [`within_envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub name: String,
    pub business_type: String,
    pub sub_type: Option<String>,
    pub license_types: String,
    pub longitude: f64,
    pub latitude: f64,
    pub status: Status,
    pub community: String,
    pub ward: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub issued_date: Option<String>,
    pub expiry_date: Option<String>,
}

/// Best-effort dataset metadata from the source catalog; every field may be
/// unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub last_updated: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub description: Option<String>,
}

pub const DEFAULT_DATASET_NAME: &str = "Calgary Business Licenses";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: [f64; 2],
}

impl PointGeometry {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: [longitude, latitude],
        }
    }
}

/// Minimal per-record payload the map needs to draw one point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightProperties {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub business_type: String,
    pub status: Status,
    pub community: String,
    #[serde(rename = "expiryDate")]
    pub expiry_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightFeature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: PointGeometry,
    pub properties: LightProperties,
}

/// The single aggregate artifact consumed by the map. Feature order is the
/// source batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "datasetLastUpdated")]
    pub dataset_last_updated: Option<DateTime<Utc>>,
    #[serde(rename = "datasetName")]
    pub dataset_name: String,
    pub count: usize,
    pub features: Vec<LightFeature>,
}

impl LightCollection {
    /// `count` is derived from `features`, so the two can never disagree in a
    /// freshly built collection.
    pub fn new(
        features: Vec<LightFeature>,
        metadata: Option<&DatasetMetadata>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            timestamp: generated_at,
            dataset_last_updated: metadata.and_then(|m| m.last_updated),
            dataset_name: metadata
                .and_then(|m| m.name.clone())
                .unwrap_or_else(|| DEFAULT_DATASET_NAME.to_string()),
            count: features.len(),
            features,
        }
    }
}

/// Contact block reserved for future enrichment; serializes as `{}` while
/// unpopulated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorCount {
    pub radius_500m: u32,
    pub radius_1km: u32,
    pub radius_2km: u32,
}

/// Everything the normalizer could extract for one record, plus reserved
/// extension fields kept in the schema for future enrichment passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullDetails {
    pub license_number: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub province: String,
    pub postal_code: String,
    #[serde(rename = "type")]
    pub business_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    pub license_types: String,
    pub status: Status,
    pub issued_date: String,
    pub expiry_date: Option<String>,
    pub coordinates: [f64; 2],
    pub longitude: f64,
    pub latitude: f64,
    pub community: String,
    pub ward: String,
    #[serde(default)]
    pub contacts: Contacts,
    pub business_area: Option<f64>,
    pub estimated_rent: Option<f64>,
    pub building_type: Option<String>,
    pub nearby_businesses: Vec<String>,
    pub competitor_count: CompetitorCount,
    pub photos: Vec<String>,
    pub notes: String,
}

/// Full per-record detail, persisted as one discrete unit per id and fetched
/// on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeavyRecord {
    pub id: String,
    #[serde(rename = "fullDetails")]
    pub full_details: FullDetails,
}

impl NormalizedRecord {
    pub fn to_light_feature(&self) -> LightFeature {
        LightFeature {
            kind: "Feature".to_string(),
            geometry: PointGeometry::new(self.longitude, self.latitude),
            properties: LightProperties {
                id: self.id.clone(),
                name: self.name.clone(),
                business_type: self.business_type.clone(),
                status: self.status,
                community: self.community.clone(),
                expiry_date: self.expiry_date.clone(),
            },
        }
    }

    pub fn to_heavy(&self) -> HeavyRecord {
        HeavyRecord {
            id: self.id.clone(),
            full_details: FullDetails {
                license_number: self.id.clone(),
                name: self.name.clone(),
                address: self
                    .address
                    .clone()
                    .unwrap_or_else(|| "N/A".to_string()),
                city: "Calgary".to_string(),
                province: "AB".to_string(),
                postal_code: self.postal_code.clone().unwrap_or_default(),
                business_type: self.business_type.clone(),
                sub_type: self.sub_type.clone(),
                license_types: self.license_types.clone(),
                status: self.status,
                issued_date: self.issued_date.clone().unwrap_or_default(),
                expiry_date: self.expiry_date.clone(),
                coordinates: [self.longitude, self.latitude],
                longitude: self.longitude,
                latitude: self.latitude,
                community: self.community.clone(),
                ward: self.ward.clone().unwrap_or_default(),
                contacts: Contacts::default(),
                business_area: None,
                estimated_rent: None,
                building_type: None,
                nearby_businesses: Vec::new(),
                competitor_count: CompetitorCount::default(),
                photos: Vec::new(),
                notes: String::new(),
            },
        }
    }
}
