//! Core domain model for pawsync: listings, sync runs, shelters and the job
//! payloads exchanged with the queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;

pub use error::{
    EnrichmentError, EnrichmentStage, ParseError, PersistenceError, QueueSendError, ScrapeError,
};

pub const CRATE_NAME: &str = "pawsync-core";

/// Inbound scrape requests.
pub const SCRAPE_QUEUE: &str = "scrape-requests";
/// Outbound photo ingestion jobs.
pub const IMAGE_QUEUE: &str = "image-processing";
/// Outbound search index jobs.
pub const REINDEX_QUEUE: &str = "reindex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Pending,
    Available,
    Adopted,
    Reserved,
    Removed,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Adopted => "adopted",
            Self::Reserved => "reserved",
            Self::Removed => "removed",
        }
    }

    /// Rows that count towards the expected size of a scrape.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Available)
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

impl FromStr for ListingStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "available" => Ok(Self::Available),
            "adopted" => Ok(Self::Adopted),
            "reserved" => Ok(Self::Reserved),
            "removed" => Ok(Self::Removed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

impl Sex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient parse for the free-form values scraped sites publish.
    pub fn parse_loose(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "m" | "male" | "boy" | "samiec" => Self::Male,
            "f" | "female" | "girl" | "samica" => Self::Female,
            _ => Self::Unknown,
        }
    }
}

impl FromStr for Sex {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            "unknown" => Ok(Self::Unknown),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::ExtraLarge => "extra_large",
        }
    }
}

impl FromStr for SizeClass {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "extra_large" => Ok(Self::ExtraLarge),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Attributes extracted from a listing's free-text description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextAttributes {
    #[serde(default)]
    pub sex: Option<Sex>,
    #[serde(default)]
    pub breeds: Vec<String>,
    #[serde(default)]
    pub age_months: Option<u32>,
    #[serde(default)]
    pub size: Option<SizeClass>,
    #[serde(default)]
    pub personality_tags: Vec<String>,
    #[serde(default)]
    pub good_with_kids: Option<bool>,
    #[serde(default)]
    pub good_with_dogs: Option<bool>,
    #[serde(default)]
    pub good_with_cats: Option<bool>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub urgent: bool,
}

/// Attributes derived from a listing's photos.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhotoAttributes {
    #[serde(default)]
    pub fur_length: Option<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub breeds: Vec<String>,
}

/// Everything known about an animal, handed to bio generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedAttributes {
    pub name: String,
    pub text: TextAttributes,
    pub photo: Option<PhotoAttributes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedBio {
    pub bio: String,
}

/// One listing as emitted by a source adapter's parse step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_id: Option<String>,
    pub fingerprint: String,
    pub name: String,
    pub raw_description: Option<String>,
    pub photos: Vec<String>,
    pub sex: Option<String>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub age_text: Option<String>,
    #[serde(default)]
    pub size_text: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

/// Adapter output after transform; the fallback fields are used when text
/// extraction is unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub shelter_id: Uuid,
    pub external_id: Option<String>,
    pub fingerprint: String,
    pub name: String,
    pub description: Option<String>,
    pub photos: Vec<String>,
    pub sex: Option<Sex>,
    pub source_url: Option<String>,
    pub breed: Option<String>,
    pub age_months: Option<u32>,
    pub size: Option<SizeClass>,
    pub city: Option<String>,
}

/// One adoptable animal as known to the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub shelter_id: Uuid,
    pub external_id: Option<String>,
    pub fingerprint: String,
    pub name: String,
    pub status: ListingStatus,
    /// Set when the status was last chosen by an external curator rather than
    /// by reconciliation.
    pub curated_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub sex: Option<Sex>,
    pub source_url: Option<String>,
    pub photos: Vec<String>,
    pub city: Option<String>,
    pub breeds: Vec<String>,
    pub size: Option<SizeClass>,
    pub age_months: Option<u32>,
    pub personality_tags: Vec<String>,
    pub text_attributes: Option<TextAttributes>,
    pub photo_attributes: Option<PhotoAttributes>,
    pub bio: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn is_curated(&self) -> bool {
        self.curated_at.is_some()
    }
}

/// Operator-facing outcome of a source's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Error,
    Success,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Error => "error",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// One execution of the reconciliation engine for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub shelter_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dogs_added: u32,
    pub dogs_updated: u32,
    pub dogs_removed: u32,
    pub errors: Vec<String>,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub fn start(id: Uuid, shelter_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            shelter_id,
            started_at,
            finished_at: None,
            dogs_added: 0,
            dogs_updated: 0,
            dogs_removed: 0,
            errors: Vec::new(),
            error_message: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn status(&self) -> SyncStatus {
        if self.finished_at.is_none() {
            SyncStatus::Running
        } else if !self.errors.is_empty() || self.error_message.is_some() {
            SyncStatus::Error
        } else {
            SyncStatus::Success
        }
    }
}

/// A registered source site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shelter {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub active: bool,
    pub status: Option<SyncStatus>,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRequest {
    pub shelter_id: Uuid,
    pub shelter_slug: String,
    pub base_url: String,
    #[serde(default)]
    pub sync_run_id: Option<Uuid>,
}

impl ScrapeRequest {
    pub fn for_shelter(shelter: &Shelter) -> Self {
        Self {
            shelter_id: shelter.id,
            shelter_slug: shelter.slug.clone(),
            base_url: shelter.base_url.clone(),
            sync_run_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProcessingJob {
    pub dog_id: Uuid,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexMetadata {
    pub shelter_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<SizeClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_months: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<Sex>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJob {
    #[serde(rename = "type")]
    pub kind: ReindexKind,
    pub dog_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReindexMetadata>,
}

impl ReindexJob {
    pub fn upsert(listing: &Listing) -> Self {
        Self {
            kind: ReindexKind::Upsert,
            dog_id: listing.id,
            description: listing.bio.clone().or_else(|| listing.description.clone()),
            metadata: Some(ReindexMetadata {
                shelter_id: listing.shelter_id,
                city: listing.city.clone(),
                size: listing.size,
                age_months: listing.age_months,
                sex: listing.sex,
            }),
        }
    }

    pub fn delete(dog_id: Uuid) -> Self {
        Self {
            kind: ReindexKind::Delete,
            dog_id,
            description: None,
            metadata: None,
        }
    }
}
