use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Fetching a source failed. Aborts the run; the request is redelivered.
#[derive(Debug, Clone, Error)]
#[error("scrape failed for shelter {shelter_id}: {cause}")]
pub struct ScrapeError {
    pub shelter_id: Uuid,
    pub cause: String,
}

impl ScrapeError {
    pub fn new(shelter_id: Uuid, cause: impl fmt::Display) -> Self {
        Self {
            shelter_id,
            cause: cause.to_string(),
        }
    }
}

/// A fetched payload could not be turned into listings.
#[derive(Debug, Clone, Error)]
#[error("parse failed for shelter {shelter_id}: {cause}")]
pub struct ParseError {
    pub shelter_id: Uuid,
    pub cause: String,
}

impl ParseError {
    pub fn new(shelter_id: Uuid, cause: impl fmt::Display) -> Self {
        Self {
            shelter_id,
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentStage {
    Extract,
    AnalyzePhotos,
    GenerateBio,
}

impl fmt::Display for EnrichmentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Extract => "extract",
            Self::AnalyzePhotos => "analyze_photos",
            Self::GenerateBio => "generate_bio",
        })
    }
}

/// A single enrichment stage failed. Never fatal to the listing.
#[derive(Debug, Clone, Error)]
pub enum EnrichmentError {
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: EnrichmentStage,
        timeout: Duration,
    },
    #[error("{stage} failed: {cause}")]
    Service {
        stage: EnrichmentStage,
        cause: String,
    },
    #[error("{stage} returned an unusable response: {cause}")]
    InvalidResponse {
        stage: EnrichmentStage,
        cause: String,
    },
    #[error("{stage} skipped: enrichment is not configured")]
    Disabled { stage: EnrichmentStage },
}

impl EnrichmentError {
    pub fn stage(&self) -> EnrichmentStage {
        match self {
            Self::Timeout { stage, .. }
            | Self::Service { stage, .. }
            | Self::InvalidResponse { stage, .. }
            | Self::Disabled { stage } => *stage,
        }
    }
}

/// A single store operation failed.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed{scope}: {cause}", scope = scope_suffix(.shelter_id, .listing_id))]
pub struct PersistenceError {
    pub operation: &'static str,
    pub shelter_id: Option<Uuid>,
    pub listing_id: Option<Uuid>,
    pub cause: String,
}

fn scope_suffix(shelter_id: &Option<Uuid>, listing_id: &Option<Uuid>) -> String {
    match (shelter_id, listing_id) {
        (Some(s), Some(l)) => format!(" (shelter {s}, listing {l})"),
        (Some(s), None) => format!(" (shelter {s})"),
        (None, Some(l)) => format!(" (listing {l})"),
        (None, None) => String::new(),
    }
}

impl PersistenceError {
    pub fn new(operation: &'static str, cause: impl fmt::Display) -> Self {
        Self {
            operation,
            shelter_id: None,
            listing_id: None,
            cause: cause.to_string(),
        }
    }

    pub fn for_shelter(mut self, shelter_id: Uuid) -> Self {
        self.shelter_id = Some(shelter_id);
        self
    }

    pub fn for_listing(mut self, listing_id: Uuid) -> Self {
        self.listing_id = Some(listing_id);
        self
    }
}

/// Sending to an outbound queue failed. Already-persisted work stands.
#[derive(Debug, Clone, Error)]
#[error("sending {batch_size} message(s) to `{queue}` failed: {cause}")]
pub struct QueueSendError {
    pub queue: String,
    pub batch_size: usize,
    pub cause: String,
}

impl QueueSendError {
    pub fn new(queue: &str, batch_size: usize, cause: impl fmt::Display) -> Self {
        Self {
            queue: queue.to_string(),
            batch_size,
            cause: cause.to_string(),
        }
    }
}
