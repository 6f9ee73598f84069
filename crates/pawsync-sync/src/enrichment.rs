//! Best-effort enrichment of newly discovered listings.
//!
//! Three stages run per listing: text extraction, photo analysis and bio
//! generation. A failed or timed-out stage leaves its fields empty and never
//! prevents the listing from being stored.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use pawsync_core::{
    CombinedAttributes, EnrichmentError, EnrichmentStage, GeneratedBio, NormalizedListing,
    PhotoAttributes, TextAttributes,
};
use pawsync_storage::{FetchError, HttpClient};
use serde::Serialize;
use tracing::{debug, warn};

#[async_trait]
pub trait EnrichmentServices: Send + Sync {
    async fn extract(&self, text: &str) -> Result<TextAttributes, EnrichmentError>;

    async fn analyze_multiple(&self, urls: &[String]) -> Result<PhotoAttributes, EnrichmentError>;

    async fn generate(
        &self,
        attributes: &CombinedAttributes,
    ) -> Result<GeneratedBio, EnrichmentError>;
}

/// Used when no enrichment service is configured; every stage fails softly.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledEnrichment;

#[async_trait]
impl EnrichmentServices for DisabledEnrichment {
    async fn extract(&self, _text: &str) -> Result<TextAttributes, EnrichmentError> {
        Err(EnrichmentError::Disabled {
            stage: EnrichmentStage::Extract,
        })
    }

    async fn analyze_multiple(&self, _urls: &[String]) -> Result<PhotoAttributes, EnrichmentError> {
        Err(EnrichmentError::Disabled {
            stage: EnrichmentStage::AnalyzePhotos,
        })
    }

    async fn generate(
        &self,
        _attributes: &CombinedAttributes,
    ) -> Result<GeneratedBio, EnrichmentError> {
        Err(EnrichmentError::Disabled {
            stage: EnrichmentStage::GenerateBio,
        })
    }
}

/// JSON client for an enrichment service exposing `/extract`,
/// `/analyze-photos` and `/generate-bio`.
#[derive(Debug, Clone)]
pub struct HttpEnrichmentClient {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    urls: &'a [String],
}

impl HttpEnrichmentClient {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

fn map_fetch_error(stage: EnrichmentStage, err: FetchError) -> EnrichmentError {
    match err {
        FetchError::Decode { source, .. } => EnrichmentError::InvalidResponse {
            stage,
            cause: source.to_string(),
        },
        other => EnrichmentError::Service {
            stage,
            cause: other.to_string(),
        },
    }
}

#[async_trait]
impl EnrichmentServices for HttpEnrichmentClient {
    async fn extract(&self, text: &str) -> Result<TextAttributes, EnrichmentError> {
        self.http
            .post_json(&self.endpoint("extract"), &ExtractRequest { text })
            .await
            .map_err(|err| map_fetch_error(EnrichmentStage::Extract, err))
    }

    async fn analyze_multiple(&self, urls: &[String]) -> Result<PhotoAttributes, EnrichmentError> {
        self.http
            .post_json(&self.endpoint("analyze-photos"), &AnalyzeRequest { urls })
            .await
            .map_err(|err| map_fetch_error(EnrichmentStage::AnalyzePhotos, err))
    }

    async fn generate(
        &self,
        attributes: &CombinedAttributes,
    ) -> Result<GeneratedBio, EnrichmentError> {
        let bio: GeneratedBio = self
            .http
            .post_json(&self.endpoint("generate-bio"), attributes)
            .await
            .map_err(|err| map_fetch_error(EnrichmentStage::GenerateBio, err))?;
        if bio.bio.trim().is_empty() {
            return Err(EnrichmentError::InvalidResponse {
                stage: EnrichmentStage::GenerateBio,
                cause: "empty bio".to_string(),
            });
        }
        Ok(bio)
    }
}

/// Whatever subset of enrichment succeeded for one listing.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub text: Option<TextAttributes>,
    pub photo: Option<PhotoAttributes>,
    pub bio: Option<String>,
    pub failures: Vec<EnrichmentError>,
}

/// Runs the three stages with a per-call timeout and bounded fan-out across
/// listings.
#[derive(Clone)]
pub struct Enricher {
    services: Arc<dyn EnrichmentServices>,
    timeout: Duration,
    concurrency: usize,
}

impl Enricher {
    pub fn new(services: Arc<dyn EnrichmentServices>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            services,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledEnrichment), Duration::from_secs(1), 1)
    }

    async fn stage<T>(
        &self,
        stage: EnrichmentStage,
        call: impl Future<Output = Result<T, EnrichmentError>>,
    ) -> Result<T, EnrichmentError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EnrichmentError::Timeout {
                stage,
                timeout: self.timeout,
            }),
        }
    }

    pub async fn enrich(&self, listing: &NormalizedListing) -> Enrichment {
        let description = listing
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());

        let text_call = async {
            match description {
                Some(text) => Some(
                    self.stage(EnrichmentStage::Extract, self.services.extract(text))
                        .await,
                ),
                None => None,
            }
        };
        let photo_call = async {
            if listing.photos.is_empty() {
                None
            } else {
                Some(
                    self.stage(
                        EnrichmentStage::AnalyzePhotos,
                        self.services.analyze_multiple(&listing.photos),
                    )
                    .await,
                )
            }
        };
        let (text, photo) = tokio::join!(text_call, photo_call);

        let mut out = Enrichment::default();
        match text {
            Some(Ok(attrs)) => out.text = Some(attrs),
            Some(Err(err)) => out.failures.push(err),
            None => {}
        }
        match photo {
            Some(Ok(attrs)) => out.photo = Some(attrs),
            Some(Err(err)) => out.failures.push(err),
            None => {}
        }

        if let Some(text) = &out.text {
            let combined = CombinedAttributes {
                name: listing.name.clone(),
                text: text.clone(),
                photo: out.photo.clone(),
            };
            match self
                .stage(EnrichmentStage::GenerateBio, self.services.generate(&combined))
                .await
            {
                Ok(generated) => out.bio = Some(generated.bio),
                Err(err) => out.failures.push(err),
            }
        }

        for failure in &out.failures {
            if matches!(failure, EnrichmentError::Disabled { .. }) {
                debug!(fingerprint = %listing.fingerprint, error = %failure, "enrichment stage skipped");
            } else {
                warn!(fingerprint = %listing.fingerprint, error = %failure, "enrichment stage failed");
            }
        }
        out
    }

    /// Enriches every listing with at most `concurrency` pipelines in flight.
    /// Output order is not preserved.
    pub async fn enrich_all(
        &self,
        listings: Vec<NormalizedListing>,
    ) -> Vec<(NormalizedListing, Enrichment)> {
        stream::iter(listings)
            .map(|listing| async move {
                let enrichment = self.enrich(&listing).await;
                (listing, enrichment)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}
