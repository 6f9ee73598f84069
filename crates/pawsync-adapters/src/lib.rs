//! Source adapter contract plus the generic adapters used when a shelter
//! publishes (or is mirrored into) a plain JSON listing feed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawsync_core::{
    NormalizedListing, ParseError, RawListing, ScrapeError, Sex, Shelter, SizeClass,
};
use pawsync_storage::{fingerprint, HttpClient};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pawsync-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    pub shelter_id: Uuid,
    pub shelter_slug: String,
    pub base_url: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, config: &ScrapeConfig) -> Result<RawPayload, ScrapeError>;

    fn parse(&self, raw: &RawPayload, config: &ScrapeConfig)
        -> Result<Vec<RawListing>, ParseError>;

    fn transform(&self, raw: &RawListing, config: &ScrapeConfig) -> NormalizedListing {
        normalize(raw, config)
    }
}

/// How a shelter's listings are obtained, as written in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum AdapterSpec {
    Fixture { fixture_path: PathBuf },
    JsonFeed {
        #[serde(default)]
        feed_url: Option<String>,
    },
}

/// A shelter registration from `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEntry {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub adapter: AdapterSpec,
}

fn default_active() -> bool {
    true
}

impl SourceEntry {
    pub fn to_shelter(&self) -> Shelter {
        Shelter {
            id: self.id,
            slug: self.slug.clone(),
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            active: self.active,
            status: None,
            last_sync: None,
        }
    }
}

pub fn build_adapter(
    spec: &AdapterSpec,
    workspace_root: &Path,
    http: &HttpClient,
) -> Arc<dyn SourceAdapter> {
    match spec {
        AdapterSpec::Fixture { fixture_path } => {
            Arc::new(FixtureAdapter::new(workspace_root.join(fixture_path)))
        }
        AdapterSpec::JsonFeed { feed_url } => {
            Arc::new(JsonFeedAdapter::new(http.clone(), feed_url.clone()))
        }
    }
}

/// Adapters keyed by shelter slug.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, slug: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(slug.into(), adapter);
    }

    pub fn with(mut self, slug: impl Into<String>, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(slug, adapter);
        self
    }

    /// One adapter per registered shelter, inactive ones included so a
    /// manual `sync` still works for them.
    pub fn from_sources(sources: &[SourceEntry], workspace_root: &Path, http: &HttpClient) -> Self {
        let mut registry = Self::new();
        for source in sources {
            registry.register(
                source.slug.clone(),
                build_adapter(&source.adapter, workspace_root, http),
            );
        }
        registry
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(slug).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// One record of a JSON listing feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRecord {
    #[serde(default, alias = "externalId")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Bare(Vec<FeedRecord>),
    Wrapped { listings: Vec<FeedRecord> },
}

fn absolutize(url: &str, base_url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") || base_url.is_empty() {
        url.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a JSON feed (a bare array or `{"listings": [...]}`) into raw
/// listings with fingerprints.
pub fn parse_feed(body: &[u8], config: &ScrapeConfig) -> Result<Vec<RawListing>, ParseError> {
    let document: FeedDocument = serde_json::from_slice(body)
        .map_err(|err| ParseError::new(config.shelter_id, format!("invalid feed json: {err}")))?;
    let records = match document {
        FeedDocument::Bare(records) | FeedDocument::Wrapped { listings: records } => records,
    };

    let mut listings = Vec::with_capacity(records.len());
    for record in records {
        let name = record.name.trim().to_string();
        if name.is_empty() {
            debug!(shelter = %config.shelter_slug, "skipping feed record without a name");
            continue;
        }
        let photos: Vec<String> = record
            .photos
            .iter()
            .map(|p| absolutize(p, &config.base_url))
            .filter(|p| !p.is_empty())
            .collect();
        let external_id = non_blank(record.id);
        let raw_description = non_blank(record.description);
        let sex = non_blank(record.sex);
        let joined_photos = photos.join(" ");
        let fp = fingerprint(
            config.shelter_id,
            [
                external_id.as_deref().unwrap_or_default(),
                name.as_str(),
                raw_description.as_deref().unwrap_or_default(),
                joined_photos.as_str(),
                sex.as_deref().unwrap_or_default(),
            ],
        );

        listings.push(RawListing {
            external_id,
            fingerprint: fp,
            name,
            raw_description,
            photos,
            sex,
            source_url: non_blank(record.url).map(|u| absolutize(&u, &config.base_url)),
            breed: non_blank(record.breed),
            age_text: non_blank(record.age),
            size_text: non_blank(record.size),
            city: non_blank(record.city),
        });
    }
    Ok(listings)
}

/// Best-effort age parsing for strings like "2 years", "8 months", "1.5 yrs".
pub fn parse_age_months(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    let number: String = lower
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = number.parse().ok()?;
    let months = if lower.contains("month") || lower.contains("mo") {
        value
    } else if lower.contains("week") || lower.contains("wk") {
        value / 4.345
    } else {
        value * 12.0
    };
    Some(months.round().max(0.0) as u32)
}

pub fn parse_size(text: &str) -> Option<SizeClass> {
    let lower = text.trim().to_ascii_lowercase();
    if lower.contains("extra") || lower.contains("giant") || lower == "xl" {
        Some(SizeClass::ExtraLarge)
    } else if lower.contains("large") || lower == "l" || lower == "big" {
        Some(SizeClass::Large)
    } else if lower.contains("medium") || lower == "m" {
        Some(SizeClass::Medium)
    } else if lower.contains("small") || lower == "s" || lower.contains("toy") {
        Some(SizeClass::Small)
    } else {
        None
    }
}

/// Shared raw -> normalized mapping.
pub fn normalize(raw: &RawListing, config: &ScrapeConfig) -> NormalizedListing {
    NormalizedListing {
        shelter_id: config.shelter_id,
        external_id: raw.external_id.clone(),
        fingerprint: raw.fingerprint.clone(),
        name: raw.name.clone(),
        description: raw.raw_description.clone(),
        photos: raw.photos.clone(),
        sex: raw.sex.as_deref().map(Sex::parse_loose),
        source_url: raw.source_url.clone(),
        breed: raw.breed.clone(),
        age_months: raw.age_text.as_deref().and_then(parse_age_months),
        size: raw.size_text.as_deref().and_then(parse_size),
        city: raw.city.clone(),
    }
}

/// Reads a captured feed from disk instead of the network.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, config: &ScrapeConfig) -> Result<RawPayload, ScrapeError> {
        let body = tokio::fs::read(&self.path).await.map_err(|err| {
            ScrapeError::new(
                config.shelter_id,
                format!("reading fixture {}: {err}", self.path.display()),
            )
        })?;
        Ok(RawPayload {
            url: self.path.display().to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse(
        &self,
        raw: &RawPayload,
        config: &ScrapeConfig,
    ) -> Result<Vec<RawListing>, ParseError> {
        parse_feed(&raw.body, config)
    }
}

/// GETs a JSON listing feed, from `feed_url` or the shelter's base URL.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    http: HttpClient,
    feed_url: Option<String>,
}

impl JsonFeedAdapter {
    pub fn new(http: HttpClient, feed_url: Option<String>) -> Self {
        Self { http, feed_url }
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn name(&self) -> &'static str {
        "json_feed"
    }

    async fn fetch(&self, config: &ScrapeConfig) -> Result<RawPayload, ScrapeError> {
        let url = self.feed_url.as_deref().unwrap_or(&config.base_url);
        let response = self
            .http
            .get_bytes(url)
            .await
            .map_err(|err| ScrapeError::new(config.shelter_id, err))?;
        Ok(RawPayload {
            url: response.final_url,
            body: response.body,
            fetched_at: Utc::now(),
        })
    }

    fn parse(
        &self,
        raw: &RawPayload,
        config: &ScrapeConfig,
    ) -> Result<Vec<RawListing>, ParseError> {
        parse_feed(&raw.body, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScrapeConfig {
        ScrapeConfig {
            shelter_id: Uuid::new_v4(),
            shelter_slug: "happy-paws".into(),
            base_url: "https://happypaws.example/".into(),
            run_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn parses_wrapped_feed_and_resolves_relative_urls() {
        let cfg = config();
        let body = br#"{"listings": [
            {"id": "17", "name": " Burek ", "description": "Calm senior.",
             "photos": ["/img/burek.jpg", "https://cdn.example/b2.jpg"],
             "sex": "M", "url": "/dogs/17", "age": "9 years", "size": "Large"}
        ]}"#;

        let listings = parse_feed(body, &cfg).unwrap();
        assert_eq!(listings.len(), 1);
        let raw = &listings[0];
        assert_eq!(raw.name, "Burek");
        assert_eq!(raw.photos[0], "https://happypaws.example/img/burek.jpg");
        assert_eq!(raw.photos[1], "https://cdn.example/b2.jpg");
        assert_eq!(raw.source_url.as_deref(), Some("https://happypaws.example/dogs/17"));

        let normalized = normalize(raw, &cfg);
        assert_eq!(normalized.sex, Some(Sex::Male));
        assert_eq!(normalized.age_months, Some(108));
        assert_eq!(normalized.size, Some(SizeClass::Large));
        assert_eq!(normalized.fingerprint, raw.fingerprint);
    }

    #[test]
    fn fingerprint_changes_with_content_but_not_with_whitespace() {
        let cfg = config();
        let a = parse_feed(br#"[{"id": "1", "name": "Luna", "description": "Shy"}]"#, &cfg).unwrap();
        let b = parse_feed(br#"[{"id": "1", "name": "Luna ", "description": " Shy"}]"#, &cfg).unwrap();
        let c = parse_feed(br#"[{"id": "1", "name": "Luna", "description": "Playful"}]"#, &cfg)
            .unwrap();
        assert_eq!(a[0].fingerprint, b[0].fingerprint);
        assert_ne!(a[0].fingerprint, c[0].fingerprint);
    }

    #[test]
    fn records_without_names_are_skipped_and_bad_json_is_a_parse_error() {
        let cfg = config();
        let listings = parse_feed(br#"[{"name": "  "}, {"name": "Max"}]"#, &cfg).unwrap();
        assert_eq!(listings.len(), 1);

        let err = parse_feed(b"<html>maintenance</html>", &cfg).unwrap_err();
        assert_eq!(err.shelter_id, cfg.shelter_id);
    }

    #[test]
    fn age_parsing_understands_common_units() {
        assert_eq!(parse_age_months("8 months"), Some(8));
        assert_eq!(parse_age_months("about 2 years"), Some(24));
        assert_eq!(parse_age_months("1.5 yrs"), Some(18));
        assert_eq!(parse_age_months("12 weeks"), Some(3));
        assert_eq!(parse_age_months("unknown"), None);
    }

    #[test]
    fn adapter_spec_reads_from_yaml_style_json() {
        let spec: AdapterSpec =
            serde_json::from_str(r#"{"adapter": "json_feed", "feed_url": "https://x/feed"}"#)
                .unwrap();
        assert_eq!(
            spec,
            AdapterSpec::JsonFeed {
                feed_url: Some("https://x/feed".into())
            }
        );
    }
}
