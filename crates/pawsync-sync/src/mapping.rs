use chrono::{DateTime, Utc};
use pawsync_core::{Listing, ListingStatus, NormalizedListing};
use uuid::Uuid;

use crate::enrichment::Enrichment;

/// Builds the row for a newly discovered listing. Extracted attributes win
/// over the adapter's own fields; the adapter fields fill whatever
/// extraction did not provide.
pub fn new_listing(
    normalized: NormalizedListing,
    enrichment: Enrichment,
    now: DateTime<Utc>,
) -> Listing {
    let Enrichment {
        text, photo, bio, ..
    } = enrichment;

    let mut breeds: Vec<String> = Vec::new();
    let mut push_breed = |breed: &str| {
        let breed = breed.trim();
        if !breed.is_empty() && !breeds.iter().any(|b| b.eq_ignore_ascii_case(breed)) {
            breeds.push(breed.to_string());
        }
    };
    if let Some(text) = &text {
        text.breeds.iter().for_each(|b| push_breed(b));
    }
    if let Some(photo) = &photo {
        photo.breeds.iter().for_each(|b| push_breed(b));
    }
    if let Some(breed) = &normalized.breed {
        push_breed(breed);
    }

    let sex = text.as_ref().and_then(|t| t.sex).or(normalized.sex);
    let age_months = text.as_ref().and_then(|t| t.age_months).or(normalized.age_months);
    let size = text.as_ref().and_then(|t| t.size).or(normalized.size);
    let city = text
        .as_ref()
        .and_then(|t| t.city.clone())
        .or(normalized.city);
    let personality_tags = text
        .as_ref()
        .map(|t| t.personality_tags.clone())
        .unwrap_or_default();

    Listing {
        id: Uuid::new_v4(),
        shelter_id: normalized.shelter_id,
        external_id: normalized.external_id,
        fingerprint: normalized.fingerprint,
        name: normalized.name,
        status: ListingStatus::Available,
        curated_at: None,
        description: normalized.description,
        sex,
        source_url: normalized.source_url,
        photos: normalized.photos,
        city,
        breeds,
        size,
        age_months,
        personality_tags,
        text_attributes: text,
        photo_attributes: photo,
        bio,
        last_seen_at: now,
        created_at: now,
        updated_at: now,
    }
}

/// Photos still hosted by the source site rather than our blob store.
pub fn external_photos(photos: &[String], blob_base_url: Option<&str>) -> Vec<String> {
    photos
        .iter()
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .filter(|url| blob_base_url.map_or(true, |base| !url.starts_with(base)))
        .cloned()
        .collect()
}
