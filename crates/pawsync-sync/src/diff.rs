//! Fingerprint diff of one scrape against a shelter's stored listings.

use std::collections::{HashMap, HashSet};

use pawsync_core::{Listing, NormalizedListing};

/// Three disjoint partitions of the fingerprints seen in a scrape and in
/// the store.
#[derive(Debug, Default)]
pub struct DiffPartition {
    /// Scraped listings whose fingerprint is not stored yet.
    pub new: Vec<NormalizedListing>,
    /// Stored rows whose fingerprint was scraped again.
    pub matched: Vec<Listing>,
    /// Stored rows whose fingerprint was not scraped this run.
    pub missing: Vec<Listing>,
    /// Scraped entries dropped because an earlier entry had the same
    /// fingerprint.
    pub duplicates: usize,
}

impl DiffPartition {
    /// Distinct fingerprints in this run's scrape.
    pub fn scraped(&self) -> usize {
        self.new.len() + self.matched.len()
    }
}

pub fn partition(scraped: Vec<NormalizedListing>, existing: Vec<Listing>) -> DiffPartition {
    let mut by_fingerprint: HashMap<String, Listing> = existing
        .into_iter()
        .map(|row| (row.fingerprint.clone(), row))
        .collect();

    let mut out = DiffPartition::default();
    let mut seen = HashSet::with_capacity(scraped.len());
    for listing in scraped {
        if !seen.insert(listing.fingerprint.clone()) {
            out.duplicates += 1;
            continue;
        }
        match by_fingerprint.remove(&listing.fingerprint) {
            Some(row) => out.matched.push(row),
            None => out.new.push(listing),
        }
    }
    out.missing = by_fingerprint.into_values().collect();
    out.missing.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    out
}
