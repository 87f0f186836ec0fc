//! Core domain model for scholar profile crawls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "scholar-core";

/// Origin every listing and detail URL is built from.
pub const SITE_ORIGIN: &str = "https://scholar.google.com";

/// Listing page for one profile, newest publications first.
pub fn profile_listing_url(origin: &str, scholar_id: &str) -> String {
    format!(
        "{}/citations?user={}&sortby=pubdate",
        origin.trim_end_matches('/'),
        scholar_id
    )
}

/// Detail page for one publication row, keyed by its page-local id.
pub fn citation_detail_url(origin: &str, local_id: &str) -> String {
    format!(
        "{}/citations?view_op=view_citation&citation_for_view={}",
        origin.trim_end_matches('/'),
        local_id
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlMode {
    /// Header metadata only; the listing is never expanded.
    ProfileOnly,
    FullListing,
}

/// Scholar-level header metadata. Every key is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ProfileInfo {
    pub fn stamp(self, time: DateTime<Utc>) -> ProfileMetadata {
        ProfileMetadata { info: self, time }
    }
}

/// Profile header plus the time the crawl completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(flatten)]
    pub info: ProfileInfo,
    pub time: DateTime<Utc>,
}

/// Citation count as rendered by the listing.
///
/// An empty anchor means zero and serialises as the integer `0`. Anything else
/// is kept verbatim as a string because the page does not guarantee digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Citation {
    Zero,
    Count(String),
}

impl Serialize for Citation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Citation::Zero => serializer.serialize_u64(0),
            Citation::Count(count) => serializer.serialize_str(count),
        }
    }
}

impl<'de> Deserialize<'de> for Citation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCitation {
            Number(u64),
            Text(String),
        }

        Ok(match RawCitation::deserialize(deserializer)? {
            RawCitation::Number(0) => Citation::Zero,
            RawCitation::Number(n) => Citation::Count(n.to_string()),
            RawCitation::Text(text) => Citation::Count(text),
        })
    }
}

/// One publication row, optionally enriched from its detail page.
///
/// Fields stay `None` when the page did not render them; emission gating
/// happens in the extractors, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Cluster id shared across the site's pages for the same work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_id: Option<String>,
}

fn override_field_value<T>(field: &mut Option<T>, value: Option<T>) {
    if let Some(value) = value {
        *field = Some(value);
    }
}

fn non_empty(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.is_empty())
}

impl PublicationRecord {
    /// Folds a partial update into this record. Values present in `patch` win.
    pub fn merge(&mut self, patch: PublicationRecord) {
        override_field_value(&mut self.title, patch.title);
        override_field_value(&mut self.link, patch.link);
        override_field_value(&mut self.local_id, patch.local_id);
        override_field_value(&mut self.year, patch.year);
        override_field_value(&mut self.authors, patch.authors);
        override_field_value(&mut self.venue, patch.venue);
        override_field_value(&mut self.citation, patch.citation);
        override_field_value(&mut self.citation_link, patch.citation_link);
        override_field_value(&mut self.ext_text, patch.ext_text);
        override_field_value(&mut self.ext_link, patch.ext_link);
        override_field_value(&mut self.pub_date, patch.pub_date);
        override_field_value(&mut self.desc, patch.desc);
        override_field_value(&mut self.id, patch.id);
        override_field_value(&mut self.hash_id, patch.hash_id);
    }

    pub fn merged(mut self, patch: PublicationRecord) -> Self {
        self.merge(patch);
        self
    }

    pub fn has_local_id(&self) -> bool {
        non_empty(&self.local_id)
    }

    pub fn has_title(&self) -> bool {
        non_empty(&self.title)
    }

    pub fn has_year(&self) -> bool {
        non_empty(&self.year)
    }

    pub fn has_cluster_id(&self) -> bool {
        non_empty(&self.id)
    }
}

/// The single JSON document a run produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutputDocument {
    Profile(ProfileMetadata),
    Full {
        metadata: ProfileMetadata,
        papers: Vec<PublicationRecord>,
    },
}

impl OutputDocument {
    pub fn metadata(&self) -> &ProfileMetadata {
        match self {
            OutputDocument::Profile(metadata) => metadata,
            OutputDocument::Full { metadata, .. } => metadata,
        }
    }

    pub fn papers(&self) -> &[PublicationRecord] {
        match self {
            OutputDocument::Profile(_) => &[],
            OutputDocument::Full { papers, .. } => papers,
        }
    }
}
