//! Core listing model and identity rules for Casa.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "casa-core";

/// Observation timestamp kept verbatim so foreign formats survive a merge untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts RFC 3339 or a bare `YYYY-MM-DD` date (read as midnight UTC).
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let raw = self.0.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Added,
    #[default]
    Updated,
    Missing,
    Removed,
}

/// One row as it appears in a snapshot file. Every field may be absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListing {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<JsonValue>>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub status: Option<ListingStatus>,
    /// Status key written by older store files.
    #[serde(
        rename = "__status",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_status: Option<ListingStatus>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub consecutive_misses: Option<u32>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub has_duplicates: Option<bool>,
    /// Attributes the engine never interprets (`coords` included), carried verbatim.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl RawListing {
    pub fn match_key(&self) -> Option<&str> {
        derive_match_key(self.link.as_deref(), self.images.as_deref())
    }
}

/// Persisted listing carrying the engine-managed lifecycle fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default)]
    pub description: Vec<JsonValue>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<Timestamp>,
    #[serde(default)]
    pub status: ListingStatus,
    #[serde(default)]
    pub consecutive_misses: u32,
    #[serde(default)]
    pub has_duplicates: bool,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Listing {
    pub fn match_key(&self) -> Option<&str> {
        derive_match_key(self.link.as_deref(), Some(self.images.as_slice()))
    }

    /// Builds a brand-new record from a freshly scraped row. Identity and
    /// lifecycle fields supplied by the scraper are ignored.
    pub fn first_observation(
        raw: RawListing,
        id: String,
        default_platform: &str,
        now: &Timestamp,
    ) -> Self {
        Self {
            id,
            link: raw.link,
            platform: raw
                .platform
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| default_platform.to_string()),
            address: raw.address,
            price: raw.price,
            description: raw.description.unwrap_or_default(),
            images: raw.images.unwrap_or_default(),
            first_seen_at: Some(now.clone()),
            last_seen_at: Some(now.clone()),
            scraped_at: Some(now.clone()),
            status: ListingStatus::Added,
            consecutive_misses: 0,
            has_duplicates: raw.has_duplicates.unwrap_or(false),
            extra: raw.extra,
        }
    }

    /// Lifts a row read back from the persisted store. `fallback_id` is only
    /// consulted for legacy rows written without an id.
    pub fn from_persisted(
        raw: RawListing,
        default_platform: &str,
        fallback_id: impl FnOnce() -> String,
    ) -> Self {
        let status = raw.status.or(raw.legacy_status).unwrap_or_default();
        Self {
            id: raw
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(fallback_id),
            link: raw.link,
            platform: raw
                .platform
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| default_platform.to_string()),
            address: raw.address,
            price: raw.price,
            description: raw.description.unwrap_or_default(),
            images: raw.images.unwrap_or_default(),
            first_seen_at: raw.first_seen_at,
            last_seen_at: raw.last_seen_at,
            scraped_at: raw.scraped_at,
            status,
            consecutive_misses: raw.consecutive_misses.unwrap_or(0),
            has_duplicates: raw.has_duplicates.unwrap_or(false),
            extra: raw.extra,
        }
    }

    /// Copies every field present on `raw` onto this record, except `id`,
    /// `firstSeenAt` and `scrapedAt`. Lifecycle fields are left for the caller.
    pub fn overlay(&mut self, raw: RawListing) {
        if let Some(link) = raw.link {
            self.link = Some(link);
        }
        if let Some(platform) = raw.platform.filter(|p| !p.trim().is_empty()) {
            self.platform = platform;
        }
        if let Some(address) = raw.address {
            self.address = Some(address);
        }
        if let Some(price) = raw.price {
            self.price = Some(price);
        }
        if let Some(description) = raw.description {
            self.description = description;
        }
        if let Some(images) = raw.images {
            self.images = images;
        }
        if let Some(has_duplicates) = raw.has_duplicates {
            self.has_duplicates = has_duplicates;
        }
        self.extra.extend(raw.extra);
    }
}

/// Optional field reader: a value of the wrong shape reads as absent instead of
/// failing the whole row.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn derive_match_key<'a>(link: Option<&'a str>, images: Option<&'a [String]>) -> Option<&'a str> {
    non_blank(link).or_else(|| non_blank(images.and_then(|i| i.first()).map(String::as_str)))
}

/// Stable id for a keyed listing: the same platform + key always yields the same id.
pub fn keyed_listing_id(platform: &str, match_key: &str) -> String {
    let name = format!("{platform}:{match_key}");
    format!("prop_{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).simple())
}

/// Id for an unkeyed listing; unique per run, reproducible for identical inputs.
pub fn unkeyed_listing_id(platform: &str, seen_at: &Timestamp, index: usize, fingerprint: &str) -> String {
    let name = format!("{platform}:{}:{index}:{fingerprint}", seen_at.as_str());
    format!("prop_{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).simple())
}
