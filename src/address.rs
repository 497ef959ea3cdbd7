use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_COUNTRY: &str = "Germany";
const PART_SEPARATOR: &str = ",";

/// Free-form postal address as handed in by callers. Every field is optional;
/// the country falls back to [`DEFAULT_COUNTRY`] unless cleared explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressQuery {
    pub street: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    #[serde(default = "default_country")]
    pub country: Option<String>,
}

fn default_country() -> Option<String> {
    Some(DEFAULT_COUNTRY.to_string())
}

impl Default for AddressQuery {
    fn default() -> Self {
        Self {
            street: None,
            zip: None,
            city: None,
            country: default_country(),
        }
    }
}

impl AddressQuery {
    pub fn new(
        street: impl Into<String>,
        zip: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            street: Some(street.into()),
            zip: Some(zip.into()),
            city: Some(city.into()),
            ..Self::default()
        }
    }

    pub fn with_street(mut self, street: impl Into<String>) -> Self {
        self.street = Some(street.into());
        self
    }

    pub fn with_zip(mut self, zip: impl Into<String>) -> Self {
        self.zip = Some(zip.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_country(mut self, country: Option<String>) -> Self {
        self.country = country;
        self
    }

    pub fn is_blank(&self) -> bool {
        normalize(self).is_none()
    }
}

/// Trimmed, comma-joined `street,zip city,country` form of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalAddress(String);

impl CanonicalAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CanonicalAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CanonicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    Address,
    Place,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Address => "geocode",
            CacheNamespace::Place => "geocodeplace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Place ids are provider-opaque and used verbatim.
    pub fn for_place_id(place_id: &str) -> Self {
        Self(format!("{}-{}", CacheNamespace::Place.as_str(), place_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns `None` when nothing resolvable is left after trimming.
pub fn normalize(query: &AddressQuery) -> Option<CanonicalAddress> {
    let locality = format!(
        "{} {}",
        trimmed(query.zip.as_deref()),
        trimmed(query.city.as_deref())
    );
    let parts = [
        query.street.as_deref(),
        Some(locality.as_str()),
        query.country.as_deref(),
    ];

    let joined = parts
        .into_iter()
        .map(trimmed)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(PART_SEPARATOR);

    let canonical = joined.trim_matches(|c: char| c == ',' || c.is_whitespace());
    if canonical.is_empty() {
        None
    } else {
        Some(CanonicalAddress(canonical.to_string()))
    }
}

/// Punctuation and case never reach the key, so `Main St.` and `main st`
/// share one cache entry.
pub fn cache_key(namespace: CacheNamespace, canonical: &CanonicalAddress) -> CacheKey {
    let sanitized: String = canonical
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    let body = sanitized
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-");
    CacheKey(format!("{}-{}", namespace.as_str(), body))
}

fn trimmed(value: Option<&str>) -> &str {
    value.map(str::trim).unwrap_or_default()
}
