use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::address::CanonicalAddress;
use crate::config::AppConfig;
use crate::coordinates::Coordinates;
use crate::errors::{AppError, AppResult};

const USER_AGENT: &str = concat!("geocoding-cache/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderQuery {
    Address(CanonicalAddress),
    PlaceId(String),
}

impl ProviderQuery {
    fn parameter(&self) -> (&'static str, &str) {
        match self {
            ProviderQuery::Address(address) => ("address", address.as_str()),
            ProviderQuery::PlaceId(place_id) => ("place_id", place_id.as_str()),
        }
    }

    fn kind(&self) -> &'static str {
        self.parameter().0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Ok,
    ZeroResults,
    OverQueryLimit,
    Other(String),
}

impl ProviderStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "OK" => ProviderStatus::Ok,
            "ZERO_RESULTS" => ProviderStatus::ZeroResults,
            "OVER_QUERY_LIMIT" => ProviderStatus::OverQueryLimit,
            other => ProviderStatus::Other(other.to_string()),
        }
    }
}

/// JSON body returned by the Geocoding API. Fields the client does not read
/// are left out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub results: Vec<ApiResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResult {
    #[serde(default)]
    pub geometry: Option<ApiGeometry>,
    #[serde(default)]
    pub address_components: Vec<AddressComponent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiGeometry {
    #[serde(default)]
    pub location: Option<ApiLocation>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ApiLocation {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddressComponent {
    pub long_name: String,
}

impl ApiEnvelope {
    pub fn status(&self) -> ProviderStatus {
        ProviderStatus::parse(&self.status)
    }

    /// Coordinates of the first result only; later candidates are ignored.
    pub fn first_coordinates(&self, include_long_name: bool) -> Option<Coordinates> {
        let first = self.results.first()?;
        let location = first.geometry.as_ref()?.location?;
        let coordinates = Coordinates::new(location.lat, location.lng);
        let long_name = first
            .address_components
            .first()
            .map(|component| component.long_name.clone())
            .filter(|_| include_long_name);
        Some(match long_name {
            Some(name) => coordinates.with_long_name(name),
            None => coordinates,
        })
    }
}

#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    async fn request(&self, query: &ProviderQuery) -> AppResult<ApiEnvelope>;
}

pub struct HttpGeocodingProvider {
    http: Client,
    endpoint: Url,
    language: String,
    api_key: Option<SecretString>,
}

impl HttpGeocodingProvider {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let endpoint = Url::parse(&config.geocoding_endpoint).map_err(|err| {
            AppError::Config(format!("invalid geocoding endpoint: {err}"))
        })?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            language: config.language.clone(),
            api_key: config.google_geocoding_api_key.clone(),
        })
    }

    /// Fixed parameters already present in the configured endpoint win over
    /// the defaults.
    pub fn request_url(&self, query: &ProviderQuery) -> Url {
        let mut url = self.endpoint.clone();
        let present: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        let has = |name: &str| present.iter().any(|k| k == name);

        {
            let mut pairs = url.query_pairs_mut();
            if !has("language") {
                pairs.append_pair("language", &self.language);
            }
            if !has("sensor") {
                pairs.append_pair("sensor", "false");
            }
            let (name, value) = query.parameter();
            pairs.append_pair(name, value);
            if let Some(key) = &self.api_key {
                pairs.append_pair("key", key.expose_secret());
            }
        }
        url
    }
}

#[async_trait]
impl GeocodingProvider for HttpGeocodingProvider {
    async fn request(&self, query: &ProviderQuery) -> AppResult<ApiEnvelope> {
        debug!(
            target: "geocoding_provider",
            kind = query.kind(),
            "requesting geocoding provider"
        );
        // the URL carries the API key, keep it out of error messages
        let response = self
            .http
            .get(self.request_url(query))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| AppError::Transport(err.without_url()))?;

        let envelope = response
            .json::<ApiEnvelope>()
            .await
            .map_err(|err| AppError::Transport(err.without_url()))?;
        Ok(envelope)
    }
}
