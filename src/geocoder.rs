use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{cache_key, normalize, AddressQuery, CacheKey, CacheNamespace};
use crate::cache::{CacheStore, CACHE_TTL_SECONDS};
use crate::config::AppConfig;
use crate::coordinates::Coordinates;
use crate::errors::{AppError, AppResult};
use crate::provider::{
    ApiEnvelope, GeocodingProvider, HttpGeocodingProvider, ProviderQuery, ProviderStatus,
};

const DEFAULT_CACHE_TAG: &str = "geocoding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    Provider,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found {
        coordinates: Coordinates,
        source: ResolutionSource,
    },
    /// Blank query, zero results, or a result without geometry.
    Empty,
    /// The provider was still throttling after the retry budget ran out.
    RateLimited { attempts: u32 },
}

impl Resolution {
    pub fn coordinates(&self) -> Option<&Coordinates> {
        match self {
            Resolution::Found { coordinates, .. } => Some(coordinates),
            _ => None,
        }
    }

    pub fn into_coordinates(self) -> Option<Coordinates> {
        match self {
            Resolution::Found { coordinates, .. } => Some(coordinates),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Resolution::Empty)
    }
}

struct FetchedEnvelope {
    envelope: ApiEnvelope,
    attempts: u32,
}

/// Cache-first geocoder. Holds configuration only; every resolved position
/// lives in the injected [`CacheStore`].
#[derive(Clone)]
pub struct GeocodingClient {
    provider: Arc<dyn GeocodingProvider>,
    cache: Arc<dyn CacheStore>,
    max_retries: u32,
    cache_tags: Vec<String>,
}

impl GeocodingClient {
    pub fn new(config: &AppConfig, cache: Arc<dyn CacheStore>) -> AppResult<Self> {
        let provider = HttpGeocodingProvider::new(config)?;
        Ok(Self::with_provider(
            Arc::new(provider),
            cache,
            config.max_retries,
        ))
    }

    pub fn with_provider(
        provider: Arc<dyn GeocodingProvider>,
        cache: Arc<dyn CacheStore>,
        max_retries: u32,
    ) -> Self {
        Self {
            provider,
            cache,
            max_retries,
            cache_tags: vec![DEFAULT_CACHE_TAG.to_string()],
        }
    }

    pub fn with_cache_tags(mut self, tags: Vec<String>) -> Self {
        self.cache_tags = tags;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn resolve_address(&self, query: &AddressQuery) -> AppResult<Resolution> {
        self.resolve_address_with_cancel(query, &CancellationToken::new())
            .await
    }

    pub async fn resolve_address_with_cancel(
        &self,
        query: &AddressQuery,
        cancel: &CancellationToken,
    ) -> AppResult<Resolution> {
        let Some(canonical) = normalize(query) else {
            debug!(target: "geocoding", "blank address query; nothing to resolve");
            return Ok(Resolution::Empty);
        };
        let key = cache_key(CacheNamespace::Address, &canonical);
        self.resolve(key, ProviderQuery::Address(canonical), cancel)
            .await
    }

    pub async fn resolve_by_place_id(&self, place_id: &str) -> AppResult<Resolution> {
        self.resolve_by_place_id_with_cancel(place_id, &CancellationToken::new())
            .await
    }

    pub async fn resolve_by_place_id_with_cancel(
        &self,
        place_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Resolution> {
        if place_id.trim().is_empty() {
            return Ok(Resolution::Empty);
        }
        let key = CacheKey::for_place_id(place_id);
        self.resolve(key, ProviderQuery::PlaceId(place_id.to_string()), cancel)
            .await
    }

    async fn resolve(
        &self,
        key: CacheKey,
        query: ProviderQuery,
        cancel: &CancellationToken,
    ) -> AppResult<Resolution> {
        if self.cache.has(&key)? {
            if let Some(coordinates) = self.cache.get(&key)? {
                debug!(target: "geocoding", key = %key, "cache hit");
                return Ok(Resolution::Found {
                    coordinates,
                    source: ResolutionSource::Cache,
                });
            }
        }

        let FetchedEnvelope { envelope, attempts } =
            self.fetch_from_provider(&query, cancel).await?;

        if envelope.status() == ProviderStatus::OverQueryLimit {
            warn!(
                target: "geocoding",
                key = %key,
                attempts,
                "provider still rate limited after exhausting retries"
            );
            return Ok(Resolution::RateLimited { attempts });
        }

        if envelope.status() != ProviderStatus::Ok {
            debug!(
                target: "geocoding",
                key = %key,
                status = %envelope.status,
                "provider found nothing for query"
            );
            return Ok(Resolution::Empty);
        }

        let include_long_name = matches!(query, ProviderQuery::PlaceId(_));
        let Some(coordinates) = envelope.first_coordinates(include_long_name) else {
            debug!(
                target: "geocoding",
                key = %key,
                status = %envelope.status,
                "provider returned no usable geometry"
            );
            return Ok(Resolution::Empty);
        };

        self.cache
            .set(&key, &coordinates, &self.cache_tags, CACHE_TTL_SECONDS)?;
        debug!(
            target: "geocoding",
            key = %key,
            latitude = coordinates.latitude,
            longitude = coordinates.longitude,
            "resolved and cached"
        );
        Ok(Resolution::Found {
            coordinates,
            source: ResolutionSource::Provider,
        })
    }

    /// Immediately re-issues the identical request while the provider reports
    /// `OVER_QUERY_LIMIT` and budget remains. Transport failures are not
    /// retried.
    async fn fetch_from_provider(
        &self,
        query: &ProviderQuery,
        cancel: &CancellationToken,
    ) -> AppResult<FetchedEnvelope> {
        let mut remaining = self.max_retries;
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            attempts += 1;
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                result = self.provider.request(query) => result?,
            };

            match envelope.status() {
                ProviderStatus::OverQueryLimit if remaining > 0 => {
                    remaining -= 1;
                    warn!(
                        target: "geocoding",
                        attempt = attempts,
                        remaining,
                        "provider rate limited; retrying"
                    );
                }
                ProviderStatus::Other(status) => {
                    return Err(AppError::Upstream {
                        status,
                        message: envelope.error_message.unwrap_or_default(),
                    });
                }
                _ => return Ok(FetchedEnvelope { envelope, attempts }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::cache::MemoryCacheStore;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<AppResult<ApiEnvelope>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<ProviderQuery>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<AppResult<ApiEnvelope>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodingProvider for ScriptedProvider {
        async fn request(&self, query: &ProviderQuery) -> AppResult<ApiEnvelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(query.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(envelope(json!({ "status": "ZERO_RESULTS" }))))
        }
    }

    /// Never answers; only cancellation gets a caller out.
    struct HangingProvider;

    #[async_trait]
    impl GeocodingProvider for HangingProvider {
        async fn request(&self, _query: &ProviderQuery) -> AppResult<ApiEnvelope> {
            std::future::pending().await
        }
    }

    fn envelope(value: serde_json::Value) -> ApiEnvelope {
        serde_json::from_value(value).unwrap()
    }

    fn found(lat: f64, lng: f64) -> AppResult<ApiEnvelope> {
        Ok(envelope(json!({
            "status": "OK",
            "results": [{
                "geometry": { "location": { "lat": lat, "lng": lng } },
                "address_components": [{ "long_name": "Mitte" }]
            }]
        })))
    }

    fn over_limit() -> AppResult<ApiEnvelope> {
        Ok(envelope(json!({ "status": "OVER_QUERY_LIMIT", "results": [] })))
    }

    fn berlin() -> AddressQuery {
        AddressQuery::new("Unter den Linden 1", "10117", "Berlin")
    }

    fn berlin_key() -> CacheKey {
        let key = cache_key(
            CacheNamespace::Address,
            &"Unter den Linden 1,10117 Berlin,Germany".into(),
        );
        assert_eq!(key.as_str(), "geocode-unter-den-linden-110117-berlingermany");
        key
    }

    fn client(
        provider: Arc<ScriptedProvider>,
        max_retries: u32,
    ) -> (GeocodingClient, MemoryCacheStore) {
        let cache = MemoryCacheStore::new();
        let client = GeocodingClient::with_provider(provider, Arc::new(cache.clone()), max_retries);
        (client, cache)
    }

    #[tokio::test]
    async fn blank_query_touches_neither_cache_nor_provider() {
        let provider = ScriptedProvider::new(vec![]);
        let (client, cache) = client(provider.clone(), 3);
        let query = AddressQuery {
            street: Some("  ".into()),
            zip: None,
            city: Some("".into()),
            country: None,
        };

        let resolution = client.resolve_address(&query).await.unwrap();
        assert!(resolution.is_empty());
        assert_eq!(provider.calls(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn resolves_then_serves_from_cache() {
        let provider = ScriptedProvider::new(vec![found(52.517, 13.388)]);
        let (client, cache) = client(provider.clone(), 0);

        let first = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(
            first,
            Resolution::Found {
                coordinates: Coordinates::new(52.517, 13.388),
                source: ResolutionSource::Provider,
            }
        );

        let key = berlin_key();
        assert_eq!(
            cache.get(&key).unwrap(),
            Some(Coordinates::new(52.517, 13.388))
        );
        assert_eq!(
            provider.seen.lock()[0],
            ProviderQuery::Address("Unter den Linden 1,10117 Berlin,Germany".into())
        );

        let second = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(
            second,
            Resolution::Found {
                coordinates: Coordinates::new(52.517, 13.388),
                source: ResolutionSource::Cache,
            }
        );
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn cached_values_are_returned_verbatim() {
        let provider = ScriptedProvider::new(vec![]);
        let (client, cache) = client(provider.clone(), 0);
        let stored = Coordinates::new(0.0, 0.0).with_long_name("stored");
        cache
            .set(
                &berlin_key(),
                &stored,
                &[],
                CACHE_TTL_SECONDS,
            )
            .unwrap();

        let resolution = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(resolution.into_coordinates(), Some(stored));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn zero_results_status_wins_over_stray_results() {
        let provider = ScriptedProvider::new(vec![Ok(envelope(json!({
            "status": "ZERO_RESULTS",
            "results": [{ "geometry": { "location": { "lat": 1.0, "lng": 2.0 } } }]
        })))]);
        let (client, cache) = client(provider.clone(), 0);

        let resolution = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(resolution, Resolution::Empty);
        assert!(cache.is_empty());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn zero_results_are_not_cached() {
        let provider = ScriptedProvider::new(vec![
            Ok(envelope(json!({ "status": "ZERO_RESULTS", "results": [] }))),
            found(48.137, 11.575),
        ]);
        let (client, cache) = client(provider.clone(), 0);

        assert!(client.resolve_address(&berlin()).await.unwrap().is_empty());
        assert!(cache.is_empty());

        let retry = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(
            retry.coordinates(),
            Some(&Coordinates::new(48.137, 11.575))
        );
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn ok_without_geometry_is_empty() {
        let provider = ScriptedProvider::new(vec![Ok(envelope(json!({
            "status": "OK",
            "results": [{ "address_components": [] }]
        })))]);
        let (client, cache) = client(provider, 0);

        assert!(client.resolve_address(&berlin()).await.unwrap().is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn retries_rate_limit_up_to_budget() {
        let provider = ScriptedProvider::new(vec![
            over_limit(),
            over_limit(),
            found(52.517, 13.388),
        ]);
        let (client, _cache) = client(provider.clone(), 2);

        let resolution = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(
            resolution.coordinates(),
            Some(&Coordinates::new(52.517, 13.388))
        );
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn persistent_rate_limit_is_reported_distinctly() {
        let provider = ScriptedProvider::new(vec![over_limit(), over_limit(), over_limit()]);
        let (client, cache) = client(provider.clone(), 2);

        let resolution = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(resolution, Resolution::RateLimited { attempts: 3 });
        assert_eq!(provider.calls(), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn zero_budget_never_retries() {
        let provider = ScriptedProvider::new(vec![over_limit(), found(1.0, 1.0)]);
        let (client, _cache) = client(provider.clone(), 0);

        let resolution = client.resolve_address(&berlin()).await.unwrap();
        assert_eq!(resolution, Resolution::RateLimited { attempts: 1 });
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn explicit_failure_status_surfaces_as_upstream_error() {
        let provider = ScriptedProvider::new(vec![Ok(envelope(json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        })))]);
        let (client, cache) = client(provider.clone(), 5);

        let err = client.resolve_address(&berlin()).await.unwrap_err();
        match err {
            AppError::Upstream { status, message } => {
                assert_eq!(status, "REQUEST_DENIED");
                assert_eq!(message, "The provided API key is invalid.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.calls(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn transport_errors_propagate_without_retry() {
        let provider = ScriptedProvider::new(vec![
            Err(AppError::Transport(
                reqwest::Client::new().get("not a url").build().unwrap_err(),
            )),
            found(1.0, 1.0),
        ]);
        let (client, cache) = client(provider.clone(), 3);

        let err = client.resolve_address(&berlin()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(provider.calls(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn place_lookups_use_their_own_namespace() {
        let provider = ScriptedProvider::new(vec![found(52.52, 13.40)]);
        let (client, cache) = client(provider.clone(), 0);

        let resolution = client.resolve_by_place_id("ChIJAVkDPzdOqEcR").await.unwrap();
        let expected = Coordinates::new(52.52, 13.40).with_long_name("Mitte");
        assert_eq!(resolution.coordinates(), Some(&expected));
        assert_eq!(
            provider.seen.lock()[0],
            ProviderQuery::PlaceId("ChIJAVkDPzdOqEcR".into())
        );
        assert_eq!(
            cache
                .get(&CacheKey::for_place_id("ChIJAVkDPzdOqEcR"))
                .unwrap(),
            Some(expected)
        );

        client.resolve_by_place_id("ChIJAVkDPzdOqEcR").await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert!(client.resolve_by_place_id(" ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let cache = Arc::new(MemoryCacheStore::new());
        let client = GeocodingClient::with_provider(Arc::new(HangingProvider), cache, 3);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .resolve_address_with_cancel(&berlin(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_provider() {
        let provider = ScriptedProvider::new(vec![found(1.0, 1.0)]);
        let (client, _cache) = client(provider.clone(), 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .resolve_address_with_cancel(&berlin(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(provider.calls(), 0);
    }
}
