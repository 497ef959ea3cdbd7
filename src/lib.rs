mod address;
mod cache;
mod config;
mod coordinates;
mod db;
mod distance;
mod enrich;
mod errors;
mod geocoder;
mod provider;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::address::{
    cache_key, normalize, AddressQuery, CacheKey, CacheNamespace, CanonicalAddress,
    DEFAULT_COUNTRY,
};
pub use crate::cache::{CacheStore, MemoryCacheStore, SqliteCacheStore, CACHE_TTL_SECONDS};
pub use crate::config::{AppConfig, PublicAppConfig, DEFAULT_GEOCODING_ENDPOINT};
pub use crate::coordinates::Coordinates;
pub use crate::db::{bootstrap, open_in_memory, DatabaseContext};
pub use crate::distance::{
    build_radius_predicate, distance_km, register_math_functions, spherical_distance_km,
    within_radius, Locatable, RadiusPredicate, SqlDialect, EARTH_RADIUS_KM,
};
pub use crate::enrich::{BatchEnricher, EnrichmentProgress, EnrichmentStats, EnrichmentTarget};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoder::{GeocodingClient, Resolution, ResolutionSource};
pub use crate::provider::{
    AddressComponent, ApiEnvelope, ApiGeometry, ApiLocation, ApiResult, GeocodingProvider,
    HttpGeocodingProvider, ProviderQuery, ProviderStatus,
};

pub use tokio_util::sync::CancellationToken;

/// Geocoder wired to the durable SQLite cache in `data_dir`.
pub struct GeoServices {
    config: AppConfig,
    cache: SqliteCacheStore,
    geocoder: GeocodingClient,
    cache_path: PathBuf,
}

impl GeoServices {
    pub fn initialize(data_dir: &Path, config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } = bootstrap(data_dir, &config.cache_file_name)?;
        let cache = SqliteCacheStore::new(Arc::new(Mutex::new(connection)));
        let geocoder = GeocodingClient::new(&config, Arc::new(cache.clone()))?;

        info!(
            target: "geocoding",
            cache = %path.display(),
            max_retries = config.max_retries,
            has_key = config.google_geocoding_api_key.is_some(),
            "geocoding services initialized"
        );
        Ok(Self {
            config,
            cache,
            geocoder,
            cache_path: path,
        })
    }

    pub fn geocoder(&self) -> &GeocodingClient {
        &self.geocoder
    }

    pub fn cache(&self) -> &SqliteCacheStore {
        &self.cache
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Enricher working on `db` with this service's geocoder and batch limit.
    pub fn enricher(&self, db: Arc<Mutex<rusqlite::Connection>>) -> BatchEnricher {
        BatchEnricher::new(db, self.geocoder.clone(), self.config.batch_limit)
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,geocoding=debug,geocode_cache=debug,enrichment=debug")
        });
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
