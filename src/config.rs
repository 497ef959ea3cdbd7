use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_GEOCODING_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_LANGUAGE: &str = "de";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BATCH_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoding_endpoint: String,
    pub google_geocoding_api_key: Option<SecretString>,
    pub max_retries: u32,
    pub language: String,
    pub request_timeout_ms: u64,
    pub cache_file_name: String,
    pub batch_limit: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoding_endpoint: String,
    pub has_google_geocoding_key: bool,
    pub max_retries: u32,
    pub language: String,
    pub request_timeout_ms: u64,
    pub cache_file_name: String,
    pub batch_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoding_endpoint: DEFAULT_GEOCODING_ENDPOINT.to_string(),
            google_geocoding_api_key: None,
            max_retries: 0,
            language: DEFAULT_LANGUAGE.to_string(),
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            cache_file_name: "geocoding-cache.db".to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            geocoding_endpoint: env::var("GEOCODING_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.geocoding_endpoint),
            google_geocoding_api_key: env::var("GOOGLE_GEOCODING_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            max_retries: parse_u32("GEOCODING_MAX_RETRIES", defaults.max_retries),
            language: env::var("GEOCODING_LANGUAGE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.language),
            request_timeout_ms: parse_u64("GEOCODING_TIMEOUT_MS", defaults.request_timeout_ms)
                .max(1),
            cache_file_name: env::var("GEOCODING_CACHE_FILE")
                .unwrap_or(defaults.cache_file_name),
            batch_limit: parse_usize("GEOCODING_BATCH_LIMIT", defaults.batch_limit).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoding_endpoint: self.geocoding_endpoint.clone(),
            has_google_geocoding_key: self.google_geocoding_api_key.is_some(),
            max_retries: self.max_retries,
            language: self.language.clone(),
            request_timeout_ms: self.request_timeout_ms,
            cache_file_name: self.cache_file_name.clone(),
            batch_limit: self.batch_limit,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
