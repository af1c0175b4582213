use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_PLACES_API_BASE: &str = "https://places.googleapis.com/v1";
const DEFAULT_PLACES_LEGACY_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_MICHELIN_API_BASE: &str = "https://michelin-staging.restaurant-curator.app/api";
const DEFAULT_CACHE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 12;
const MAX_SEARCH_ATTEMPTS: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacesApiMode {
    Modern,
    Legacy,
}

impl PlacesApiMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "modern" | "new" | "v1" => Some(PlacesApiMode::Modern),
            "legacy" | "classic" => Some(PlacesApiMode::Legacy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlacesApiMode::Modern => "modern",
            PlacesApiMode::Legacy => "legacy",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub places_api_mode: PlacesApiMode,
    pub places_api_base: String,
    pub places_legacy_api_base: String,
    pub michelin_api_base: String,
    pub concept_extraction_endpoint: Option<String>,
    pub places_cache_ttl_secs: u64,
    pub places_cache_sweep_secs: u64,
    pub request_timeout_secs: u64,
    pub search_max_attempts: u32,
    pub search_backoff_ms: u64,
    pub google_places_api_key: Option<SecretString>,
    pub michelin_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub places_api_mode: PlacesApiMode,
    pub places_api_base: String,
    pub michelin_api_base: String,
    pub has_concept_extraction: bool,
    pub places_cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub search_max_attempts: u32,
    pub has_google_places_key: bool,
    pub has_michelin_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "restaurant-curator.db".to_string()),
            places_api_mode: env::var("PLACES_API_MODE")
                .ok()
                .and_then(|v| PlacesApiMode::parse(&v))
                .unwrap_or(PlacesApiMode::Modern),
            places_api_base: parse_url("PLACES_API_BASE", DEFAULT_PLACES_API_BASE),
            places_legacy_api_base: parse_url(
                "PLACES_LEGACY_API_BASE",
                DEFAULT_PLACES_LEGACY_API_BASE,
            ),
            michelin_api_base: parse_url("MICHELIN_API_BASE", DEFAULT_MICHELIN_API_BASE),
            concept_extraction_endpoint: env::var("CONCEPT_EXTRACTION_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            places_cache_ttl_secs: parse_u64("PLACES_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)
                .max(1),
            places_cache_sweep_secs: parse_u64(
                "PLACES_CACHE_SWEEP_SECS",
                DEFAULT_CACHE_SWEEP_SECS,
            )
            .max(1),
            request_timeout_secs: parse_u64("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)
                .max(1),
            search_max_attempts: parse_u32("SEARCH_MAX_ATTEMPTS", 3).clamp(1, MAX_SEARCH_ATTEMPTS),
            search_backoff_ms: parse_u64("SEARCH_BACKOFF_MS", 250),
            google_places_api_key: parse_secret("GOOGLE_PLACES_API_KEY"),
            michelin_api_key: parse_secret("MICHELIN_API_KEY"),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            places_api_mode: self.places_api_mode,
            places_api_base: self.places_api_base.clone(),
            michelin_api_base: self.michelin_api_base.clone(),
            has_concept_extraction: self.concept_extraction_endpoint.is_some(),
            places_cache_ttl_secs: self.places_cache_ttl_secs,
            request_timeout_secs: self.request_timeout_secs,
            search_max_attempts: self.search_max_attempts,
            has_google_places_key: self.google_places_api_key.is_some(),
            has_michelin_key: self.michelin_api_key.is_some(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.places_cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.places_cache_sweep_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file_name: "restaurant-curator.db".to_string(),
            places_api_mode: PlacesApiMode::Modern,
            places_api_base: DEFAULT_PLACES_API_BASE.to_string(),
            places_legacy_api_base: DEFAULT_PLACES_LEGACY_API_BASE.to_string(),
            michelin_api_base: DEFAULT_MICHELIN_API_BASE.to_string(),
            concept_extraction_endpoint: None,
            places_cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            places_cache_sweep_secs: DEFAULT_CACHE_SWEEP_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            search_max_attempts: 3,
            search_backoff_ms: 250,
            google_places_api_key: None,
            michelin_api_key: None,
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

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_url(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}
