mod cache;
mod concepts;
mod config;
mod db;
mod entity;
mod errors;
mod import;
mod michelin;
mod places;
mod retry;
mod secrets;
mod settings;
mod store;
mod view;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheEntry, Clock, ManualClock, PlacesCache, SystemClock};
pub use crate::concepts::{
    Concept, ConceptExtractor, ConceptSet, ConceptSource, HttpConceptSource,
};
pub use crate::config::{AppConfig, PlacesApiMode, PublicAppConfig};
pub use crate::db::{bootstrap, open_in_memory, DatabaseBootstrap, DatabaseContext};
pub use crate::entity::{
    dedup_key, dedupe, extract_city, sort_by_name, Entity, EntityStatus, EntityType, SyncState,
    SyncStatus, UNKNOWN_CITY,
};
pub use crate::errors::{AppError, AppResult, ExtractionDegraded, ProviderStatus, SearchError};
pub use crate::import::{ImportFailure, ImportOutcome, ImportReport, RestaurantImporter};
pub use crate::michelin::{
    MichelinClient, MichelinPage, MichelinQuery, MichelinResponse, MichelinRestaurant,
};
pub use crate::places::{
    build_provider, refine, LatLng, LegacyPlacesProvider, ModernPlacesProvider, NearbyRequest,
    Place, PlaceProvider, PlacesSearch, SearchFilters, SortOrder, FOOD_TYPES,
};
pub use crate::retry::RetryPolicy;
pub use crate::secrets::{KeySource, SecretVault, GOOGLE_PLACES_KEY_ALIAS, MICHELIN_KEY_ALIAS};
pub use crate::settings::{settings_path, UpdateSearchFiltersPayload, UserSettings};
pub use crate::store::{
    EntityFilter, RestaurantDraft, RestaurantLocation, RestaurantSource, RestaurantStore,
    SqliteStore,
};
pub use crate::view::{
    render_entity_list, CityGroup, EntityListState, EntityListView, EntityRowView,
    RelevanceGuard, SearchPanel, SearchTicket,
};

const VAULT_SERVICE_NAME: &str = "RestaurantCurator";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub config: PublicAppConfig,
    pub places_provider: Option<&'static str>,
    pub places_key_source: Option<&'static str>,
    pub cached_searches: usize,
    pub in_flight_searches: usize,
    pub database_path: Option<String>,
    pub database_recovered: bool,
}

/// Every collaborator the curation flows need, built once and passed around
/// explicitly.
pub struct CurationServices {
    config: AppConfig,
    vault: SecretVault,
    settings_path: PathBuf,
    settings: Mutex<UserSettings>,
    store: Arc<SqliteStore>,
    database_path: Option<PathBuf>,
    database_recovered: bool,
    cache: Arc<PlacesCache<Vec<Place>>>,
    places: Option<PlacesSearch>,
    places_key_source: Option<KeySource>,
    michelin: MichelinClient,
    importer: RestaurantImporter,
    relevance: RelevanceGuard,
}

impl CurationServices {
    pub fn initialize(data_dir: impl AsRef<Path>) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        let vault = SecretVault::new(VAULT_SERVICE_NAME);
        Self::with_parts(data_dir, config, vault)
    }

    pub fn with_parts(
        data_dir: impl AsRef<Path>,
        config: AppConfig,
        vault: SecretVault,
    ) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = bootstrap(data_dir, &config.database_file_name)?;
        let store = Arc::new(SqliteStore::new(connection));

        let settings_path = settings_path(data_dir);
        let settings = UserSettings::load(&settings_path, &config)?;

        let cache = Arc::new(PlacesCache::with_system_clock(config.cache_ttl()));
        cache.start_cleanup_timer(config.cache_sweep_interval());
        let retry = RetryPolicy::from_config(&config);

        let (places, places_key_source) =
            match vault.resolve(config.google_places_api_key.as_ref(), GOOGLE_PLACES_KEY_ALIAS)? {
                Some((key, source)) => {
                    let provider = build_provider(&config, settings.places_api_mode, key)?;
                    let search = PlacesSearch::new(provider, Arc::clone(&cache), retry);
                    (Some(search), Some(source))
                }
                None => {
                    warn!(
                        target: "places_search",
                        "no Google Places API key configured; place search disabled"
                    );
                    (None, None)
                }
            };

        let michelin_key = vault
            .resolve(config.michelin_api_key.as_ref(), MICHELIN_KEY_ALIAS)?
            .map(|(key, _)| key);
        let michelin = MichelinClient::new(
            &config.michelin_api_base,
            michelin_key,
            config.request_timeout(),
            retry,
        )?;

        let extractor = match config.concept_extraction_endpoint.as_deref() {
            Some(endpoint) => ConceptExtractor::with_source(Arc::new(HttpConceptSource::new(
                endpoint,
                config.request_timeout(),
            )?)),
            None => ConceptExtractor::new(),
        };
        let importer = RestaurantImporter::new(store.clone(), extractor);

        info!(
            places_provider = places.as_ref().map(|p| p.provider_name()).unwrap_or("disabled"),
            key_source = places_key_source.map(|s| s.as_str()).unwrap_or("none"),
            database_recovered = recovered,
            "curation services ready"
        );

        Ok(Self {
            config,
            vault,
            settings_path,
            settings: Mutex::new(settings),
            store,
            database_path: path,
            database_recovered: recovered,
            cache,
            places,
            places_key_source,
            michelin,
            importer,
            relevance: RelevanceGuard::new(),
        })
    }

    /// Nearby search using the saved filters.
    pub async fn search_places(&self, location: LatLng) -> AppResult<Vec<Place>> {
        let filters = self.settings.lock().filters.clone();
        self.search_places_with(&filters, location).await
    }

    pub async fn search_places_with(
        &self,
        filters: &SearchFilters,
        location: LatLng,
    ) -> AppResult<Vec<Place>> {
        let places = self.places.as_ref().ok_or_else(|| {
            AppError::Config("Google Places API key not configured; store one first".into())
        })?;
        places.search(filters, location).await
    }

    /// Runs a search and renders the panel, or `None` when a newer search
    /// or [`dismiss_search`](Self::dismiss_search) superseded this one.
    pub async fn search_panel(&self, location: LatLng) -> Option<SearchPanel> {
        let ticket = self.relevance.begin();
        let result = self.search_places(location).await;
        ticket.apply(SearchPanel::from_result(&result))
    }

    pub fn dismiss_search(&self) {
        self.relevance.invalidate();
    }

    /// Imports one Michelin page. `curator_id` falls back to the curator saved
    /// in settings.
    pub async fn import_from_michelin(
        &self,
        curator_id: Option<&str>,
        query: &MichelinQuery,
    ) -> AppResult<ImportReport> {
        let curator_id = self.curator(curator_id)?;
        let page = self.michelin.search(query).await?;
        Ok(self
            .importer
            .import_michelin_page(&curator_id, &page.restaurants)
            .await)
    }

    pub async fn import_place(
        &self,
        curator_id: Option<&str>,
        place: &Place,
        transcription: Option<&str>,
    ) -> AppResult<ImportOutcome> {
        let curator_id = self.curator(curator_id)?;
        self.importer
            .import_place(&curator_id, place, transcription)
            .await
    }

    fn curator(&self, explicit: Option<&str>) -> AppResult<String> {
        let explicit = explicit.map(str::trim).filter(|id| !id.is_empty());
        match explicit {
            Some(id) => Ok(id.to_string()),
            None => self.settings.lock().curator_id.clone().ok_or_else(|| {
                AppError::Validation("no curator given and none saved in settings".into())
            }),
        }
    }

    /// Saves the default curator used by imports that do not name one.
    pub fn set_curator(&self, curator_id: &str) -> AppResult<UserSettings> {
        let curator_id = curator_id.trim();
        if curator_id.is_empty() {
            return Err(AppError::Validation("curator id is required".into()));
        }
        let mut settings = self.settings.lock();
        settings.curator_id = Some(curator_id.to_string());
        settings.persist(&self.settings_path)?;
        Ok(settings.clone())
    }

    pub fn entity_list(&self, query: &str, city: Option<&str>) -> AppResult<EntityListView> {
        let entities = self.store.get_entities(&EntityFilter::restaurants())?;
        Ok(render_entity_list(&EntityListState {
            entities,
            query: query.to_string(),
            city: city.map(str::to_string),
        }))
    }

    pub fn settings(&self) -> UserSettings {
        self.settings.lock().clone()
    }

    pub fn update_search_filters(
        &self,
        payload: &UpdateSearchFiltersPayload,
    ) -> AppResult<UserSettings> {
        let mut settings = self.settings.lock();
        settings.apply_patch(payload);
        settings.persist(&self.settings_path)?;
        Ok(settings.clone())
    }

    /// Stores an API key in the vault. The Places provider picks it up on the
    /// next start.
    pub fn store_api_key(&self, account: &str, secret: SecretString) -> AppResult<()> {
        self.vault.write_secret(account, &secret)
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::clone(&self.store)
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            config: self.config.public_profile(),
            places_provider: self.places.as_ref().map(|p| p.provider_name()),
            places_key_source: self.places_key_source.map(|s| s.as_str()),
            cached_searches: self.cache.len(),
            in_flight_searches: self.places.as_ref().map_or(0, |p| p.in_flight()),
            database_path: self
                .database_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            database_recovered: self.database_recovered,
        }
    }

    pub fn shutdown(&self) {
        self.cache.stop_cleanup_timer();
        self.relevance.invalidate();
        info!("curation services stopped");
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,restaurant_curator=debug"));
        // A host that installed its own subscriber keeps it.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
