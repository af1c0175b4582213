use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::PlacesCache;
use crate::config::{AppConfig, PlacesApiMode};
use crate::entity::compare_names;
use crate::errors::{AppError, AppResult, ProviderStatus, SearchError};
use crate::retry::RetryPolicy;

pub const FOOD_TYPES: &[&str] = &["restaurant", "cafe", "bar", "bakery", "meal_takeaway"];
const MAX_RADIUS_METERS: u32 = 50_000;
const MAX_RESULT_COUNT: u8 = 20;
const MODERN_FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.location,places.types,places.rating,places.userRatingCount,places.priceLevel,places.regularOpeningHours,places.websiteUri,places.nationalPhoneNumber,places.reviews";
const USER_AGENT: &str = "restaurant-curator/0.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::Validation(format!(
                "latitude {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "longitude {} outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Provider order, which is distance-ranked for nearby searches.
    #[default]
    Distance,
    Rating,
    ReviewCount,
    Name,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Distance => "distance",
            SortOrder::Rating => "rating",
            SortOrder::ReviewCount => "review_count",
            SortOrder::Name => "name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilters {
    /// Search radius in meters.
    pub radius: u32,
    /// Exact price level (0-4); `None` accepts any.
    pub price_range: Option<u8>,
    pub min_rating: f64,
    pub cuisine: Option<String>,
    pub sort_by: SortOrder,
    pub food_only: bool,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            radius: 1_000,
            price_range: None,
            min_rating: 0.0,
            cuisine: None,
            sort_by: SortOrder::Distance,
            food_only: true,
        }
    }
}

impl SearchFilters {
    pub fn validate(&self) -> AppResult<()> {
        if self.radius == 0 || self.radius > MAX_RADIUS_METERS {
            return Err(AppError::Validation(format!(
                "radius {} outside 1..={MAX_RADIUS_METERS}",
                self.radius
            )));
        }
        if !self.min_rating.is_finite() || !(0.0..=5.0).contains(&self.min_rating) {
            return Err(AppError::Validation(format!(
                "minimum rating {} outside 0..=5",
                self.min_rating
            )));
        }
        if let Some(level) = self.price_range {
            if level > 4 {
                return Err(AppError::Validation(format!(
                    "price level {level} outside 0..=4"
                )));
            }
        }
        Ok(())
    }

    pub fn nearby_request(&self, location: LatLng) -> NearbyRequest {
        let included_types = if self.food_only {
            FOOD_TYPES.iter().map(|t| t.to_string()).collect()
        } else {
            Vec::new()
        };
        NearbyRequest {
            latitude: location.lat,
            longitude: location.lng,
            radius: self.radius,
            included_types,
        }
    }

    /// Deterministic key over the rounded location and every filter field.
    pub fn cache_key(&self, location: LatLng) -> String {
        let canonical = format!(
            "{:.4}|{:.4}|{}|{}|{}|{}|{}|{}",
            location.lat,
            location.lng,
            self.radius,
            self.price_range
                .map(|level| level.to_string())
                .unwrap_or_else(|| "any".into()),
            self.min_rating,
            self.cuisine_tag().unwrap_or_default(),
            self.sort_by.as_str(),
            self.food_only,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        format!("nearby:{}", URL_SAFE_NO_PAD.encode(digest))
    }

    pub fn accepts(&self, place: &Place) -> bool {
        if self.min_rating > 0.0 && !place.rating.is_some_and(|r| r >= self.min_rating) {
            return false;
        }
        if let Some(level) = self.price_range {
            if place.price_level != Some(level) {
                return false;
            }
        }
        if let Some(cuisine) = self.cuisine_tag() {
            let suffixed = format!("{cuisine}_restaurant");
            if !place
                .types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&cuisine) || t.eq_ignore_ascii_case(&suffixed))
            {
                return false;
            }
        }
        true
    }

    fn cuisine_tag(&self) -> Option<String> {
        self.cuisine
            .as_deref()
            .map(|c| c.trim().to_lowercase().replace(' ', "_"))
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: u32,
    pub included_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub id: String,
    pub name: String,
    pub location: LatLng,
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    pub rating: Option<f64>,
    pub user_rating_count: Option<u32>,
    pub price_level: Option<u8>,
    pub opening_hours: Option<Vec<String>>,
    pub website_uri: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub review_snippets: Vec<String>,
}

impl Place {
    pub fn new(id: impl Into<String>, name: impl Into<String>, location: LatLng) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location,
            formatted_address: None,
            types: Vec::new(),
            rating: None,
            user_rating_count: None,
            price_level: None,
            opening_hours: None,
            website_uri: None,
            phone: None,
            review_snippets: Vec::new(),
        }
    }
}

/// Applies client-side filters and the requested order.
pub fn refine(mut places: Vec<Place>, filters: &SearchFilters) -> Vec<Place> {
    places.retain(|place| filters.accepts(place));
    match filters.sort_by {
        SortOrder::Distance => {}
        SortOrder::Rating => places.sort_by(|a, b| {
            b.rating
                .unwrap_or(-1.0)
                .total_cmp(&a.rating.unwrap_or(-1.0))
        }),
        SortOrder::ReviewCount => places.sort_by(|a, b| {
            b.user_rating_count
                .unwrap_or(0)
                .cmp(&a.user_rating_count.unwrap_or(0))
        }),
        SortOrder::Name => places.sort_by(|a, b| compare_names(&a.name, &b.name)),
    }
    places
}

#[async_trait]
pub trait PlaceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search_nearby(&self, request: &NearbyRequest) -> Result<Vec<Place>, SearchError>;
}

/// Picks the provider implementation for the configured API generation.
pub fn build_provider(
    config: &AppConfig,
    mode: PlacesApiMode,
    api_key: SecretString,
) -> AppResult<Arc<dyn PlaceProvider>> {
    let timeout = config.request_timeout();
    let provider: Arc<dyn PlaceProvider> = match mode {
        PlacesApiMode::Modern => Arc::new(ModernPlacesProvider::new(
            &config.places_api_base,
            api_key,
            timeout,
        )?),
        PlacesApiMode::Legacy => Arc::new(LegacyPlacesProvider::new(
            &config.places_legacy_api_base,
            api_key,
            timeout,
        )?),
    };
    info!(
        target: "places_search",
        provider = provider.name(),
        "places provider selected"
    );
    Ok(provider)
}

fn http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

pub struct LegacyPlacesProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl LegacyPlacesProvider {
    pub const NAME: &'static str = "places_legacy";

    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PlaceProvider for LegacyPlacesProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn search_nearby(&self, request: &NearbyRequest) -> Result<Vec<Place>, SearchError> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<LegacyPlace>,
            error_message: Option<String>,
        }

        let mut query = vec![
            (
                "location",
                format!("{},{}", request.latitude, request.longitude),
            ),
            ("radius", request.radius.to_string()),
            ("key", self.api_key.expose_secret().to_string()),
        ];
        // The legacy endpoint accepts a single type.
        if let Some(place_type) = request.included_types.first() {
            query.push(("type", place_type.clone()));
        }

        let response = self
            .http
            .get(format!("{}/nearbysearch/json", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|err| SearchError::from_reqwest(Self::NAME, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::new(
                Self::NAME,
                ProviderStatus::from_http(status.as_u16()),
                format!("nearby search returned {status}"),
            ));
        }

        let body: Response = response
            .json()
            .await
            .map_err(|err| SearchError::from_reqwest(Self::NAME, err))?;
        let message = body.error_message.unwrap_or_default();
        let provider_status = match body.status.as_str() {
            "OK" => {
                return Ok(body
                    .results
                    .into_iter()
                    .filter_map(LegacyPlace::into_place)
                    .collect())
            }
            "ZERO_RESULTS" => return Ok(Vec::new()),
            "REQUEST_DENIED" => ProviderStatus::RequestDenied,
            "OVER_QUERY_LIMIT" => ProviderStatus::OverQueryLimit,
            "INVALID_REQUEST" => ProviderStatus::InvalidRequest,
            other => ProviderStatus::Unknown(other.to_string()),
        };
        Err(SearchError::new(Self::NAME, provider_status, message))
    }
}

#[derive(Deserialize)]
struct LegacyPlace {
    place_id: Option<String>,
    name: Option<String>,
    geometry: Option<LegacyGeometry>,
    vicinity: Option<String>,
    formatted_address: Option<String>,
    #[serde(default)]
    types: Vec<String>,
    rating: Option<f64>,
    user_ratings_total: Option<u32>,
    price_level: Option<u8>,
    opening_hours: Option<LegacyOpeningHours>,
    website: Option<String>,
    formatted_phone_number: Option<String>,
}

#[derive(Deserialize)]
struct LegacyGeometry {
    location: LegacyLocation,
}

#[derive(Deserialize)]
struct LegacyLocation {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct LegacyOpeningHours {
    #[serde(default)]
    weekday_text: Vec<String>,
}

impl LegacyPlace {
    fn into_place(self) -> Option<Place> {
        let id = self.place_id.filter(|id| !id.is_empty())?;
        let location = self.geometry?.location;
        Some(Place {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            location: LatLng::new(location.lat, location.lng),
            formatted_address: self.formatted_address.or(self.vicinity),
            types: self.types,
            rating: self.rating,
            user_rating_count: self.user_ratings_total,
            price_level: self.price_level,
            opening_hours: self
                .opening_hours
                .map(|hours| hours.weekday_text)
                .filter(|text| !text.is_empty()),
            website_uri: self.website,
            phone: self.formatted_phone_number,
            review_snippets: Vec::new(),
        })
    }
}

pub struct ModernPlacesProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl ModernPlacesProvider {
    pub const NAME: &'static str = "places_v1";

    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PlaceProvider for ModernPlacesProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn search_nearby(&self, request: &NearbyRequest) -> Result<Vec<Place>, SearchError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RequestBody<'a> {
            #[serde(skip_serializing_if = "<[String]>::is_empty")]
            included_types: &'a [String],
            max_result_count: u8,
            location_restriction: LocationRestriction,
        }

        #[derive(Serialize)]
        struct LocationRestriction {
            circle: Circle,
        }

        #[derive(Serialize)]
        struct Circle {
            center: Center,
            radius: f64,
        }

        #[derive(Serialize)]
        struct Center {
            latitude: f64,
            longitude: f64,
        }

        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            places: Vec<ModernPlace>,
        }

        #[derive(Deserialize)]
        struct ErrorEnvelope {
            error: Option<ErrorBody>,
        }

        #[derive(Deserialize)]
        struct ErrorBody {
            message: Option<String>,
        }

        let body = RequestBody {
            included_types: &request.included_types,
            max_result_count: MAX_RESULT_COUNT,
            location_restriction: LocationRestriction {
                circle: Circle {
                    center: Center {
                        latitude: request.latitude,
                        longitude: request.longitude,
                    },
                    radius: f64::from(request.radius),
                },
            },
        };

        let response = self
            .http
            .post(format!("{}/places:searchNearby", self.base_url))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", MODERN_FIELD_MASK)
            .json(&body)
            .send()
            .await
            .map_err(|err| SearchError::from_reqwest(Self::NAME, err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .ok()
                .and_then(|envelope| envelope.error)
                .and_then(|error| error.message)
                .unwrap_or_else(|| format!("nearby search returned {status}"));
            return Err(SearchError::new(
                Self::NAME,
                ProviderStatus::from_http(status.as_u16()),
                message,
            ));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| SearchError::from_reqwest(Self::NAME, err))?;
        Ok(parsed
            .places
            .into_iter()
            .filter_map(ModernPlace::into_place)
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModernPlace {
    id: Option<String>,
    display_name: Option<ModernText>,
    formatted_address: Option<String>,
    location: Option<ModernLocation>,
    #[serde(default)]
    types: Vec<String>,
    rating: Option<f64>,
    user_rating_count: Option<u32>,
    price_level: Option<String>,
    regular_opening_hours: Option<ModernOpeningHours>,
    website_uri: Option<String>,
    national_phone_number: Option<String>,
    #[serde(default)]
    reviews: Vec<ModernReview>,
}

#[derive(Deserialize)]
struct ModernText {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ModernLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModernOpeningHours {
    #[serde(default)]
    weekday_descriptions: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModernReview {
    text: Option<ModernText>,
    original_text: Option<ModernText>,
}

impl ModernPlace {
    fn into_place(self) -> Option<Place> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let location = self.location?;
        Some(Place {
            name: self
                .display_name
                .and_then(|name| name.text)
                .unwrap_or_else(|| id.clone()),
            id,
            location: LatLng::new(location.latitude, location.longitude),
            formatted_address: self.formatted_address,
            types: self.types,
            rating: self.rating,
            user_rating_count: self.user_rating_count,
            price_level: self.price_level.as_deref().and_then(parse_price_level),
            opening_hours: self
                .regular_opening_hours
                .map(|hours| hours.weekday_descriptions)
                .filter(|text| !text.is_empty()),
            website_uri: self.website_uri,
            phone: self.national_phone_number,
            review_snippets: self
                .reviews
                .into_iter()
                .filter_map(|review| review.text.or(review.original_text))
                .filter_map(|text| text.text)
                .collect(),
        })
    }
}

/// Maps `PRICE_LEVEL_*` enum names onto the 0-4 scale.
pub fn parse_price_level(value: &str) -> Option<u8> {
    match value {
        "PRICE_LEVEL_FREE" => Some(0),
        "PRICE_LEVEL_INEXPENSIVE" => Some(1),
        "PRICE_LEVEL_MODERATE" => Some(2),
        "PRICE_LEVEL_EXPENSIVE" => Some(3),
        "PRICE_LEVEL_VERY_EXPENSIVE" => Some(4),
        _ => None,
    }
}

type PendingSearch = Shared<BoxFuture<'static, Result<Vec<Place>, SearchError>>>;

/// Nearby search with caching, retries, and collapsing of identical
/// concurrent requests.
pub struct PlacesSearch {
    provider: Arc<dyn PlaceProvider>,
    cache: Arc<PlacesCache<Vec<Place>>>,
    pending: Arc<Mutex<HashMap<String, PendingSearch>>>,
    retry: RetryPolicy,
}

impl PlacesSearch {
    pub fn new(
        provider: Arc<dyn PlaceProvider>,
        cache: Arc<PlacesCache<Vec<Place>>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
            retry,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn cache(&self) -> &Arc<PlacesCache<Vec<Place>>> {
        &self.cache
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn search(&self, filters: &SearchFilters, location: LatLng) -> AppResult<Vec<Place>> {
        location.validate()?;
        filters.validate()?;

        let key = filters.cache_key(location);
        if let Some(hit) = self.cache.get(&key) {
            debug!(target: "places_search", results = hit.len(), "cache hit");
            return Ok(hit);
        }

        let pending = self.pending_or_start(key, filters, location);
        pending.await.map_err(AppError::from)
    }

    /// Joins the in-flight request for `key` or starts one. The fetch runs
    /// as its own task so abandoned callers still leave a warm cache.
    fn pending_or_start(
        &self,
        key: String,
        filters: &SearchFilters,
        location: LatLng,
    ) -> PendingSearch {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(&key) {
            debug!(target: "places_search", "joining in-flight search");
            return existing.clone();
        }
        // A fetch may have completed between the cache read and taking the lock.
        if let Some(hit) = self.cache.get(&key) {
            return futures_util::future::ready(Ok(hit)).boxed().shared();
        }

        let fetch = FetchJob {
            provider: Arc::clone(&self.provider),
            cache: Arc::clone(&self.cache),
            pending: Arc::clone(&self.pending),
            retry: self.retry,
            key: key.clone(),
            request: filters.nearby_request(location),
            filters: filters.clone(),
        };
        let provider_name = self.provider.name();
        let task = tokio::spawn(fetch.run());
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(SearchError::new(
                    provider_name,
                    ProviderStatus::Unknown("TASK_FAILED".into()),
                    err.to_string(),
                )),
            }
        }
        .boxed()
        .shared();
        pending.insert(key, shared.clone());
        shared
    }
}

struct FetchJob {
    provider: Arc<dyn PlaceProvider>,
    cache: Arc<PlacesCache<Vec<Place>>>,
    pending: Arc<Mutex<HashMap<String, PendingSearch>>>,
    retry: RetryPolicy,
    key: String,
    request: NearbyRequest,
    filters: SearchFilters,
}

impl FetchJob {
    async fn run(self) -> Result<Vec<Place>, SearchError> {
        let started = Instant::now();
        let provider = &self.provider;
        let request = &self.request;
        let result = self
            .retry
            .run(provider.name(), move || provider.search_nearby(request))
            .await
            .map(|places| refine(places, &self.filters));

        match &result {
            Ok(places) => {
                self.cache.set(self.key.clone(), places.clone());
                info!(
                    target: "places_search",
                    provider = provider.name(),
                    results = places.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "nearby search completed"
                );
            }
            Err(err) => {
                warn!(
                    target: "places_search",
                    provider = provider.name(),
                    status = %err.status,
                    attempts = err.attempts,
                    suggestion = err.suggestion(),
                    "nearby search failed"
                );
            }
        }
        self.pending.lock().remove(&self.key);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cache::ManualClock;

    fn place(id: &str, name: &str, rating: Option<f64>, count: u32, price: Option<u8>) -> Place {
        let mut place = Place::new(id, name, LatLng::new(48.85, 2.35));
        place.rating = rating;
        place.user_rating_count = Some(count);
        place.price_level = price;
        place.types = vec!["restaurant".into()];
        place
    }

    struct ScriptedProvider {
        calls: AtomicU32,
        delay: Duration,
        script: Mutex<VecDeque<Result<Vec<Place>, SearchError>>>,
        fallback: Vec<Place>,
    }

    impl ScriptedProvider {
        fn new(fallback: Vec<Place>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
                script: Mutex::new(VecDeque::new()),
                fallback,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn then(self, outcome: Result<Vec<Place>, SearchError>) -> Self {
            self.script.lock().push_back(outcome);
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PlaceProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn search_nearby(&self, _request: &NearbyRequest) -> Result<Vec<Place>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn search_with(provider: Arc<ScriptedProvider>) -> PlacesSearch {
        let cache = Arc::new(PlacesCache::new(
            Duration::from_secs(300),
            Arc::new(ManualClock::new(0)),
        ));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(2),
        };
        PlacesSearch::new(provider, cache, retry)
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(LatLng::new(91.0, 0.0).validate().is_err());
        assert!(LatLng::new(0.0, -180.5).validate().is_err());
        assert!(LatLng::new(f64::NAN, 0.0).validate().is_err());
        assert!(LatLng::new(-90.0, 180.0).validate().is_ok());
    }

    #[test]
    fn cache_key_rounds_location() {
        let filters = SearchFilters::default();
        let a = filters.cache_key(LatLng::new(48.856_61, 2.352_21));
        let b = filters.cache_key(LatLng::new(48.856_64, 2.352_19));
        let c = filters.cache_key(LatLng::new(48.857_1, 2.352_2));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let sorted = SearchFilters {
            sort_by: SortOrder::Rating,
            ..SearchFilters::default()
        };
        assert_ne!(a, sorted.cache_key(LatLng::new(48.856_61, 2.352_21)));
    }

    #[test]
    fn close_rating_thresholds_get_separate_keys() {
        let location = LatLng::new(1.0, 1.0);
        let looser = SearchFilters {
            min_rating: 4.001,
            ..SearchFilters::default()
        };
        let stricter = SearchFilters {
            min_rating: 4.004,
            ..SearchFilters::default()
        };
        let mut place = Place::new("p", "Between", location);
        place.rating = Some(4.002);

        assert!(looser.accepts(&place));
        assert!(!stricter.accepts(&place));
        assert_ne!(looser.cache_key(location), stricter.cache_key(location));
    }

    #[test]
    fn refine_applies_filters_and_sort() {
        let mut sushi = place("3", "sushi bar", Some(4.8), 40, Some(3));
        sushi.types.push("sushi_restaurant".into());
        let places = vec![
            place("1", "Bistro", Some(4.2), 300, Some(2)),
            place("2", "Cafe", Some(3.1), 900, Some(1)),
            sushi,
            place("4", "Unrated", None, 0, Some(2)),
        ];

        let by_rating = refine(
            places.clone(),
            &SearchFilters {
                min_rating: 4.0,
                sort_by: SortOrder::Rating,
                ..SearchFilters::default()
            },
        );
        let ids: Vec<_> = by_rating.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);

        let moderate = refine(
            places.clone(),
            &SearchFilters {
                price_range: Some(2),
                sort_by: SortOrder::Name,
                ..SearchFilters::default()
            },
        );
        let ids: Vec<_> = moderate.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);

        let sushi_only = refine(
            places.clone(),
            &SearchFilters {
                cuisine: Some("Sushi".into()),
                ..SearchFilters::default()
            },
        );
        assert_eq!(sushi_only.len(), 1);

        let by_reviews = refine(
            places,
            &SearchFilters {
                sort_by: SortOrder::ReviewCount,
                ..SearchFilters::default()
            },
        );
        assert_eq!(by_reviews[0].id, "2");
    }

    #[tokio::test]
    async fn identical_searches_hit_cache() {
        let provider = Arc::new(ScriptedProvider::new(vec![place(
            "1",
            "Bistro",
            Some(4.5),
            10,
            Some(2),
        )]));
        let search = search_with(provider.clone());
        let filters = SearchFilters::default();

        let first = search
            .search(&filters, LatLng::new(48.856_61, 2.352_21))
            .await
            .unwrap();
        let second = search
            .search(&filters, LatLng::new(48.856_63, 2.352_22))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert_eq!(search.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrent_identical_searches_share_one_call() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![place("1", "Bistro", None, 1, None)])
                .with_delay(Duration::from_millis(30)),
        );
        let search = search_with(provider.clone());
        let filters = SearchFilters::default();
        let location = LatLng::new(10.0, 10.0);

        let (a, b) = tokio::join!(
            search.search(&filters, location),
            search.search(&filters, location)
        );
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn abandoned_search_still_warms_cache() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![place("1", "Bistro", None, 1, None)])
                .with_delay(Duration::from_millis(30)),
        );
        let search = search_with(provider.clone());
        let filters = SearchFilters::default();
        let location = LatLng::new(1.0, 1.0);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), search.search(&filters, location)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let results = search.search(&filters, location).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn retries_transient_provider_errors() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![place("1", "Bistro", None, 1, None)])
                .then(Err(SearchError::new("scripted", ProviderStatus::Http(502), "bad gateway")))
                .then(Err(SearchError::new("scripted", ProviderStatus::Network, "reset"))),
        );
        let search = search_with(provider.clone());
        let results = search
            .search(&SearchFilters::default(), LatLng::new(5.0, 5.0))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn denied_requests_fail_fast_and_are_not_cached() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()).then(Err(SearchError::new(
            "scripted",
            ProviderStatus::RequestDenied,
            "The provided API key is invalid.",
        ))));
        let search = search_with(provider.clone());
        let filters = SearchFilters::default();
        let location = LatLng::new(5.0, 5.0);

        let err = search.search(&filters, location).await.unwrap_err();
        match err {
            AppError::Search(search_err) => {
                assert_eq!(search_err.status, ProviderStatus::RequestDenied);
                assert!(!search_err.retryable);
                assert!(search_err.suggestion().contains("API key"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.calls(), 1);
        assert!(search.cache().is_empty());

        let retry = search.search(&filters, location).await.unwrap();
        assert!(retry.is_empty());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_location_never_reaches_provider() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let search = search_with(provider.clone());
        let err = search
            .search(&SearchFilters::default(), LatLng::new(120.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn parses_price_enum() {
        assert_eq!(parse_price_level("PRICE_LEVEL_MODERATE"), Some(2));
        assert_eq!(parse_price_level("PRICE_LEVEL_UNSPECIFIED"), None);
    }
}
