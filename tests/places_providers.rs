use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{self, all_of, contains, request, url_decoded};
use httptest::responders::{cycle, json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;

use restaurant_curator::{
    AppError, LatLng, LegacyPlacesProvider, ModernPlacesProvider, NearbyRequest, PlaceProvider,
    PlacesCache, PlacesSearch, ProviderStatus, RetryPolicy, SearchFilters, SortOrder,
};

fn key() -> SecretString {
    SecretString::from("test-key".to_string())
}

fn request_at(lat: f64, lng: f64) -> NearbyRequest {
    SearchFilters::default().nearby_request(LatLng::new(lat, lng))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn legacy_provider_normalizes_results() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/maps/api/place/nearbysearch/json"),
            request::query(url_decoded(contains(("key", "test-key")))),
            request::query(url_decoded(contains(("radius", "1000")))),
            request::query(url_decoded(contains(("location", "48.8566,2.3522"))))
        ))
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [{
                "place_id": "ChIJ-legacy",
                "name": "Le Comptoir",
                "geometry": { "location": { "lat": 48.8519, "lng": 2.3389 } },
                "vicinity": "9 Carrefour de l'Odéon, Paris",
                "types": ["restaurant", "food"],
                "rating": 4.4,
                "user_ratings_total": 2100,
                "price_level": 3,
                "opening_hours": { "open_now": true, "weekday_text": ["Monday: 12:00 – 23:00"] }
            }, {
                "name": "missing id"
            }]
        }))),
    );

    let provider = LegacyPlacesProvider::new(
        &server.url("/maps/api/place").to_string(),
        key(),
        Duration::from_secs(5),
    )
    .unwrap();
    let places = provider
        .search_nearby(&request_at(48.8566, 2.3522))
        .await
        .unwrap();

    assert_eq!(places.len(), 1);
    let place = &places[0];
    assert_eq!(place.id, "ChIJ-legacy");
    assert_eq!(place.location, LatLng::new(48.8519, 2.3389));
    assert_eq!(place.formatted_address.as_deref(), Some("9 Carrefour de l'Odéon, Paris"));
    assert_eq!(place.price_level, Some(3));
    assert_eq!(place.user_rating_count, Some(2100));
    assert_eq!(place.opening_hours.as_ref().map(Vec::len), Some(1));
}

#[tokio::test]
async fn legacy_status_strings_map_to_errors() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/place/nearbysearch/json"))
            .times(2)
            .respond_with(cycle![
                json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] })),
                json_encoded(json!({
                    "status": "REQUEST_DENIED",
                    "error_message": "The provided API key is invalid."
                }))
            ]),
    );

    let provider =
        LegacyPlacesProvider::new(&server.url("/place").to_string(), key(), Duration::from_secs(5))
            .unwrap();

    let empty = provider.search_nearby(&request_at(1.0, 1.0)).await.unwrap();
    assert!(empty.is_empty());

    let err = provider
        .search_nearby(&request_at(1.0, 1.0))
        .await
        .unwrap_err();
    assert_eq!(err.status, ProviderStatus::RequestDenied);
    assert!(!err.retryable);
    assert_eq!(err.message, "The provided API key is invalid.");
}

#[tokio::test]
async fn modern_provider_sends_field_mask_and_maps_price_enum() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("POST", "/v1/places:searchNearby"),
            request::headers(contains(matchers::key("x-goog-api-key"))),
            request::headers(contains(matchers::key("x-goog-fieldmask")))
        ))
        .respond_with(json_encoded(json!({
            "places": [{
                "id": "ChIJ-modern",
                "displayName": { "text": "Septime", "languageCode": "fr" },
                "formattedAddress": "80 Rue de Charonne, 75011 Paris, France",
                "location": { "latitude": 48.8533, "longitude": 2.3810 },
                "types": ["french_restaurant", "restaurant"],
                "rating": 4.6,
                "userRatingCount": 1800,
                "priceLevel": "PRICE_LEVEL_EXPENSIVE",
                "regularOpeningHours": { "weekdayDescriptions": ["Monday: Closed"] },
                "websiteUri": "https://www.septime-charonne.fr",
                "nationalPhoneNumber": "01 43 67 38 29",
                "reviews": [{ "text": { "text": "Seasonal tasting menu, attentive staff." } }]
            }]
        }))),
    );

    let provider =
        ModernPlacesProvider::new(&server.url("/v1").to_string(), key(), Duration::from_secs(5))
            .unwrap();
    let places = provider
        .search_nearby(&request_at(48.85, 2.38))
        .await
        .unwrap();

    let place = &places[0];
    assert_eq!(place.name, "Septime");
    assert_eq!(place.price_level, Some(3));
    assert_eq!(place.rating, Some(4.6));
    assert_eq!(place.phone.as_deref(), Some("01 43 67 38 29"));
    assert_eq!(place.review_snippets.len(), 1);
}

#[tokio::test]
async fn modern_provider_reports_denied_key() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/places:searchNearby"))
            .respond_with(status_code(403).body(
                json!({
                    "error": {
                        "code": 403,
                        "message": "API key not valid. Please pass a valid API key.",
                        "status": "PERMISSION_DENIED"
                    }
                })
                .to_string(),
            )),
    );

    let provider =
        ModernPlacesProvider::new(&server.url("/v1").to_string(), key(), Duration::from_secs(5))
            .unwrap();
    let err = provider
        .search_nearby(&request_at(0.0, 0.0))
        .await
        .unwrap_err();
    assert_eq!(err.status, ProviderStatus::RequestDenied);
    assert!(err.message.starts_with("API key not valid"));
}

#[tokio::test]
async fn search_retries_server_errors_then_caches() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/places:searchNearby"))
            .times(2)
            .respond_with(cycle![
                status_code(503),
                json_encoded(json!({
                    "places": [
                        {
                            "id": "b",
                            "displayName": { "text": "Bravo" },
                            "location": { "latitude": 1.0, "longitude": 1.0 },
                            "rating": 4.1,
                            "types": ["restaurant"]
                        },
                        {
                            "id": "a",
                            "displayName": { "text": "Alpha" },
                            "location": { "latitude": 1.0, "longitude": 1.0 },
                            "rating": 4.8,
                            "types": ["restaurant"]
                        },
                        {
                            "id": "c",
                            "displayName": { "text": "Charlie" },
                            "location": { "latitude": 1.0, "longitude": 1.0 },
                            "rating": 3.2,
                            "types": ["restaurant"]
                        }
                    ]
                }))
            ]),
    );

    let provider: Arc<dyn PlaceProvider> = Arc::new(
        ModernPlacesProvider::new(&server.url("/v1").to_string(), key(), Duration::from_secs(5))
            .unwrap(),
    );
    let cache = Arc::new(PlacesCache::with_system_clock(Duration::from_secs(60)));
    let search = PlacesSearch::new(provider, cache, fast_retry());
    let filters = SearchFilters {
        min_rating: 4.0,
        sort_by: SortOrder::Rating,
        ..SearchFilters::default()
    };

    let first = search
        .search(&filters, LatLng::new(1.000_01, 1.000_01))
        .await
        .unwrap();
    let names: Vec<_> = first.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "Bravo"]);

    let second = search
        .search(&filters, LatLng::new(1.000_02, 1.000_02))
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn search_surfaces_rate_limit_after_retries() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/places:searchNearby"))
            .times(3)
            .respond_with(status_code(429)),
    );

    let provider: Arc<dyn PlaceProvider> = Arc::new(
        ModernPlacesProvider::new(&server.url("/v1").to_string(), key(), Duration::from_secs(5))
            .unwrap(),
    );
    let cache = Arc::new(PlacesCache::with_system_clock(Duration::from_secs(60)));
    let search = PlacesSearch::new(provider, cache.clone(), fast_retry());

    let err = search
        .search(&SearchFilters::default(), LatLng::new(2.0, 2.0))
        .await
        .unwrap_err();
    match err {
        AppError::Search(err) => {
            assert_eq!(err.status, ProviderStatus::OverQueryLimit);
            assert_eq!(err.attempts, 3);
            assert!(err.suggestion().contains("rate limited"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(cache.is_empty());
}
