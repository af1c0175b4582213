use httptest::matchers::request;
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use restaurant_curator::{
    AppConfig, AppError, CurationServices, ImportOutcome, LatLng, MichelinQuery, Place,
    PlacesApiMode, SearchPanel, SecretVault, UpdateSearchFiltersPayload, GOOGLE_PLACES_KEY_ALIAS,
};

fn config_for(server: &Server) -> AppConfig {
    AppConfig {
        places_api_mode: PlacesApiMode::Modern,
        places_api_base: server.url("/v1").to_string(),
        michelin_api_base: server.url("/michelin").to_string(),
        search_backoff_ms: 5,
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn search_import_and_list_round_trip() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/places:searchNearby"))
            .times(1)
            .respond_with(json_encoded(json!({
                "places": [{
                    "id": "ChIJ-paris",
                    "displayName": { "text": "Le Baratin" },
                    "formattedAddress": "3 Rue Jouye-Rouve, Paris, France",
                    "location": { "latitude": 48.8720, "longitude": 2.3810 },
                    "types": ["french_restaurant", "restaurant"],
                    "rating": 4.5,
                    "priceLevel": "PRICE_LEVEL_MODERATE"
                }]
            }))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/michelin/restaurants"))
            .respond_with(json_encoded(json!([{
                "id": "m-1",
                "name": "Paul Bocuse",
                "location": "Lyon",
                "country": "FR",
                "price": "€€€€",
                "distinction": "3 Stars"
            }]))),
    );

    let dir = tempdir().unwrap();
    let vault = SecretVault::in_memory();
    vault
        .write_secret(
            GOOGLE_PLACES_KEY_ALIAS,
            &SecretString::from("vault-key".to_string()),
        )
        .unwrap();
    let services = CurationServices::with_parts(dir.path(), config_for(&server), vault).unwrap();

    let health = services.health();
    assert_eq!(health.places_provider, Some("places_v1"));
    assert_eq!(health.places_key_source, Some("vault"));
    assert!(!health.database_recovered);

    let location = LatLng::new(48.8720, 2.3810);
    let places = services.search_places(location).await.unwrap();
    assert_eq!(places.len(), 1);
    // Served from the cache; the server only allows one request.
    let again = services.search_places(location).await.unwrap();
    assert_eq!(places, again);

    let outcome = services
        .import_place(Some("curator-1"), &places[0], Some("Natural wine and a tiny menu."))
        .await
        .unwrap();
    assert!(matches!(outcome, ImportOutcome::Imported { .. }));

    services.set_curator("curator-2").unwrap();
    let report = services
        .import_from_michelin(None, &MichelinQuery::default())
        .await
        .unwrap();
    assert_eq!(report.imported, 1);

    let list = services.entity_list("", None).unwrap();
    let cities: Vec<_> = list.groups.iter().map(|g| g.city.as_str()).collect();
    assert_eq!(cities, vec!["Lyon", "Paris"]);
    assert_eq!(list.total, 2);

    services.shutdown();
}

#[tokio::test]
async fn missing_places_key_disables_search() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    let services =
        CurationServices::with_parts(dir.path(), config_for(&server), SecretVault::in_memory())
            .unwrap();

    assert_eq!(services.health().places_provider, None);
    let err = services
        .search_places(LatLng::new(1.0, 1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Config(_)));

    let panel = services.search_panel(LatLng::new(1.0, 1.0)).await;
    assert!(matches!(panel, Some(SearchPanel::Failed { .. })));
    services.shutdown();
}

#[tokio::test]
async fn filters_and_curator_persist_across_restarts() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    let services =
        CurationServices::with_parts(dir.path(), config_for(&server), SecretVault::in_memory())
            .unwrap();

    let payload: UpdateSearchFiltersPayload =
        serde_json::from_str(r#"{"radius": 2500, "cuisine": "Thai", "priceRange": 2}"#).unwrap();
    let updated = services.update_search_filters(&payload).unwrap();
    assert_eq!(updated.filters.radius, 2_500);

    let place = Place::new("ChIJ-x", "Nameless Curator", LatLng::new(1.0, 1.0));
    let err = services.import_place(None, &place, None).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(services.set_curator("   ").is_err());
    services.set_curator("curator-7").unwrap();
    services.shutdown();
    drop(services);

    let reopened =
        CurationServices::with_parts(dir.path(), config_for(&server), SecretVault::in_memory())
            .unwrap();
    let settings = reopened.settings();
    assert_eq!(settings.filters.cuisine.as_deref(), Some("Thai"));
    assert_eq!(settings.filters.price_range, Some(2));
    assert_eq!(settings.curator_id.as_deref(), Some("curator-7"));

    let outcome = reopened.import_place(None, &place, None).await.unwrap();
    assert!(matches!(outcome, ImportOutcome::Imported { .. }));
    reopened.shutdown();
}
