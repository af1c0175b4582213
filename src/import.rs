use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::concepts::ConceptExtractor;
use crate::entity::{Entity, EntityType};
use crate::errors::AppResult;
use crate::michelin::MichelinRestaurant;
use crate::places::Place;
use crate::store::{
    is_unique_violation, RestaurantDraft, RestaurantLocation, RestaurantSource, RestaurantStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportOutcome {
    Imported {
        restaurant_id: i64,
        concept_count: usize,
    },
    /// A restaurant with the same source id is already stored.
    Skipped { restaurant_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<ImportFailure>,
}

impl ImportReport {
    fn record(&mut self, name: &str, result: AppResult<ImportOutcome>) {
        match result {
            Ok(ImportOutcome::Imported { .. }) => self.imported += 1,
            Ok(ImportOutcome::Skipped { .. }) => self.skipped += 1,
            Err(err) => {
                warn!(target: "import", restaurant = name, error = %err, "import failed");
                self.failed += 1;
                self.failures.push(ImportFailure {
                    name: name.to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
}

/// Turns provider records into stored restaurants with concepts.
///
/// Inputs are only borrowed, so a failed import leaves the caller free to
/// retry with the same values.
pub struct RestaurantImporter {
    store: Arc<dyn RestaurantStore>,
    extractor: ConceptExtractor,
}

impl RestaurantImporter {
    pub fn new(store: Arc<dyn RestaurantStore>, extractor: ConceptExtractor) -> Self {
        Self { store, extractor }
    }

    pub fn store(&self) -> &Arc<dyn RestaurantStore> {
        &self.store
    }

    pub async fn import_michelin(
        &self,
        curator_id: &str,
        restaurant: &MichelinRestaurant,
    ) -> AppResult<ImportOutcome> {
        let server_id = restaurant.id.as_deref();
        if let Some(existing) = self.existing(RestaurantSource::Michelin, server_id)? {
            return Ok(existing);
        }

        let mut concepts = self.extractor.extract_michelin(restaurant);
        if let Some(description) = restaurant.description.as_deref() {
            concepts = self.extractor.enrich(concepts, description).await;
        }

        let mut draft = RestaurantDraft::new(
            restaurant.name.trim(),
            curator_id,
            RestaurantSource::Michelin,
        );
        draft.concepts = concepts;
        draft.server_id = server_id.map(str::to_string);
        draft.description = restaurant.description.clone();
        draft.location = match (restaurant.latitude, restaurant.longitude) {
            (Some(latitude), Some(longitude)) => Some(RestaurantLocation {
                latitude,
                longitude,
                address: restaurant.address.clone(),
            }),
            _ => None,
        };
        // Nothing is written until the draft is known to be storable.
        draft.validate()?;

        let entity = self.store_entity(
            &restaurant.name,
            EntityType::Restaurant,
            server_id.map(|id| format!("michelin:{id}")),
            michelin_entity_data(restaurant)?,
        )?;
        draft.entity_id = Some(entity.entity_id);
        self.save(&draft)
    }

    pub async fn import_michelin_page(
        &self,
        curator_id: &str,
        restaurants: &[MichelinRestaurant],
    ) -> ImportReport {
        let mut report = ImportReport::default();
        for restaurant in restaurants {
            let result = self.import_michelin(curator_id, restaurant).await;
            report.record(&restaurant.name, result);
        }
        info!(
            target: "import",
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            "michelin page imported"
        );
        report
    }

    pub async fn import_place(
        &self,
        curator_id: &str,
        place: &Place,
        transcription: Option<&str>,
    ) -> AppResult<ImportOutcome> {
        if let Some(existing) = self.existing(RestaurantSource::GooglePlaces, Some(&place.id))? {
            return Ok(existing);
        }

        let concepts = match transcription {
            Some(text) => self.extractor.extract_with_text(place, text).await,
            None => self.extractor.extract(place),
        };

        let mut draft = RestaurantDraft::new(
            place.name.trim(),
            curator_id,
            RestaurantSource::GooglePlaces,
        );
        draft.concepts = concepts;
        draft.server_id = Some(place.id.clone());
        draft.transcription = transcription.map(str::to_string);
        draft.location = Some(RestaurantLocation {
            latitude: place.location.lat,
            longitude: place.location.lng,
            address: place.formatted_address.clone(),
        });
        draft.validate()?;

        let mut data = serde_json::to_value(place)?;
        if let Value::Object(map) = &mut data {
            map.insert("google_place_id".into(), Value::String(place.id.clone()));
        }
        let entity = self.store_entity(
            &place.name,
            entity_type_for(&place.types),
            Some(place.id.clone()),
            data,
        )?;
        draft.entity_id = Some(entity.entity_id);
        self.save(&draft)
    }

    fn existing(
        &self,
        source: RestaurantSource,
        server_id: Option<&str>,
    ) -> AppResult<Option<ImportOutcome>> {
        let Some(server_id) = server_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_restaurant_by_server_id(source, server_id)?
            .map(|restaurant_id| {
                info!(
                    target: "import",
                    source = source.as_tag(),
                    server_id,
                    restaurant_id,
                    "restaurant already imported"
                );
                ImportOutcome::Skipped { restaurant_id }
            }))
    }

    /// Reuses the entity carrying `external_id` when one exists so repeated
    /// imports update a single record.
    fn store_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        external_id: Option<String>,
        data: Value,
    ) -> AppResult<Entity> {
        let existing = match external_id.as_deref() {
            Some(id) => self.store.find_entity_by_external_id(id)?,
            None => None,
        };
        let entity = match existing {
            Some(mut entity) => {
                entity.name = name.trim().to_string();
                entity.data = data;
                entity
            }
            None => {
                let entity = Entity::new(name.trim(), entity_type, data);
                match external_id {
                    Some(id) => entity.with_external_id(id),
                    None => entity,
                }
            }
        };
        self.store.upsert_entity(&entity)
    }

    fn save(&self, draft: &RestaurantDraft) -> AppResult<ImportOutcome> {
        let restaurant_id = match self.store.save_restaurant(draft) {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                // A concurrent import stored the same source id after our check.
                if let Some(existing) = self.existing(draft.source, draft.server_id.as_deref())? {
                    return Ok(existing);
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        info!(
            target: "import",
            restaurant_id,
            source = draft.source.as_tag(),
            concepts = draft.concepts.len(),
            "restaurant imported"
        );
        Ok(ImportOutcome::Imported {
            restaurant_id,
            concept_count: draft.concepts.len(),
        })
    }
}

fn michelin_entity_data(restaurant: &MichelinRestaurant) -> AppResult<Value> {
    Ok(json!({
        "source": RestaurantSource::Michelin.as_tag(),
        "location": {
            "city": restaurant.city,
            "address": restaurant.address,
            "latitude": restaurant.latitude,
            "longitude": restaurant.longitude,
        },
        "michelin": serde_json::to_value(restaurant)?,
    }))
}

fn entity_type_for(types: &[String]) -> EntityType {
    let has = |tag: &str| types.iter().any(|t| t == tag);
    if has("restaurant") || types.iter().any(|t| t.ends_with("_restaurant")) {
        EntityType::Restaurant
    } else if has("bar") || has("pub") || has("wine_bar") {
        EntityType::Bar
    } else if has("cafe") || has("coffee_shop") || has("bakery") {
        EntityType::Cafe
    } else if has("lodging") || has("hotel") {
        EntityType::Hotel
    } else {
        EntityType::Restaurant
    }
}
