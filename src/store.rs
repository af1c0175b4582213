use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::concepts::Concept;
use crate::db::open_in_memory;
use crate::entity::{Entity, EntityStatus, EntityType, SyncState, SyncStatus};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestaurantSource {
    Manual,
    GooglePlaces,
    Michelin,
}

impl RestaurantSource {
    pub fn as_tag(&self) -> &'static str {
        match self {
            RestaurantSource::Manual => "manual",
            RestaurantSource::GooglePlaces => "google_places",
            RestaurantSource::Michelin => "michelin",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "manual" => Ok(RestaurantSource::Manual),
            "google_places" => Ok(RestaurantSource::GooglePlaces),
            "michelin" => Ok(RestaurantSource::Michelin),
            _ => Err(AppError::Validation(format!(
                "invalid restaurant source: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestaurantLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
}

/// Everything needed to persist one curated restaurant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestaurantDraft {
    pub name: String,
    pub curator_id: String,
    pub concepts: Vec<Concept>,
    pub location: Option<RestaurantLocation>,
    pub photos: Vec<String>,
    pub transcription: Option<String>,
    pub description: Option<String>,
    pub source: RestaurantSource,
    pub server_id: Option<String>,
    pub entity_id: Option<Uuid>,
}

impl RestaurantDraft {
    pub fn new(
        name: impl Into<String>,
        curator_id: impl Into<String>,
        source: RestaurantSource,
    ) -> Self {
        Self {
            name: name.into(),
            curator_id: curator_id.into(),
            concepts: Vec::new(),
            location: None,
            photos: Vec::new(),
            transcription: None,
            description: None,
            source,
            server_id: None,
            entity_id: None,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("restaurant name is required".into()));
        }
        if self.curator_id.trim().is_empty() {
            return Err(AppError::Validation("curator id is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    pub include_deleted: bool,
}

impl EntityFilter {
    pub fn restaurants() -> Self {
        Self {
            entity_type: Some(EntityType::Restaurant),
            include_deleted: false,
        }
    }
}

/// True when a write was rejected by a uniqueness constraint, such as a second
/// restaurant with the same source and server id.
pub(crate) fn is_unique_violation(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Database(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Local persistence used by the import pipeline and the entity views.
pub trait RestaurantStore: Send + Sync {
    fn get_entities(&self, filter: &EntityFilter) -> AppResult<Vec<Entity>>;

    fn find_entity_by_external_id(&self, external_id: &str) -> AppResult<Option<Entity>>;

    /// Inserts `entity` or overwrites the stored copy, bumping its version.
    fn upsert_entity(&self, entity: &Entity) -> AppResult<Entity>;

    fn mark_entity_deleted(&self, entity_id: Uuid) -> AppResult<bool>;

    fn save_restaurant(&self, draft: &RestaurantDraft) -> AppResult<i64>;

    fn find_restaurant_by_server_id(
        &self,
        source: RestaurantSource,
        server_id: &str,
    ) -> AppResult<Option<i64>>;

    fn restaurant_concepts(&self, restaurant_id: i64) -> AppResult<Vec<Concept>>;
}

const ENTITY_COLUMNS: &str = "entity_id, name, entity_type, status, version, external_id, data, sync_status, server_id, last_synced_at, created_at, updated_at";

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(connection: Connection) -> Self {
        Self {
            db: Mutex::new(connection),
        }
    }

    pub fn in_memory() -> AppResult<Self> {
        Ok(Self::new(open_in_memory()?.connection))
    }

    pub fn restaurant_count(&self) -> AppResult<i64> {
        let conn = self.db.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM restaurants", [], |row| row.get(0))?)
    }
}

impl RestaurantStore for SqliteStore {
    fn get_entities(&self, filter: &EntityFilter) -> AppResult<Vec<Entity>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
            WHERE (?1 IS NULL OR entity_type = ?1) AND (?2 OR status = 'active')
            ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    filter.entity_type.map(|t| t.as_tag()),
                    filter.include_deleted
                ],
                EntityRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    fn find_entity_by_external_id(&self, external_id: &str) -> AppResult<Option<Entity>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE external_id = ?1
            ORDER BY updated_at DESC LIMIT 1"
        );
        conn.query_row(&sql, [external_id], EntityRow::from_row)
            .optional()?
            .map(EntityRow::into_entity)
            .transpose()
    }

    fn upsert_entity(&self, entity: &Entity) -> AppResult<Entity> {
        if entity.name.trim().is_empty() {
            return Err(AppError::Validation("entity name is required".into()));
        }
        let conn = self.db.lock();
        let id = entity.entity_id.to_string();
        let existing_version: Option<i64> = conn
            .query_row(
                "SELECT version FROM entities WHERE entity_id = ?1",
                [&id],
                |row| row.get(0),
            )
            .optional()?;

        let mut stored = entity.clone();
        match existing_version {
            Some(version) => {
                stored.version = version + 1;
                stored.updated_at = Utc::now();
                conn.execute(
                    "UPDATE entities SET name = ?2, entity_type = ?3, status = ?4, version = ?5,
                    external_id = ?6, data = ?7, sync_status = ?8, server_id = ?9,
                    last_synced_at = ?10, updated_at = ?11
                    WHERE entity_id = ?1",
                    params![
                        id,
                        stored.name,
                        stored.entity_type.as_tag(),
                        stored.status.as_tag(),
                        stored.version,
                        stored.external_id,
                        stored.data,
                        stored.sync.status.as_tag(),
                        stored.sync.server_id,
                        stored.sync.last_synced_at,
                        stored.updated_at,
                    ],
                )?;
            }
            None => {
                stored.version = stored.version.max(1);
                conn.execute(
                    &format!(
                        "INSERT INTO entities ({ENTITY_COLUMNS})
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    params![
                        id,
                        stored.name,
                        stored.entity_type.as_tag(),
                        stored.status.as_tag(),
                        stored.version,
                        stored.external_id,
                        stored.data,
                        stored.sync.status.as_tag(),
                        stored.sync.server_id,
                        stored.sync.last_synced_at,
                        stored.created_at,
                        stored.updated_at,
                    ],
                )?;
            }
        }
        debug!(
            target: "import",
            entity_id = %stored.entity_id,
            version = stored.version,
            "entity stored"
        );
        Ok(stored)
    }

    fn mark_entity_deleted(&self, entity_id: Uuid) -> AppResult<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE entities SET status = 'deleted', version = version + 1, updated_at = ?2
            WHERE entity_id = ?1 AND status != 'deleted'",
            params![entity_id.to_string(), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    fn save_restaurant(&self, draft: &RestaurantDraft) -> AppResult<i64> {
        draft.validate()?;
        let photos = serde_json::to_string(&draft.photos)?;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO restaurants (name, curator_id, source, server_id, description,
            transcription, latitude, longitude, address, photos, entity_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                draft.name.trim(),
                draft.curator_id,
                draft.source.as_tag(),
                draft.server_id,
                draft.description,
                draft.transcription,
                draft.location.as_ref().map(|l| l.latitude),
                draft.location.as_ref().map(|l| l.longitude),
                draft.location.as_ref().and_then(|l| l.address.clone()),
                photos,
                draft.entity_id.map(|id| id.to_string()),
            ],
        )?;
        let restaurant_id = tx.last_insert_rowid();
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO restaurant_concepts (restaurant_id, category, value)
                VALUES (?1, ?2, ?3)",
            )?;
            for concept in &draft.concepts {
                insert.execute(params![restaurant_id, concept.category, concept.value])?;
            }
        }
        tx.commit()?;
        Ok(restaurant_id)
    }

    fn find_restaurant_by_server_id(
        &self,
        source: RestaurantSource,
        server_id: &str,
    ) -> AppResult<Option<i64>> {
        let conn = self.db.lock();
        Ok(conn
            .query_row(
                "SELECT id FROM restaurants WHERE source = ?1 AND server_id = ?2",
                params![source.as_tag(), server_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn restaurant_concepts(&self, restaurant_id: i64) -> AppResult<Vec<Concept>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT category, value FROM restaurant_concepts
            WHERE restaurant_id = ?1 ORDER BY rowid ASC",
        )?;
        let concepts = stmt
            .query_map([restaurant_id], |row| {
                Ok(Concept::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(concepts)
    }
}

struct EntityRow {
    entity_id: String,
    name: String,
    entity_type: String,
    status: String,
    version: i64,
    external_id: Option<String>,
    data: Value,
    sync_status: String,
    server_id: Option<String>,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            name: row.get(1)?,
            entity_type: row.get(2)?,
            status: row.get(3)?,
            version: row.get(4)?,
            external_id: row.get(5)?,
            data: row.get(6)?,
            sync_status: row.get(7)?,
            server_id: row.get(8)?,
            last_synced_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_entity(self) -> AppResult<Entity> {
        let entity_id = Uuid::parse_str(&self.entity_id).map_err(|err| {
            AppError::Validation(format!("invalid entity id {}: {err}", self.entity_id))
        })?;
        Ok(Entity {
            entity_id,
            name: self.name,
            entity_type: EntityType::parse(&self.entity_type)?,
            status: EntityStatus::parse(&self.status)?,
            version: self.version,
            external_id: self.external_id,
            data: self.data,
            sync: SyncState {
                status: SyncStatus::parse(&self.sync_status)?,
                server_id: self.server_id,
                last_synced_at: self.last_synced_at,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    #[test]
    fn upsert_inserts_then_bumps_version() {
        let store = store();
        let entity = Entity::new(
            "Chez Nous",
            EntityType::Restaurant,
            json!({ "location": { "city": "Paris" } }),
        )
        .with_external_id("ChIJ-chez");

        let first = store.upsert_entity(&entity).unwrap();
        assert_eq!(first.version, 1);

        let mut renamed = first.clone();
        renamed.name = "Chez Nous Bistro".into();
        let second = store.upsert_entity(&renamed).unwrap();
        assert_eq!(second.version, 2);
        assert!(second.updated_at >= first.updated_at);

        let found = store
            .find_entity_by_external_id("ChIJ-chez")
            .unwrap()
            .unwrap();
        assert_eq!(found.entity_id, entity.entity_id);
        assert_eq!(found.name, "Chez Nous Bistro");
        assert_eq!(found.data["location"]["city"], "Paris");
    }

    #[test]
    fn filter_hides_deleted_and_other_types() {
        let store = store();
        let kept = store
            .upsert_entity(&Entity::new("Kept", EntityType::Restaurant, json!({})))
            .unwrap();
        let gone = store
            .upsert_entity(&Entity::new("Gone", EntityType::Restaurant, json!({})))
            .unwrap();
        store
            .upsert_entity(&Entity::new("Hotel", EntityType::Hotel, json!({})))
            .unwrap();

        assert!(store.mark_entity_deleted(gone.entity_id).unwrap());
        assert!(!store.mark_entity_deleted(gone.entity_id).unwrap());

        let restaurants = store.get_entities(&EntityFilter::restaurants()).unwrap();
        assert_eq!(restaurants.len(), 1);
        assert_eq!(restaurants[0].entity_id, kept.entity_id);

        let everything = store
            .get_entities(&EntityFilter {
                entity_type: None,
                include_deleted: true,
            })
            .unwrap();
        assert_eq!(everything.len(), 3);
        assert!(everything.iter().any(|e| e.is_deleted()));
    }

    #[test]
    fn saves_restaurant_with_concepts() {
        let store = store();
        let mut draft = RestaurantDraft::new("Le Petit", "curator-1", RestaurantSource::Michelin);
        draft.server_id = Some("m-7".into());
        draft.concepts = vec![
            Concept::new("Cuisine", "French"),
            Concept::new("Price Range", "Moderate"),
        ];
        draft.location = Some(RestaurantLocation {
            latitude: 48.85,
            longitude: 2.35,
            address: Some("1 Rue de Rivoli, Paris".into()),
        });

        let id = store.save_restaurant(&draft).unwrap();
        assert_eq!(
            store
                .find_restaurant_by_server_id(RestaurantSource::Michelin, "m-7")
                .unwrap(),
            Some(id)
        );
        assert_eq!(
            store
                .find_restaurant_by_server_id(RestaurantSource::GooglePlaces, "m-7")
                .unwrap(),
            None
        );
        assert_eq!(store.restaurant_concepts(id).unwrap(), draft.concepts);
        assert_eq!(store.restaurant_count().unwrap(), 1);
    }

    #[test]
    fn rejects_nameless_restaurant() {
        let store = store();
        let draft = RestaurantDraft::new("  ", "curator-1", RestaurantSource::Manual);
        assert!(matches!(
            store.save_restaurant(&draft),
            Err(AppError::Validation(_))
        ));
        assert_eq!(store.restaurant_count().unwrap(), 0);
    }

    #[test]
    fn parses_source_tags() {
        for source in [
            RestaurantSource::Manual,
            RestaurantSource::GooglePlaces,
            RestaurantSource::Michelin,
        ] {
            assert_eq!(RestaurantSource::parse(source.as_tag()).unwrap(), source);
        }
        assert!(RestaurantSource::parse("yelp").is_err());
    }
}
