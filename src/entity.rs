use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

pub const UNKNOWN_CITY: &str = "Unknown";
const LOCAL_KEY_PREFIX: &str = "local_";
const ADDRESS_FIELDS: &[&str] = &["formattedAddress", "formatted_address", "address", "vicinity"];
const COMPONENT_FIELDS: &[&str] = &["addressComponents", "address_components"];
const CITY_COMPONENT_TYPES: &[&str] = &["locality", "administrative_area_level_2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Restaurant,
    Bar,
    Hotel,
    Cafe,
    Other,
}

impl EntityType {
    pub fn as_tag(&self) -> &'static str {
        match self {
            EntityType::Restaurant => "restaurant",
            EntityType::Bar => "bar",
            EntityType::Hotel => "hotel",
            EntityType::Cafe => "cafe",
            EntityType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "restaurant" => Ok(EntityType::Restaurant),
            "bar" => Ok(EntityType::Bar),
            "hotel" => Ok(EntityType::Hotel),
            "cafe" => Ok(EntityType::Cafe),
            "other" => Ok(EntityType::Other),
            _ => Err(AppError::Validation(format!("invalid entity type: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Deleted,
}

impl EntityStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "active" => Ok(EntityStatus::Active),
            "deleted" => Ok(EntityStatus::Deleted),
            _ => Err(AppError::Validation(format!("invalid entity status: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
}

impl SyncStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflict" => Ok(SyncStatus::Conflict),
            _ => Err(AppError::Validation(format!("invalid sync status: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub server_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Pending,
            server_id: None,
            last_synced_at: None,
        }
    }
}

/// A raw place record from any source, before curation.
///
/// `data` keeps the provider payload as-is; its shape differs between Google
/// Places, Michelin and manual entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub version: i64,
    #[serde(rename = "externalId", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub data: Value,
    #[serde(default)]
    pub sync: SyncState,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: EntityType, data: Value) -> Self {
        let now = Utc::now();
        Self {
            entity_id: Uuid::new_v4(),
            name: name.into(),
            entity_type,
            status: EntityStatus::Active,
            version: 1,
            external_id: None,
            data,
            sync: SyncState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }
}

/// Best-effort city for an entity, or [`UNKNOWN_CITY`].
pub fn extract_city(entity: &Entity) -> String {
    city_from_location(&entity.data)
        .or_else(|| city_from_components(&entity.data))
        .or_else(|| city_from_address(&entity.data))
        .unwrap_or_else(|| UNKNOWN_CITY.to_string())
}

fn city_from_location(data: &Value) -> Option<String> {
    data.get("location")
        .and_then(|location| location.get("city"))
        .and_then(Value::as_str)
        .and_then(accept_candidate)
}

fn city_from_components(data: &Value) -> Option<String> {
    let nested = data.get("location");
    let arrays = COMPONENT_FIELDS
        .iter()
        .filter_map(|field| data.get(*field))
        .chain(
            COMPONENT_FIELDS
                .iter()
                .filter_map(|field| nested.and_then(|location| location.get(*field))),
        )
        .filter_map(Value::as_array);

    for components in arrays {
        for component in components {
            let is_city = component
                .get("types")
                .and_then(Value::as_array)
                .map(|types| {
                    types
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|t| CITY_COMPONENT_TYPES.contains(&t))
                })
                .unwrap_or(false);
            if !is_city {
                continue;
            }
            let name = ["long_name", "longText", "short_name", "shortText"]
                .iter()
                .filter_map(|field| component.get(*field).and_then(Value::as_str))
                .find_map(accept_candidate);
            if name.is_some() {
                return name;
            }
        }
    }
    None
}

fn city_from_address(data: &Value) -> Option<String> {
    let nested = data.get("location");
    ADDRESS_FIELDS
        .iter()
        .filter_map(|field| data.get(*field))
        .chain(
            ADDRESS_FIELDS
                .iter()
                .filter_map(|field| nested.and_then(|location| location.get(*field))),
        )
        .filter_map(Value::as_str)
        .find_map(parse_city_from_address)
}

fn parse_city_from_address(address: &str) -> Option<String> {
    if address.contains('{') || address.contains('[') {
        return None;
    }
    let parts: Vec<&str> = address.split(',').map(str::trim).collect();
    if parts.len() < 2 {
        return None;
    }
    let mut candidate = parts[parts.len() - 2];
    let starts_with_digit = candidate
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    if starts_with_digit && parts.len() >= 3 {
        candidate = parts[parts.len() - 3];
    }
    accept_candidate(&strip_postal_codes(candidate))
}

fn strip_postal_codes(value: &str) -> String {
    value
        .split_whitespace()
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit() || c == '-'))
        .map(|token| token.chars().filter(|c| !c.is_ascii_digit()).collect::<String>())
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn accept_candidate(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.contains('{') || trimmed.contains('[') {
        return None;
    }
    Some(trimmed.to_string())
}

/// Key used to collapse duplicate records of the same place.
pub fn dedup_key(entity: &Entity) -> String {
    let metadata_place_id = entity
        .data
        .get("metadata")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|first| first.get("place_id"))
        .and_then(Value::as_str);
    let google_place_id = entity.data.get("google_place_id").and_then(Value::as_str);

    entity
        .external_id
        .as_deref()
        .into_iter()
        .chain(metadata_place_id)
        .chain(google_place_id)
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{LOCAL_KEY_PREFIX}{}", entity.entity_id))
}

/// Keeps one entity per dedup key: the most recently updated, earlier-seen on
/// ties. Survivors keep the first-seen order of their keys.
pub fn dedupe(entities: Vec<Entity>) -> Vec<Entity> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(entities.len());
    let mut survivors: Vec<Entity> = Vec::with_capacity(entities.len());

    for entity in entities {
        let key = dedup_key(&entity);
        match positions.get(&key) {
            Some(&index) => {
                if entity.updated_at > survivors[index].updated_at {
                    survivors[index] = entity;
                }
            }
            None => {
                positions.insert(key, survivors.len());
                survivors.push(entity);
            }
        }
    }
    survivors
}

pub fn sort_by_name(entities: &mut [Entity]) {
    entities.sort_by(|a, b| compare_names(&a.name, &b.name));
}

pub(crate) fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
