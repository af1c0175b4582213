//! Display models. Each render function is a pure mapping from state to what
//! should be shown; nothing here touches the network or the store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::entity::{compare_names, dedupe, extract_city, Entity, EntityType, UNKNOWN_CITY};
use crate::errors::{AppError, AppResult};
use crate::places::Place;

#[derive(Debug, Clone, Default)]
pub struct EntityListState {
    pub entities: Vec<Entity>,
    /// Case-insensitive match against name or city.
    pub query: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRowView {
    pub entity_id: Uuid,
    pub name: String,
    pub city: String,
    pub entity_type: EntityType,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityGroup {
    pub city: String,
    pub rows: Vec<EntityRowView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityListView {
    pub groups: Vec<CityGroup>,
    pub total: usize,
    pub hidden_duplicates: usize,
}

impl EntityListView {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

pub fn render_entity_list(state: &EntityListState) -> EntityListView {
    let live: Vec<Entity> = state
        .entities
        .iter()
        .filter(|entity| !entity.is_deleted())
        .cloned()
        .collect();
    let before = live.len();
    let survivors = dedupe(live);
    let hidden_duplicates = before - survivors.len();

    let query = state.query.trim().to_lowercase();
    let city_filter = state
        .city
        .as_deref()
        .map(str::trim)
        .filter(|city| !city.is_empty());

    let mut grouped: BTreeMap<String, Vec<EntityRowView>> = BTreeMap::new();
    for entity in survivors {
        let city = extract_city(&entity);
        if let Some(wanted) = city_filter {
            if !city.eq_ignore_ascii_case(wanted) {
                continue;
            }
        }
        if !query.is_empty()
            && !entity.name.to_lowercase().contains(&query)
            && !city.to_lowercase().contains(&query)
        {
            continue;
        }
        grouped.entry(city.clone()).or_default().push(EntityRowView {
            entity_id: entity.entity_id,
            name: entity.name,
            city,
            entity_type: entity.entity_type,
            updated_at: entity.updated_at,
        });
    }

    let mut groups: Vec<CityGroup> = Vec::with_capacity(grouped.len());
    let mut unknown = None;
    for (city, mut rows) in grouped {
        rows.sort_by(|a, b| compare_names(&a.name, &b.name));
        let group = CityGroup { city, rows };
        if group.city == UNKNOWN_CITY {
            unknown = Some(group);
        } else {
            groups.push(group);
        }
    }
    // Entities without a city go last.
    groups.extend(unknown);

    let total = groups.iter().map(|group| group.rows.len()).sum();
    EntityListView {
        groups,
        total,
        hidden_duplicates,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SearchPanel {
    Empty,
    Results {
        places: Vec<Place>,
    },
    Failed {
        message: String,
        suggestion: String,
        retryable: bool,
    },
}

impl SearchPanel {
    pub fn from_result(result: &AppResult<Vec<Place>>) -> Self {
        match result {
            Ok(places) if places.is_empty() => SearchPanel::Empty,
            Ok(places) => SearchPanel::Results {
                places: places.clone(),
            },
            Err(AppError::Search(err)) => SearchPanel::Failed {
                message: err.message.clone(),
                suggestion: err.suggestion().to_string(),
                retryable: err.retryable,
            },
            Err(AppError::Validation(message)) => SearchPanel::Failed {
                message: message.clone(),
                suggestion: "adjust the location or filters".into(),
                retryable: false,
            },
            Err(err) => SearchPanel::Failed {
                message: err.to_string(),
                suggestion: "retry the search".into(),
                retryable: true,
            },
        }
    }
}

/// Hands out tickets so late search results can be dropped once the caller
/// has moved on (new search, panel closed).
#[derive(Debug, Clone, Default)]
pub struct RelevanceGuard {
    generation: Arc<AtomicU64>,
}

impl RelevanceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> SearchTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        SearchTicket {
            generation,
            current: Arc::clone(&self.generation),
        }
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct SearchTicket {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl SearchTicket {
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Returns `value` only while this ticket is still the latest.
    pub fn apply<T>(&self, value: T) -> Option<T> {
        self.is_current().then_some(value)
    }
}
