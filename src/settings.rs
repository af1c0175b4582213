use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{AppConfig, PlacesApiMode};
use crate::errors::{AppError, AppResult};
use crate::places::{SearchFilters, SortOrder};

const MAX_RADIUS_METERS: u32 = 50_000;
const MAX_PRICE_LEVEL: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub filters: SearchFilters,
    /// Read once at startup; a change applies on the next launch.
    pub places_api_mode: PlacesApiMode,
    #[serde(default)]
    pub curator_id: Option<String>,
}

/// Partial filter update. For `priceRange` and `cuisine`, an explicit
/// `null` clears the filter while a missing field leaves it alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSearchFiltersPayload {
    pub radius: Option<u32>,
    #[serde(default, deserialize_with = "present")]
    pub price_range: Option<Option<u8>>,
    pub min_rating: Option<f64>,
    #[serde(default, deserialize_with = "present")]
    pub cuisine: Option<Option<String>>,
    pub sort_by: Option<SortOrder>,
    pub food_only: Option<bool>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl UserSettings {
    pub fn load(path: &Path, config: &AppConfig) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(mut settings) => {
                    settings.filters = sanitize(settings.filters);
                    Ok(settings)
                }
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        "failed to parse settings file; regenerating defaults"
                    );
                    let defaults = Self::from_config(config);
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::from_config(config);
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn apply_patch(&mut self, payload: &UpdateSearchFiltersPayload) {
        let filters = &mut self.filters;
        if let Some(radius) = payload.radius {
            filters.radius = radius;
        }
        if let Some(price_range) = payload.price_range {
            filters.price_range = price_range;
        }
        if let Some(min_rating) = payload.min_rating {
            filters.min_rating = min_rating;
        }
        if let Some(cuisine) = &payload.cuisine {
            filters.cuisine = cuisine
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
        }
        if let Some(sort_by) = payload.sort_by {
            filters.sort_by = sort_by;
        }
        if let Some(food_only) = payload.food_only {
            filters.food_only = food_only;
        }
        self.filters = sanitize(self.filters.clone());
    }

    fn from_config(config: &AppConfig) -> Self {
        Self {
            filters: SearchFilters::default(),
            places_api_mode: config.places_api_mode,
            curator_id: None,
        }
    }
}

fn sanitize(mut filters: SearchFilters) -> SearchFilters {
    filters.radius = filters.radius.clamp(1, MAX_RADIUS_METERS);
    filters.min_rating = if filters.min_rating.is_finite() {
        filters.min_rating.clamp(0.0, 5.0)
    } else {
        0.0
    };
    filters.price_range = filters.price_range.map(|level| level.min(MAX_PRICE_LEVEL));
    filters
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}
