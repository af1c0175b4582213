use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{AppResult, ExtractionDegraded};
use crate::michelin::MichelinRestaurant;
use crate::places::{parse_price_level, Place};

pub const CUISINE: &str = "Cuisine";
pub const ESTABLISHMENT: &str = "Establishment";
pub const DRINKS: &str = "Drinks";
pub const PRICE_RANGE: &str = "Price Range";
pub const QUALITY: &str = "quality";
pub const KEYWORD: &str = "keyword";
pub const COUNTRY: &str = "Country";
pub const MICHELIN: &str = "Michelin";

const MAX_KEYWORD_CONCEPTS: usize = 5;

const PRICE_LABELS: [&str; 5] = ["Free", "Inexpensive", "Moderate", "Expensive", "Very Expensive"];

const TYPE_TABLE: &[(&str, &str, &str)] = &[
    ("american_restaurant", CUISINE, "American"),
    ("barbecue_restaurant", CUISINE, "Barbecue"),
    ("brazilian_restaurant", CUISINE, "Brazilian"),
    ("breakfast_restaurant", CUISINE, "Breakfast"),
    ("brunch_restaurant", CUISINE, "Brunch"),
    ("chinese_restaurant", CUISINE, "Chinese"),
    ("french_restaurant", CUISINE, "French"),
    ("greek_restaurant", CUISINE, "Greek"),
    ("hamburger_restaurant", CUISINE, "Burgers"),
    ("indian_restaurant", CUISINE, "Indian"),
    ("italian_restaurant", CUISINE, "Italian"),
    ("japanese_restaurant", CUISINE, "Japanese"),
    ("korean_restaurant", CUISINE, "Korean"),
    ("lebanese_restaurant", CUISINE, "Lebanese"),
    ("mediterranean_restaurant", CUISINE, "Mediterranean"),
    ("mexican_restaurant", CUISINE, "Mexican"),
    ("middle_eastern_restaurant", CUISINE, "Middle Eastern"),
    ("pizza_restaurant", CUISINE, "Pizza"),
    ("ramen_restaurant", CUISINE, "Ramen"),
    ("seafood_restaurant", CUISINE, "Seafood"),
    ("spanish_restaurant", CUISINE, "Spanish"),
    ("steak_house", CUISINE, "Steakhouse"),
    ("sushi_restaurant", CUISINE, "Sushi"),
    ("thai_restaurant", CUISINE, "Thai"),
    ("turkish_restaurant", CUISINE, "Turkish"),
    ("vegan_restaurant", CUISINE, "Vegan"),
    ("vegetarian_restaurant", CUISINE, "Vegetarian"),
    ("vietnamese_restaurant", CUISINE, "Vietnamese"),
    ("bakery", ESTABLISHMENT, "Bakery"),
    ("cafe", ESTABLISHMENT, "Cafe"),
    ("coffee_shop", ESTABLISHMENT, "Coffee Shop"),
    ("fast_food_restaurant", ESTABLISHMENT, "Fast Food"),
    ("fine_dining_restaurant", ESTABLISHMENT, "Fine Dining"),
    ("food_court", ESTABLISHMENT, "Food Court"),
    ("ice_cream_shop", ESTABLISHMENT, "Ice Cream"),
    ("meal_delivery", ESTABLISHMENT, "Delivery"),
    ("meal_takeaway", ESTABLISHMENT, "Takeaway"),
    ("restaurant", ESTABLISHMENT, "Restaurant"),
    ("bar", DRINKS, "Bar"),
    ("night_club", DRINKS, "Night Club"),
    ("pub", DRINKS, "Pub"),
    ("wine_bar", DRINKS, "Wine Bar"),
];

// Atmosphere, service, food quality, specialty, then dining style.
const KEYWORDS: &[&str] = &[
    "cozy",
    "romantic",
    "lively",
    "quiet",
    "intimate",
    "rustic",
    "elegant",
    "casual",
    "trendy",
    "friendly",
    "attentive",
    "welcoming",
    "fresh",
    "authentic",
    "homemade",
    "delicious",
    "seasonal",
    "organic",
    "pasta",
    "pizza",
    "sushi",
    "seafood",
    "steak",
    "dessert",
    "wine",
    "cocktails",
    "brunch",
    "tapas",
    "family-friendly",
    "outdoor seating",
    "terrace",
    "tasting menu",
    "counter seating",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Concept {
    pub category: String,
    pub value: String,
}

impl Concept {
    pub fn new(category: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            value: value.into(),
        }
    }
}

/// Insertion-ordered concept list that drops repeats of the same
/// case-insensitive `(category, value)` pair.
#[derive(Debug, Default)]
pub struct ConceptSet {
    concepts: Vec<Concept>,
    seen: HashSet<(String, String)>,
}

impl ConceptSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, concept: Concept) -> bool {
        let category = concept.category.trim();
        let value = concept.value.trim();
        if category.is_empty() || value.is_empty() {
            return false;
        }
        let key = (category.to_lowercase(), value.to_lowercase());
        if !self.seen.insert(key) {
            return false;
        }
        self.concepts.push(Concept::new(category, value));
        true
    }

    pub fn extend(&mut self, concepts: impl IntoIterator<Item = Concept>) {
        for concept in concepts {
            self.insert(concept);
        }
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    pub fn into_vec(self) -> Vec<Concept> {
        self.concepts
    }
}

/// External text-to-concepts step (NLP or LLM service).
#[async_trait]
pub trait ConceptSource: Send + Sync {
    async fn extract_concepts(&self, text: &str) -> Result<Vec<Concept>, ExtractionDegraded>;
}

pub struct HttpConceptSource {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpConceptSource {
    pub fn new(endpoint: &str, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl ConceptSource for HttpConceptSource {
    async fn extract_concepts(&self, text: &str) -> Result<Vec<Concept>, ExtractionDegraded> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            concepts: Vec<Concept>,
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|err| ExtractionDegraded::new(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionDegraded::new(format!(
                "extraction endpoint returned {status}"
            )));
        }
        let body: Response = response
            .json()
            .await
            .map_err(|err| ExtractionDegraded::new(err.to_string()))?;
        Ok(body.concepts)
    }
}

#[derive(Clone, Default)]
pub struct ConceptExtractor {
    source: Option<Arc<dyn ConceptSource>>,
}

impl ConceptExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: Arc<dyn ConceptSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    pub fn has_text_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn extract(&self, place: &Place) -> Vec<Concept> {
        structural(
            place.types.iter().map(String::as_str),
            place.price_level,
            place.rating,
            place.review_snippets.iter().map(String::as_str),
        )
    }

    /// Same rules as [`extract`](Self::extract) over raw provider JSON.
    pub fn extract_from_raw(&self, raw: &Value) -> Vec<Concept> {
        let types = raw
            .get("types")
            .and_then(Value::as_array)
            .map(|types| types.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        let price = raw
            .get("price_level")
            .or_else(|| raw.get("priceLevel"))
            .and_then(|value| match value {
                Value::Number(level) => level.as_u64().and_then(|l| u8::try_from(l).ok()),
                Value::String(level) => parse_price_level(level),
                _ => None,
            });
        let rating = raw.get("rating").and_then(Value::as_f64);
        let reviews = raw
            .get("reviews")
            .and_then(Value::as_array)
            .map(|reviews| reviews.iter().filter_map(review_text).collect::<Vec<_>>())
            .unwrap_or_default();
        structural(types.into_iter(), price, rating, reviews.into_iter())
    }

    pub fn extract_michelin(&self, restaurant: &MichelinRestaurant) -> Vec<Concept> {
        let mut set = ConceptSet::new();
        if let Some(cuisine) = &restaurant.cuisine {
            for value in cuisine.split(',') {
                set.insert(Concept::new(CUISINE, value));
            }
        }
        if let Some(label) = restaurant.price.as_deref().and_then(currency_price_label) {
            set.insert(Concept::new(PRICE_RANGE, label));
        }
        if let Some(country) = &restaurant.country {
            set.insert(Concept::new(COUNTRY, country.as_str()));
        }
        if let Some(distinction) = &restaurant.distinction {
            set.insert(Concept::new(MICHELIN, distinction.as_str()));
        }
        set.into_vec()
    }

    pub async fn extract_with_text(&self, place: &Place, text: &str) -> Vec<Concept> {
        self.enrich(self.extract(place), text).await
    }

    /// Unions `structural` with concepts from the text source. A failing
    /// source leaves `structural` as the result.
    pub async fn enrich(&self, structural: Vec<Concept>, text: &str) -> Vec<Concept> {
        let mut set = ConceptSet::new();
        set.extend(structural);

        let Some(source) = &self.source else {
            return set.into_vec();
        };
        if text.trim().is_empty() {
            return set.into_vec();
        }

        match source.extract_concepts(text).await {
            Ok(concepts) => {
                let before = set.len();
                set.extend(concepts);
                debug!(
                    target: "concepts",
                    added = set.len() - before,
                    "text concepts merged"
                );
            }
            Err(err) => {
                warn!(target: "concepts", error = %err, "using structural concepts only");
            }
        }
        set.into_vec()
    }
}

fn structural<'a>(
    types: impl Iterator<Item = &'a str>,
    price_level: Option<u8>,
    rating: Option<f64>,
    snippets: impl Iterator<Item = &'a str>,
) -> Vec<Concept> {
    let mut set = ConceptSet::new();

    for place_type in types {
        if let Some((_, category, value)) = TYPE_TABLE.iter().find(|(tag, _, _)| *tag == place_type)
        {
            set.insert(Concept::new(*category, *value));
        }
    }

    if let Some(label) = price_level.and_then(|level| PRICE_LABELS.get(usize::from(level))) {
        set.insert(Concept::new(PRICE_RANGE, *label));
    }

    match rating {
        Some(r) if r >= 4.5 => {
            set.insert(Concept::new(QUALITY, "Highly Rated"));
        }
        Some(r) if r >= 4.0 => {
            set.insert(Concept::new(QUALITY, "Well Rated"));
        }
        _ => {}
    }

    let text = normalize_text(snippets);
    if !text.trim().is_empty() {
        KEYWORDS
            .iter()
            .filter(|keyword| text.contains(&format!(" {keyword} ")))
            .take(MAX_KEYWORD_CONCEPTS)
            .for_each(|keyword| {
                set.insert(Concept::new(KEYWORD, *keyword));
            });
    }

    set.into_vec()
}

/// Lowercases, keeps letters, digits and hyphens, and pads with spaces so
/// keywords can be matched on word boundaries.
fn normalize_text<'a>(snippets: impl Iterator<Item = &'a str>) -> String {
    let mut text = String::from(" ");
    for snippet in snippets {
        let mut last_space = true;
        for ch in snippet.chars().flat_map(char::to_lowercase) {
            if ch.is_alphanumeric() || ch == '-' {
                text.push(ch);
                last_space = false;
            } else if !last_space {
                text.push(' ');
                last_space = true;
            }
        }
        if !last_space {
            text.push(' ');
        }
    }
    text
}

fn review_text(review: &Value) -> Option<&str> {
    match review {
        Value::String(text) => Some(text.as_str()),
        Value::Object(map) => match map.get("text")? {
            Value::String(text) => Some(text.as_str()),
            Value::Object(inner) => inner.get("text").and_then(Value::as_str),
            _ => None,
        },
        _ => None,
    }
}

/// Maps a run of one to four identical currency symbols (`€€`, `$$$`) to a
/// price label.
fn currency_price_label(price: &str) -> Option<&'static str> {
    let symbols: Vec<char> = price.chars().filter(|c| !c.is_whitespace()).collect();
    let first = *symbols.first()?;
    if !matches!(first, '€' | '$' | '£' | '¥') || symbols.iter().any(|c| *c != first) {
        return None;
    }
    match symbols.len() {
        count @ 1..=4 => PRICE_LABELS.get(count).copied(),
        _ => None,
    }
}
