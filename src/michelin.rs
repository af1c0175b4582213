use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{AppResult, ProviderStatus, SearchError};
use crate::retry::RetryPolicy;

const USER_AGENT: &str = "restaurant-curator/0.1.0";
const DEFAULT_PER_PAGE: u32 = 20;

/// Search parameters for the staging `restaurants` endpoint. `city` goes out
/// as `location`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MichelinQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(rename = "location", skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuisine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

impl MichelinQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn near(latitude: f64, longitude: f64, tolerance: f64) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            tolerance: Some(tolerance),
            ..Self::default()
        }
    }

    pub fn page(mut self, page: u32, per_page: u32) -> Self {
        self.page = Some(page.max(1));
        self.per_page = Some(per_page.max(1));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MichelinRestaurant {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default, alias = "location")]
    pub city: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub cuisine: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default, alias = "award")]
    pub distinction: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) if !id.trim().is_empty() => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

/// Response shapes the staging API is known to return.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MichelinResponse {
    Paged {
        results: Vec<MichelinRestaurant>,
        #[serde(default)]
        total: Option<u64>,
        #[serde(default)]
        page: Option<u32>,
        #[serde(default)]
        per_page: Option<u32>,
    },
    Data {
        data: Vec<MichelinRestaurant>,
    },
    Bare(Vec<MichelinRestaurant>),
}

impl MichelinResponse {
    pub fn decode(body: &str) -> Result<Self, SearchError> {
        serde_json::from_str(body).map_err(|err| {
            SearchError::new(
                MichelinClient::NAME,
                ProviderStatus::UnrecognizedShape,
                format!("unrecognized response: {err}"),
            )
        })
    }

    pub fn into_page(self, query: &MichelinQuery) -> MichelinPage {
        let requested_page = query.page.unwrap_or(1);
        let requested_per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE);
        match self {
            MichelinResponse::Paged {
                results,
                total,
                page,
                per_page,
            } => MichelinPage {
                total: total.unwrap_or(results.len() as u64),
                page: page.unwrap_or(requested_page),
                per_page: per_page.unwrap_or(requested_per_page),
                restaurants: results,
            },
            MichelinResponse::Data { data: restaurants } | MichelinResponse::Bare(restaurants) => {
                MichelinPage {
                    total: restaurants.len() as u64,
                    page: requested_page,
                    per_page: requested_per_page,
                    restaurants,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MichelinPage {
    pub restaurants: Vec<MichelinRestaurant>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl MichelinPage {
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.per_page) < self.total
    }
}

pub struct MichelinClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    retry: RetryPolicy,
}

impl MichelinClient {
    pub const NAME: &'static str = "michelin";

    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry,
        })
    }

    pub async fn search(&self, query: &MichelinQuery) -> AppResult<MichelinPage> {
        let page = self
            .retry
            .run(Self::NAME, move || self.fetch(query))
            .await?;
        info!(
            target: "michelin",
            results = page.restaurants.len(),
            total = page.total,
            page = page.page,
            "michelin search completed"
        );
        Ok(page)
    }

    async fn fetch(&self, query: &MichelinQuery) -> Result<MichelinPage, SearchError> {
        let mut request = self
            .http
            .get(format!("{}/restaurants", self.base_url))
            .query(query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|err| SearchError::from_reqwest(Self::NAME, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SearchError::from_reqwest(Self::NAME, err))?;

        if !status.is_success() {
            debug!(target: "michelin", status = status.as_u16(), "michelin request rejected");
            let message = if body.trim().is_empty() {
                format!("michelin search returned {status}")
            } else {
                body.chars().take(200).collect()
            };
            return Err(SearchError::new(
                Self::NAME,
                ProviderStatus::from_http(status.as_u16()),
                message,
            ));
        }

        Ok(MichelinResponse::decode(&body)?.into_page(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_known_shape() {
        let query = MichelinQuery::default().page(2, 10);

        let paged = MichelinResponse::decode(
            r#"{"results":[{"name":"A","country":"FR","price":"€€","cuisine":"French,Bistro"}],"total":1,"page":1,"per_page":20}"#,
        )
        .unwrap()
        .into_page(&query);
        assert_eq!(paged.restaurants.len(), 1);
        assert_eq!((paged.page, paged.per_page, paged.total), (1, 20, 1));

        let data = MichelinResponse::decode(r#"{"data":[{"id":42,"name":"B"}]}"#)
            .unwrap()
            .into_page(&query);
        assert_eq!(data.restaurants[0].id.as_deref(), Some("42"));
        assert_eq!((data.page, data.per_page), (2, 10));

        let bare = MichelinResponse::decode(r#"[{"id":"m-1","name":"C","location":"Lyon"}]"#)
            .unwrap()
            .into_page(&query);
        assert_eq!(bare.restaurants[0].city.as_deref(), Some("Lyon"));
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        let err = MichelinResponse::decode(r#"{"items":[{"name":"A"}]}"#).unwrap_err();
        assert_eq!(err.status, ProviderStatus::UnrecognizedShape);
        assert!(!err.retryable);

        assert!(MichelinResponse::decode("<html></html>").is_err());
    }

    #[test]
    fn query_serializes_city_as_location() {
        let query = MichelinQuery {
            city: Some("Paris".into()),
            cuisine: Some("French".into()),
            ..MichelinQuery::default()
        }
        .page(1, 20);
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["location"], "Paris");
        assert_eq!(value["per_page"], 20);
        assert!(value.get("name").is_none());
    }

    #[test]
    fn page_reports_more_results() {
        let page = MichelinPage {
            restaurants: Vec::new(),
            total: 45,
            page: 2,
            per_page: 20,
        };
        assert!(page.has_more());
        assert!(!MichelinPage { page: 3, ..page }.has_more());
    }
}
