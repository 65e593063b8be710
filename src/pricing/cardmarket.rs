//! Cardmarket adapter. Prices come back in EUR; fusion normalizes them.

use crate::error::AppError;
use crate::models::Comp;
use crate::pricing::adapter::{classify_status, CompQuery, PricingAdapter};
use crate::pricing::ratelimit::TokenBucket;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_BASE: &str = "https://api.cardmarket.com/ws/v2.0/output.json";

pub struct CardmarketAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<TokenBucket>,
}

impl CardmarketAdapter {
    pub fn new(client: Client, api_key: Option<String>, limiter: Arc<TokenBucket>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE.to_string(),
            api_key,
            limiter,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl PricingAdapter for CardmarketAdapter {
    fn tag(&self) -> &'static str {
        "cardmarket"
    }

    async fn fetch_comps(
        &self,
        query: &CompQuery,
        window_days: u32,
    ) -> Result<Vec<Comp>, AppError> {
        self.limiter.acquire().await;

        let url = format!("{}/sales/find", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("search", query.search_terms()),
            ("maxResults", "50".to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("cardmarket request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "cardmarket"));
        }

        let body: SalesEnvelope = response
            .json()
            .await
            .context("cardmarket sales parse")
            .map_err(|e| AppError::ProviderPermanent(e.to_string()))?;

        let cutoff = Utc::now() - Duration::days(window_days as i64);
        Ok(body
            .sales
            .into_iter()
            .filter_map(|sale| {
                let sold_at: DateTime<Utc> = sale.date_sold.parse().ok()?;
                (sold_at >= cutoff).then(|| Comp {
                    price: sale.price,
                    currency: sale.currency.unwrap_or_else(|| "EUR".to_string()),
                    condition: sale.condition,
                    sold_at,
                    source_tag: "cardmarket".to_string(),
                    url: None,
                })
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SalesEnvelope {
    #[serde(default)]
    sales: Vec<Sale>,
}

#[derive(Debug, Deserialize)]
struct Sale {
    price: f64,
    currency: Option<String>,
    #[serde(rename = "dateSold")]
    date_sold: String,
    condition: Option<String>,
}
