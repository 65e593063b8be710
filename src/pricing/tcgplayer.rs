//! TCGplayer adapter: recent sales from the product sales endpoint.

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

const DEFAULT_BASE: &str = "https://api.tcgplayer.com/v1.39.0";

pub struct TcgplayerAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<TokenBucket>,
}

impl TcgplayerAdapter {
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
impl PricingAdapter for TcgplayerAdapter {
    fn tag(&self) -> &'static str {
        "tcgplayer"
    }

    async fn fetch_comps(
        &self,
        query: &CompQuery,
        window_days: u32,
    ) -> Result<Vec<Comp>, AppError> {
        self.limiter.acquire().await;

        let url = format!("{}/pricing/sales/search", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("productName", query.name.clone()),
            ("setName", query.set.clone().unwrap_or_default()),
            ("days", window_days.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("tcgplayer request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "tcgplayer"));
        }

        let body: SalesResponse = response
            .json()
            .await
            .context("tcgplayer sales parse")
            .map_err(|e| AppError::ProviderPermanent(e.to_string()))?;

        let cutoff = Utc::now() - Duration::days(window_days as i64);
        Ok(body
            .results
            .into_iter()
            .filter_map(|sale| {
                let sold_at: DateTime<Utc> = sale.order_date.parse().ok()?;
                (sold_at >= cutoff).then(|| Comp {
                    price: sale.purchase_price,
                    currency: "USD".to_string(),
                    condition: sale.condition,
                    sold_at,
                    source_tag: "tcgplayer".to_string(),
                    url: None,
                })
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SalesResponse {
    #[serde(default)]
    results: Vec<Sale>,
}

#[derive(Debug, Deserialize)]
struct Sale {
    #[serde(rename = "purchasePrice")]
    purchase_price: f64,
    #[serde(rename = "orderDate")]
    order_date: String,
    condition: Option<String>,
}
