//! eBay Marketplace Insights adapter: sold-listing comps for a card query.

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
use tracing::debug;

const DEFAULT_BASE: &str = "https://api.ebay.com/buy/marketplace_insights/v1_beta";

pub struct EbayAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<TokenBucket>,
}

impl EbayAdapter {
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
impl PricingAdapter for EbayAdapter {
    fn tag(&self) -> &'static str {
        "ebay"
    }

    async fn fetch_comps(
        &self,
        query: &CompQuery,
        window_days: u32,
    ) -> Result<Vec<Comp>, AppError> {
        self.limiter.acquire().await;

        let since = Utc::now() - Duration::days(window_days as i64);
        let url = format!("{}/item_sales/search", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("q", query.search_terms()),
            ("category_ids", "183454".to_string()),
            (
                "filter",
                format!("lastSoldDate:[{}..]", since.format("%Y-%m-%dT%H:%M:%SZ")),
            ),
            ("limit", "50".to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("ebay request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "ebay"));
        }

        let body: ItemSalesResponse = response
            .json()
            .await
            .context("ebay item_sales parse")
            .map_err(|e| AppError::ProviderPermanent(e.to_string()))?;

        let comps = body
            .item_sales
            .unwrap_or_default()
            .into_iter()
            .filter_map(|sale| {
                let price: f64 = sale.last_sold_price.as_ref()?.value.parse().ok()?;
                let sold_at: DateTime<Utc> = sale.last_sold_date.as_deref()?.parse().ok()?;
                Some(Comp {
                    price,
                    currency: sale
                        .last_sold_price
                        .as_ref()
                        .map(|p| p.currency.clone())
                        .unwrap_or_else(|| "USD".to_string()),
                    condition: sale.condition,
                    sold_at,
                    source_tag: "ebay".to_string(),
                    url: sale.item_web_url,
                })
            })
            .collect::<Vec<_>>();

        debug!(comps = comps.len(), "ebay sold listings normalized");
        Ok(comps)
    }
}

#[derive(Debug, Deserialize)]
struct ItemSalesResponse {
    #[serde(rename = "itemSales")]
    item_sales: Option<Vec<ItemSale>>,
}

#[derive(Debug, Deserialize)]
struct ItemSale {
    #[serde(rename = "lastSoldPrice")]
    last_sold_price: Option<SalePrice>,
    #[serde(rename = "lastSoldDate")]
    last_sold_date: Option<String>,
    condition: Option<String>,
    #[serde(rename = "itemWebUrl")]
    item_web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SalePrice {
    value: String,
    currency: String,
}
