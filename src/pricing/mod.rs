//! Pricing aggregation: marketplace adapters, rate limiting, and fusion.

pub mod adapter;
pub mod cardmarket;
pub mod ebay;
pub mod fusion;
pub mod ratelimit;
pub mod tcgplayer;

pub use adapter::{fan_out, AdapterOutcome, CompQuery, FanoutResult, PricingAdapter};
pub use fusion::{fuse, FxTable};
pub use ratelimit::{Limiters, TokenBucket};

use crate::models::Config;
use std::sync::Arc;
use tracing::warn;

/// Builds the enabled adapter set. Adapters are a closed set of tagged
/// variants; an unknown tag in the config is skipped with a warning.
pub fn build_adapters(
    config: &Config,
    client: &reqwest::Client,
    limiters: &Limiters,
) -> Vec<Arc<dyn PricingAdapter>> {
    let mut adapters: Vec<Arc<dyn PricingAdapter>> = Vec::new();
    for tag in &config.pricing_adapters_enabled {
        match tag.as_str() {
            "ebay" => adapters.push(Arc::new(ebay::EbayAdapter::new(
                client.clone(),
                std::env::var("EBAY_API_KEY").ok(),
                limiters.for_tag("ebay"),
            ))),
            "tcgplayer" => adapters.push(Arc::new(tcgplayer::TcgplayerAdapter::new(
                client.clone(),
                std::env::var("TCGPLAYER_API_KEY").ok(),
                limiters.for_tag("tcgplayer"),
            ))),
            "cardmarket" => adapters.push(Arc::new(cardmarket::CardmarketAdapter::new(
                client.clone(),
                std::env::var("CARDMARKET_API_KEY").ok(),
                limiters.for_tag("cardmarket"),
            ))),
            other => warn!(adapter = %other, "unknown pricing adapter tag, skipping"),
        }
    }
    adapters
}
