//! Deterministic reconciliation of marketplace comps into a valuation band.
//!
//! Order of operations is fixed: stable sort, currency normalization,
//! outlier trim against the raw median, nearest-rank percentiles. Given
//! frozen adapter outputs the numeric fields are bitwise reproducible.

use crate::models::{Comp, PricingSummary};
use tracing::debug;

/// Exchange-rate table: units of the canonical currency (USD) per one unit
/// of the keyed currency.
#[derive(Debug, Clone, Default)]
pub struct FxTable {
    rates: Vec<(String, f64)>,
}

impl FxTable {
    pub fn from_pairs(rates: &[(String, f64)]) -> Self {
        Self {
            rates: rates.to_vec(),
        }
    }

    pub fn to_usd(&self, currency: &str) -> Option<f64> {
        if currency.eq_ignore_ascii_case("USD") {
            return Some(1.0);
        }
        self.rates
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(currency))
            .map(|(_, rate)| *rate)
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank - 1]
}

/// Fuses comps from all adapters into a single pricing summary.
///
/// `adapters_queried` / `adapters_with_data` feed the confidence term;
/// comps are assumed already windowed by the adapters.
pub fn fuse(
    mut comps: Vec<Comp>,
    adapters_queried: usize,
    adapters_with_data: usize,
    window_days: u32,
    fx: &FxTable,
) -> PricingSummary {
    // Deterministic order regardless of adapter arrival interleaving.
    comps.sort_by(|a, b| {
        (a.sold_at, &a.source_tag)
            .cmp(&(b.sold_at, &b.source_tag))
            .then(a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut dropped_unknown_currency = 0usize;
    let normalized: Vec<(f64, String)> = comps
        .iter()
        .filter_map(|comp| match fx.to_usd(&comp.currency) {
            Some(rate) if comp.price.is_finite() && comp.price > 0.0 => {
                Some((comp.price * rate, comp.source_tag.clone()))
            }
            Some(_) => None,
            None => {
                dropped_unknown_currency += 1;
                None
            }
        })
        .collect();

    if dropped_unknown_currency > 0 {
        debug!(
            dropped = dropped_unknown_currency,
            "comps dropped for unknown currency"
        );
    }

    if normalized.is_empty() {
        return PricingSummary::no_data(window_days);
    }

    let mut raw_sorted: Vec<f64> = normalized.iter().map(|(p, _)| *p).collect();
    raw_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let raw_median = percentile(&raw_sorted, 0.5);

    let (lo, hi) = (0.05 * raw_median, 20.0 * raw_median);
    let kept: Vec<(f64, String)> = normalized
        .into_iter()
        .filter(|(price, _)| (lo..=hi).contains(price))
        .collect();

    if kept.is_empty() {
        return PricingSummary::no_data(window_days);
    }

    let mut prices: Vec<f64> = kept.iter().map(|(p, _)| *p).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut sources = Vec::new();
    for (_, tag) in &kept {
        if !sources.contains(tag) {
            sources.push(tag.clone());
        }
    }

    let comps_count = prices.len();
    let coverage = if adapters_queried > 0 {
        adapters_with_data as f64 / adapters_queried as f64
    } else {
        0.0
    };
    let confidence = (comps_count as f64 / 20.0).min(1.0) * coverage;

    PricingSummary {
        value_low: Some(percentile(&prices, 0.25)),
        value_median: Some(percentile(&prices, 0.5)),
        value_high: Some(percentile(&prices, 0.75)),
        comps_count,
        window_days,
        confidence,
        sources,
    }
}
