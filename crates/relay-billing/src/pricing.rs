//! Model prices and group ratios.

use parking_lot::RwLock;
use relay_core::types::model_matches;
use relay_core::{Price, PriceType, PricingTable, RelayError, RelayResult, Usage};
use std::collections::HashMap;

/// Quota units per US dollar
pub const QUOTA_PER_UNIT: f64 = 500_000.0;

/// Dollars per 1K tokens represented by a ratio of 1.0
pub const DOLLAR_RATE: f64 = 0.002;

/// Per-call charges are expressed as 1000 token-equivalents
const TIMES_BASE: f64 = 1000.0;

#[derive(Debug, Default)]
struct Prices {
    exact: HashMap<String, Price>,
    /// Wildcard entries, longest prefix first
    patterns: Vec<Price>,
    group_ratios: HashMap<String, f64>,
}

/// In-memory pricing table.
///
/// Exact model names win over trailing-`*` entries; among wildcards the
/// longest prefix wins.
#[derive(Debug, Default)]
pub struct ModelPricingTable {
    inner: RwLock<Prices>,
}

impl ModelPricingTable {
    /// Build a table from price entries and group ratios
    #[must_use]
    pub fn new(prices: Vec<Price>, group_ratios: HashMap<String, f64>) -> Self {
        let table = Self::default();
        table.replace(prices, group_ratios);
        table
    }

    /// Swap in a new set of prices and ratios
    pub fn replace(&self, prices: Vec<Price>, group_ratios: HashMap<String, f64>) {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        for price in prices {
            if price.model.ends_with('*') {
                patterns.push(price);
            } else {
                exact.insert(price.model.clone(), price);
            }
        }
        patterns.sort_by(|a, b| b.model.len().cmp(&a.model.len()).then_with(|| a.model.cmp(&b.model)));

        *self.inner.write() = Prices {
            exact,
            patterns,
            group_ratios,
        };
    }

    /// Price `model` for a caller in `group`; fails closed when unpriced
    pub fn quote(&self, model: &str, group: &str) -> RelayResult<PriceQuote> {
        let price = self.get_price(model).ok_or_else(|| RelayError::PricingNotFound {
            model: model.to_string(),
        })?;
        Ok(PriceQuote::new(model, price, self.group_ratio(group)))
    }

    /// Owner label for model listings
    #[must_use]
    pub fn owned_by(&self, model: &str) -> Option<String> {
        self.get_price(model).and_then(|p| p.owned_by)
    }
}

impl PricingTable for ModelPricingTable {
    fn get_price(&self, model: &str) -> Option<Price> {
        let inner = self.inner.read();
        if let Some(price) = inner.exact.get(model) {
            return Some(price.clone());
        }
        inner
            .patterns
            .iter()
            .find(|p| model_matches(&p.model, model))
            .cloned()
    }

    fn group_ratio(&self, group: &str) -> f64 {
        self.inner.read().group_ratios.get(group).copied().unwrap_or(1.0)
    }

    fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.inner.read().exact.keys().cloned().collect();
        models.sort();
        models
    }
}

/// Resolved price for one request
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    /// Caller-facing model name
    pub model: String,
    /// Price entry that matched
    pub price: Price,
    /// Group multiplier
    pub group_ratio: f64,
    /// Quota per prompt token, group ratio applied
    pub input_ratio: f64,
    /// Quota per completion token, group ratio applied
    pub output_ratio: f64,
}

impl PriceQuote {
    /// Combine a price entry with a group ratio
    #[must_use]
    pub fn new(model: impl Into<String>, price: Price, group_ratio: f64) -> Self {
        let input = price.input.max(0.0);
        let output = if price.price_type == PriceType::Times {
            0.0
        } else {
            price.output.max(0.0)
        };
        Self {
            model: model.into(),
            input_ratio: input * group_ratio,
            output_ratio: output * group_ratio,
            price,
            group_ratio,
        }
    }

    /// Amount reserved before the upstream call; `extra` is the configured
    /// additive reserve for token-priced models
    #[must_use]
    pub fn pre_consumed(&self, prompt_tokens: u32, extra: i64) -> i64 {
        match self.price.price_type {
            PriceType::Times => ceil_quota(TIMES_BASE * self.input_ratio),
            PriceType::Tokens => {
                ceil_quota(f64::from(prompt_tokens) * self.input_ratio) + extra.max(0)
            }
        }
    }

    /// True charge for settled usage.
    ///
    /// Token-priced usage with a non-zero input ratio costs at least 1; a
    /// response with zero total tokens costs nothing.
    #[must_use]
    pub fn charge(&self, usage: &Usage) -> i64 {
        let mut quota = match self.price.price_type {
            PriceType::Times => ceil_quota(TIMES_BASE * self.input_ratio),
            PriceType::Tokens => ceil_quota(
                f64::from(usage.prompt_tokens) * self.input_ratio
                    + f64::from(usage.completion_tokens) * self.output_ratio,
            ),
        };
        if self.input_ratio != 0.0 && quota <= 0 {
            quota = 1;
        }
        if usage.prompt_tokens + usage.completion_tokens == 0 {
            quota = 0;
        }
        quota
    }

    /// Human readable pricing summary stored with the usage log
    #[must_use]
    pub fn describe(&self) -> String {
        let input = self.price.input.max(0.0) * DOLLAR_RATE;
        let output = self.price.output.max(0.0) * DOLLAR_RATE;
        let rate = match self.price.price_type {
            PriceType::Times => format!("${input}/call"),
            PriceType::Tokens if (input - output).abs() < f64::EPSILON => format!("${input}/1k"),
            PriceType::Tokens => format!("${input}/1k (input) | ${output}/1k (output)"),
        };
        format!("model price {rate}, group ratio {:.2}", self.group_ratio)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn ceil_quota(value: f64) -> i64 {
    if value.is_finite() {
        value.ceil() as i64
    } else {
        0
    }
}
