//! Per-model token prices.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::stats::{Cost, Usage};

/// Price per token, in dollars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Price of one input token.
    pub input: Decimal,
    /// Price of one output token.
    pub output: Decimal,
}

impl ModelPrice {
    /// Create a price pair.
    pub fn new(input: Decimal, output: Decimal) -> Self {
        Self { input, output }
    }

    /// Cost of the given usage at this price.
    pub fn cost(&self, usage: Usage) -> Decimal {
        self.input * Decimal::from(usage.input) + self.output * Decimal::from(usage.output)
    }
}

/// Price lookup keyed by model id.
///
/// Provider prefixes are stripped before lookup, so `"openai/gpt-4o"` and
/// `"gpt-4o"` share an entry. A model without an entry has an unknown cost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    /// A table with no prices: every cost is unknown.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A table with prices for common hosted models.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        for (ids, input, output) in [
            (&["gpt-4o"][..], dec!(0.0000025), dec!(0.00001)),
            (&["gpt-4o-mini"][..], dec!(0.00000015), dec!(0.0000006)),
            (&["gpt-4.1"][..], dec!(0.000002), dec!(0.000008)),
            (&["gpt-4.1-mini"][..], dec!(0.0000004), dec!(0.0000016)),
            (&["o3", "o4-mini"][..], dec!(0.0000011), dec!(0.0000044)),
            (
                &["claude-opus-4-1", "claude-opus-4-0"][..],
                dec!(0.000015),
                dec!(0.000075),
            ),
            (
                &["claude-sonnet-4-5", "claude-sonnet-4-0", "claude-3-7-sonnet-latest"][..],
                dec!(0.000003),
                dec!(0.000015),
            ),
            (
                &["claude-haiku-4-5", "claude-3-5-haiku-latest"][..],
                dec!(0.0000008),
                dec!(0.000004),
            ),
        ] {
            for id in ids {
                table.insert(*id, ModelPrice::new(input, output));
            }
        }
        table
    }

    /// Set the price of a model, replacing any previous entry.
    pub fn insert(&mut self, model: impl AsRef<str>, price: ModelPrice) {
        self.prices
            .insert(normalize(model.as_ref()).to_string(), price);
    }

    /// Builder-style [`PriceTable::insert`].
    pub fn with(mut self, model: impl AsRef<str>, price: ModelPrice) -> Self {
        self.insert(model, price);
        self
    }

    /// Price of a model, if known.
    pub fn get(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(normalize(model)).copied()
    }

    /// Cost of `usage` on `model`.
    pub fn cost(&self, model: &str, usage: Usage) -> Cost {
        match self.get(model) {
            Some(price) => Cost::Known(price.cost(usage)),
            None => Cost::Unknown,
        }
    }
}

/// Strip a provider prefix: `"openai/gpt-4o"` becomes `"gpt-4o"`.
fn normalize(model: &str) -> &str {
    model
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(model)
}
