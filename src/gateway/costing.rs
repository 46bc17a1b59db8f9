use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prices are quoted per this many tokens.
pub const PRICE_UNIT: f64 = 1000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitPrice {
    /// Amount per [`PRICE_UNIT`] prompt tokens.
    pub price: f64,
    /// Completion tokens cost `price * completion_ratio`.
    pub completion_ratio: f64,
}

impl UnitPrice {
    pub fn completion_price(&self) -> f64 {
        self.price * self.completion_ratio
    }

    /// Upper-bound spend for a call before the real usage is known.
    pub fn estimate(&self, prompt_tokens: u32, max_completion_tokens: u32) -> f64 {
        let tokens = u64::from(prompt_tokens) + u64::from(max_completion_tokens);
        tokens as f64 * self.price / PRICE_UNIT
    }

    /// Actual spend; a call that produced no tokens costs nothing.
    pub fn amount(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        if prompt_tokens == 0 && completion_tokens == 0 {
            return 0.0;
        }
        (f64::from(prompt_tokens) + f64::from(completion_tokens) * self.completion_ratio)
            * self.price
            / PRICE_UNIT
    }
}

#[derive(Debug, Error)]
pub enum PriceTableError {
    #[error("invalid price for {model}: {value}")]
    InvalidPrice { model: String, value: f64 },
    #[error("invalid completion ratio for {model}: {value}")]
    InvalidRatio { model: String, value: f64 },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-model prices. Keys are either `model` or `model(channel_type)`; the
/// channel-type form wins.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub model_price: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    /// Used for models without an entry. Without it such models are unpriced.
    pub default_price: Option<f64>,
}

impl PriceTable {
    pub fn from_json_str(raw: &str) -> Result<Self, PriceTableError> {
        let table: Self = serde_json::from_str(raw)?;
        table.validate()?;
        Ok(table)
    }

    pub fn with_price(mut self, model: impl Into<String>, price: f64) -> Self {
        self.model_price.insert(model.into(), price);
        self
    }

    pub fn with_completion_ratio(mut self, model: impl Into<String>, ratio: f64) -> Self {
        self.completion_ratio.insert(model.into(), ratio);
        self
    }

    pub fn with_default_price(mut self, price: f64) -> Self {
        self.default_price = Some(price);
        self
    }

    pub fn validate(&self) -> Result<(), PriceTableError> {
        for (model, value) in &self.model_price {
            if !value.is_finite() || *value < 0.0 {
                return Err(PriceTableError::InvalidPrice {
                    model: model.clone(),
                    value: *value,
                });
            }
        }
        if let Some(value) = self.default_price {
            if !value.is_finite() || value < 0.0 {
                return Err(PriceTableError::InvalidPrice {
                    model: "<default>".to_string(),
                    value,
                });
            }
        }
        for (model, value) in &self.completion_ratio {
            if !value.is_finite() || *value < 0.0 {
                return Err(PriceTableError::InvalidRatio {
                    model: model.clone(),
                    value: *value,
                });
            }
        }
        Ok(())
    }

    pub fn unit_price(&self, model: &str, channel_type: i32) -> Option<UnitPrice> {
        let typed = format!("{model}({channel_type})");
        let price = self
            .model_price
            .get(&typed)
            .or_else(|| self.model_price.get(model))
            .copied()
            .or(self.default_price)?;
        let completion_ratio = self
            .completion_ratio
            .get(&typed)
            .or_else(|| self.completion_ratio.get(model))
            .copied()
            .unwrap_or(1.0);
        Some(UnitPrice {
            price,
            completion_ratio,
        })
    }
}

/// Hot-swappable handle to the active [`PriceTable`].
#[derive(Debug, Default)]
pub struct Prices {
    table: RwLock<Arc<PriceTable>>,
}

impl Prices {
    pub fn new(table: PriceTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn current(&self) -> Arc<PriceTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, table: PriceTable) -> Result<(), PriceTableError> {
        table.validate()?;
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        Ok(())
    }

    pub fn unit_price(&self, model: &str, channel_type: i32) -> Option<UnitPrice> {
        self.current().unit_price(model, channel_type)
    }
}
