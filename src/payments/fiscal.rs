//! Tax-receipt line items derived from a cart.
//!
//! Receipts must add up to the charged amount to the tiyin. A cart that
//! cannot produce such a receipt is not payable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::commerce::{Cart, CartLineItem};
use crate::config::{env_opt, env_parse, ConfigError};
use crate::payments::error::PaymentResult;

/// Metadata keys holding the product classification (MXIK) code.
const TAX_CODE_KEYS: [&str; 3] = ["tax_code", "mxik", "ikpu"];
const PACKAGE_CODE_KEY: &str = "package_code";
const VAT_PERCENT_KEY: &str = "vat_percent";
pub const SHIPPING_TITLE: &str = "Yetkazib berish";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalItem {
    pub title: String,
    pub unit_price_minor: i64,
    pub count: u32,
    pub tax_code: String,
    pub vat_percent: u32,
    pub package_code: Option<String>,
}

impl FiscalItem {
    pub fn line_total(&self) -> i64 {
        self.unit_price_minor * i64::from(self.count)
    }
}

/// Server-to-server delivery of receipt items after payment.
#[async_trait]
pub trait FiscalSubmitter: Send + Sync {
    async fn submit_items(
        &self,
        payment_id: &str,
        items: &[FiscalItem],
        received_card_minor: i64,
    ) -> PaymentResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiscalizationError {
    #[error("item '{item}' has no tax classification code")]
    MissingTaxCode { item: String },

    #[error("item '{item}' has invalid quantity {quantity}")]
    InvalidQuantity { item: String, quantity: u32 },

    #[error("item '{item}' has a negative total")]
    NegativeAmount { item: String },

    #[error("cart has nothing to fiscalize")]
    Empty,

    #[error("receipt sums to {actual} but {expected} was charged")]
    SumMismatch { expected: i64, actual: i64 },
}

/// Shipping codes, default VAT and the drift we are willing to absorb.
#[derive(Debug, Clone)]
pub struct FiscalPolicy {
    pub shipping_tax_code: Option<String>,
    pub shipping_package_code: Option<String>,
    pub default_vat_percent: u32,
    /// Absolute ceiling for the single corrective adjustment
    pub max_adjust_minor: i64,
    /// Relative ceiling, percent of the expected total
    pub max_adjust_percent: u32,
}

impl Default for FiscalPolicy {
    fn default() -> Self {
        Self {
            shipping_tax_code: None,
            shipping_package_code: None,
            default_vat_percent: 12,
            max_adjust_minor: 10_000,
            max_adjust_percent: 2,
        }
    }
}

impl FiscalPolicy {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            shipping_tax_code: env_opt("FISCAL_SHIPPING_TAX_CODE"),
            shipping_package_code: env_opt("FISCAL_SHIPPING_PACKAGE_CODE"),
            default_vat_percent: env_parse(
                "FISCAL_DEFAULT_VAT_PERCENT",
                defaults.default_vat_percent,
            )?,
            max_adjust_minor: env_parse("FISCAL_MAX_ADJUST_MINOR", defaults.max_adjust_minor)?,
            max_adjust_percent: env_parse(
                "FISCAL_MAX_ADJUST_PERCENT",
                defaults.max_adjust_percent,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_vat_percent > 100 {
            return Err(ConfigError::InvalidValue(
                "FISCAL_DEFAULT_VAT_PERCENT".to_string(),
            ));
        }
        if self.max_adjust_minor < 0 || self.max_adjust_percent > 100 {
            return Err(ConfigError::ValidationFailed(
                "fiscal adjustment bounds out of range".to_string(),
            ));
        }
        Ok(())
    }

    /// Largest |drift| the builder corrects for a given total.
    pub fn adjustment_bound(&self, expected_total: i64) -> i64 {
        let relative = expected_total.max(0) * i64::from(self.max_adjust_percent) / 100;
        self.max_adjust_minor.min(relative)
    }
}

fn metadata_str(item: &CartLineItem, key: &str) -> Option<String> {
    match item.metadata.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn metadata_u32(item: &CartLineItem, key: &str) -> Option<u32> {
    match item.metadata.get(key)? {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Split a line total over its units: one entry when it divides evenly,
/// otherwise the remainder rides on a single first unit.
fn split_line(
    title: &str,
    total: i64,
    quantity: u32,
    template: &FiscalItem,
) -> Vec<FiscalItem> {
    let qty = i64::from(quantity);
    let unit = total / qty;
    let remainder = total - unit * qty;

    if remainder == 0 {
        return vec![FiscalItem {
            title: title.to_string(),
            unit_price_minor: unit,
            count: quantity,
            ..template.clone()
        }];
    }

    let mut entries = vec![FiscalItem {
        title: title.to_string(),
        unit_price_minor: unit + remainder,
        count: 1,
        ..template.clone()
    }];
    if quantity > 1 {
        entries.push(FiscalItem {
            title: title.to_string(),
            unit_price_minor: unit,
            count: quantity - 1,
            ..template.clone()
        });
    }
    entries
}

pub fn receipt_total(items: &[FiscalItem]) -> i64 {
    items.iter().map(FiscalItem::line_total).sum()
}

/// Build receipt items for `cart` that sum exactly to `expected_total`.
pub fn build_fiscal_items(
    cart: &Cart,
    expected_total: i64,
    policy: &FiscalPolicy,
) -> Result<Vec<FiscalItem>, FiscalizationError> {
    let mut items = Vec::with_capacity(cart.items.len() + 1);

    for line in &cart.items {
        if line.quantity == 0 {
            return Err(FiscalizationError::InvalidQuantity {
                item: line.title.clone(),
                quantity: line.quantity,
            });
        }
        if line.total_minor < 0 {
            return Err(FiscalizationError::NegativeAmount {
                item: line.title.clone(),
            });
        }
        let tax_code = TAX_CODE_KEYS
            .iter()
            .find_map(|key| metadata_str(line, key))
            .ok_or_else(|| FiscalizationError::MissingTaxCode {
                item: line.title.clone(),
            })?;
        let template = FiscalItem {
            title: String::new(),
            unit_price_minor: 0,
            count: 0,
            tax_code,
            vat_percent: metadata_u32(line, VAT_PERCENT_KEY)
                .unwrap_or(policy.default_vat_percent),
            package_code: metadata_str(line, PACKAGE_CODE_KEY),
        };
        items.extend(split_line(&line.title, line.total_minor, line.quantity, &template));
    }

    if cart.shipping_total_minor > 0 {
        let tax_code =
            policy
                .shipping_tax_code
                .clone()
                .ok_or_else(|| FiscalizationError::MissingTaxCode {
                    item: SHIPPING_TITLE.to_string(),
                })?;
        items.push(FiscalItem {
            title: SHIPPING_TITLE.to_string(),
            unit_price_minor: cart.shipping_total_minor,
            count: 1,
            tax_code,
            vat_percent: policy.default_vat_percent,
            package_code: policy.shipping_package_code.clone(),
        });
    }

    if items.is_empty() {
        return Err(FiscalizationError::Empty);
    }

    let actual = receipt_total(&items);
    let drift = expected_total - actual;
    if drift == 0 {
        return Ok(items);
    }
    if drift.abs() > policy.adjustment_bound(expected_total) {
        return Err(FiscalizationError::SumMismatch {
            expected: expected_total,
            actual,
        });
    }

    absorb_drift(&mut items, drift);

    let corrected = receipt_total(&items);
    if corrected != expected_total || items.iter().any(|i| i.unit_price_minor < 0) {
        return Err(FiscalizationError::SumMismatch {
            expected: expected_total,
            actual,
        });
    }
    Ok(items)
}

/// Put the whole drift on one unit of the last item, splitting that unit
/// off when the item covers several.
fn absorb_drift(items: &mut Vec<FiscalItem>, drift: i64) {
    let Some(last) = items.last_mut() else {
        return;
    };
    if last.count == 1 {
        last.unit_price_minor += drift;
        return;
    }
    last.count -= 1;
    let adjusted = FiscalItem {
        unit_price_minor: last.unit_price_minor + drift,
        count: 1,
        ..last.clone()
    };
    items.push(adjusted);
}
