//! Medusa storefront backend: sessions from Postgres, carts over the Store API.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::str::FromStr;
use tracing::{info, warn};

use super::{Cart, CartLineItem, CommerceBackend, CommerceConfig, CommerceError, CommerceResult};
use crate::database::payment_session_repository::{MergeOutcome, PaymentSessionRepository};
use crate::payments::amount::decimal_to_minor_units;
use crate::payments::types::{PaymentSession, SessionData};
use crate::payments::utils::PaymentHttpClient;

const PUBLISHABLE_KEY_HEADER: &str = "x-publishable-api-key";
const CART_FIELDS: &str = "*items,*items.product,shipping_total,total,completed_at";

#[derive(Debug, Deserialize)]
struct CartEnvelope {
    cart: StoreCart,
}

#[derive(Debug, Deserialize)]
struct StoreCart {
    id: String,
    currency_code: String,
    #[serde(default)]
    items: Vec<StoreLineItem>,
    #[serde(default)]
    shipping_total: Option<JsonValue>,
    total: JsonValue,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct StoreLineItem {
    id: String,
    title: String,
    quantity: u32,
    total: JsonValue,
    #[serde(default)]
    metadata: Option<Map<String, JsonValue>>,
    #[serde(default)]
    product: Option<StoreProduct>,
}

#[derive(Debug, Deserialize)]
struct StoreProduct {
    #[serde(default)]
    metadata: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    order: Option<OrderRef>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    id: String,
}

/// Store API numbers arrive as JSON numbers or numeric strings, in major units.
fn minor_from_json(field: &str, value: &JsonValue) -> CommerceResult<i64> {
    let text = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => "0".to_string(),
        other => {
            return Err(CommerceError::InvalidData(format!(
                "{} is not numeric: {}",
                field, other
            )))
        }
    };
    BigDecimal::from_str(&text)
        .ok()
        .and_then(|d| decimal_to_minor_units(&d))
        .ok_or_else(|| CommerceError::InvalidData(format!("{} is not an amount: {}", field, text)))
}

impl TryFrom<StoreCart> for Cart {
    type Error = CommerceError;

    fn try_from(cart: StoreCart) -> Result<Self, Self::Error> {
        let items = cart
            .items
            .into_iter()
            .map(|item| {
                let mut metadata = item
                    .product
                    .and_then(|p| p.metadata)
                    .unwrap_or_default();
                if let Some(own) = item.metadata {
                    metadata.extend(own);
                }
                Ok(CartLineItem {
                    total_minor: minor_from_json("item.total", &item.total)?,
                    id: item.id,
                    title: item.title,
                    quantity: item.quantity,
                    metadata,
                })
            })
            .collect::<CommerceResult<Vec<_>>>()?;

        Ok(Cart {
            shipping_total_minor: match &cart.shipping_total {
                Some(v) => minor_from_json("shipping_total", v)?,
                None => 0,
            },
            total_minor: minor_from_json("total", &cart.total)?,
            id: cart.id,
            currency_code: cart.currency_code,
            items,
            completed_at: cart.completed_at,
        })
    }
}

pub struct MedusaCommerceBackend {
    sessions: PaymentSessionRepository,
    http: PaymentHttpClient,
    config: CommerceConfig,
}

impl MedusaCommerceBackend {
    pub fn new(sessions: PaymentSessionRepository, config: CommerceConfig) -> CommerceResult<Self> {
        let http = PaymentHttpClient::new("medusa", config.timeout, config.max_retries)?;
        Ok(Self {
            sessions,
            http,
            config,
        })
    }

    fn headers(&self) -> Vec<(&str, &str)> {
        self.config
            .publishable_key
            .as_deref()
            .map(|key| vec![(PUBLISHABLE_KEY_HEADER, key)])
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommerceBackend for MedusaCommerceBackend {
    async fn find_session_by_id(&self, id: &str) -> CommerceResult<Option<PaymentSession>> {
        Ok(self.sessions.find_by_id(id).await?)
    }

    async fn find_session_by_cart_id(
        &self,
        cart_id: &str,
    ) -> CommerceResult<Option<PaymentSession>> {
        Ok(self.sessions.find_by_cart_id(cart_id).await?)
    }

    async fn find_session_by_payme_transaction_id(
        &self,
        transaction_id: &str,
    ) -> CommerceResult<Option<PaymentSession>> {
        Ok(self
            .sessions
            .find_by_payme_transaction_id(transaction_id)
            .await?)
    }

    async fn update_session_data(
        &self,
        id: &str,
        expected_version: i64,
        patch: SessionData,
    ) -> CommerceResult<PaymentSession> {
        match self.sessions.merge_data(id, expected_version, &patch).await? {
            MergeOutcome::Updated(session) => Ok(session),
            MergeOutcome::Conflict => Err(CommerceError::VersionConflict {
                id: id.to_string(),
                expected_version,
            }),
            MergeOutcome::Missing => Err(CommerceError::NotFound {
                entity: "payment session",
                id: id.to_string(),
            }),
        }
    }

    async fn list_payme_sessions(&self, from: i64, to: i64) -> CommerceResult<Vec<PaymentSession>> {
        Ok(self.sessions.list_payme_between(from, to).await?)
    }

    async fn list_sessions_pending_completion(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> CommerceResult<Vec<PaymentSession>> {
        Ok(self
            .sessions
            .list_pending_completion(limit, max_attempts)
            .await?)
    }

    async fn retrieve_cart(&self, cart_id: &str) -> CommerceResult<Cart> {
        let url = format!(
            "{}/store/carts/{}?fields={}",
            self.config.api_url, cart_id, CART_FIELDS
        );
        let envelope: CartEnvelope = self
            .http
            .request_json(Method::GET, &url, None, &self.headers())
            .await
            .map_err(|e| match CommerceError::from(e) {
                CommerceError::Http { status: 404, .. } => CommerceError::NotFound {
                    entity: "cart",
                    id: cart_id.to_string(),
                },
                other => other,
            })?;
        envelope.cart.try_into()
    }

    async fn complete_cart(&self, cart_id: &str) -> CommerceResult<String> {
        let url = format!("{}/store/carts/{}/complete", self.config.api_url, cart_id);
        let response: CompleteResponse = self
            .http
            .request_json(Method::POST, &url, None, &self.headers())
            .await?;

        let order_id = match (response.kind.as_str(), response.order) {
            ("order", Some(order)) => order.id,
            _ => {
                let reason = response
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("completion returned type '{}'", response.kind));
                return Err(CommerceError::CompletionFailed(reason));
            }
        };

        match self.sessions.mark_completed_by_cart(cart_id).await {
            Ok(rows) => info!(cart_id = %cart_id, order_id = %order_id, sessions = rows, "Cart completed"),
            Err(e) => warn!(
                cart_id = %cart_id,
                order_id = %order_id,
                error = %e,
                "Order placed but session completion flag not written"
            ),
        }
        Ok(order_id)
    }

    async fn ping(&self) -> CommerceResult<()> {
        crate::database::health_check(self.sessions.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_cart_converts_to_minor_units_with_merged_metadata() {
        let raw = json!({
            "cart": {
                "id": "cart_01",
                "currency_code": "uzs",
                "items": [{
                    "id": "item_1",
                    "title": "Tea",
                    "quantity": 3,
                    "total": 100.01,
                    "metadata": {"package_code": "1500"},
                    "product": {"metadata": {"tax_code": "10999001001000000", "package_code": "999"}}
                }],
                "shipping_total": "25000",
                "total": "25100.01",
                "completed_at": null
            }
        });
        let envelope: CartEnvelope = serde_json::from_value(raw).unwrap();
        let cart: Cart = envelope.cart.try_into().unwrap();

        assert_eq!(cart.total_minor, 2_510_001);
        assert_eq!(cart.shipping_total_minor, 2_500_000);
        assert_eq!(cart.items[0].total_minor, 10_001);
        assert_eq!(cart.items[0].metadata["package_code"], json!("1500"));
        assert_eq!(cart.items[0].metadata["tax_code"], json!("10999001001000000"));
    }

    #[test]
    fn non_numeric_amount_is_invalid_data() {
        let err = minor_from_json("total", &json!(true)).unwrap_err();
        assert!(matches!(err, CommerceError::InvalidData(_)));
    }
}
