//! Payme Merchant API wire types: JSON-RPC envelope, params, results and the
//! numeric error vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::payments::fiscal::FiscalItem;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INSUFFICIENT_PRIVILEGE: i32 = -32504;
pub const SYSTEM_ERROR: i32 = -32400;
pub const INVALID_AMOUNT: i32 = -31001;
pub const TRANSACTION_NOT_FOUND: i32 = -31003;
pub const COULD_NOT_PERFORM: i32 = -31008;
pub const INVALID_ACCOUNT: i32 = -31050;
pub const ANOTHER_TRANSACTION_IN_PROGRESS: i32 = -31051;
pub const ORDER_ALREADY_PAID: i32 = -31099;

/// Cancel reason Payme defines for "transaction timed out".
pub const CANCEL_REASON_TIMEOUT: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalizedMessage {
    pub ru: &'static str,
    pub uz: &'static str,
    pub en: &'static str,
}

/// A protocol rejection, rendered as the JSON-RPC `error` member.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payme error {code}: {}", .message.en)]
pub struct PaymeError {
    pub code: i32,
    pub message: LocalizedMessage,
    pub data: Option<String>,
}

impl PaymeError {
    fn new(code: i32, ru: &'static str, uz: &'static str, en: &'static str) -> Self {
        Self {
            code,
            message: LocalizedMessage { ru, uz, en },
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn parse_error() -> Self {
        Self::new(
            PARSE_ERROR,
            "Ошибка разбора JSON",
            "JSON tahlil xatosi",
            "Parse error",
        )
    }

    pub fn invalid_request(reason: &str) -> Self {
        Self::new(
            INVALID_REQUEST,
            "Неверный запрос",
            "Noto'g'ri so'rov",
            "Invalid request",
        )
        .with_data(reason)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            METHOD_NOT_FOUND,
            "Метод не найден",
            "Metod topilmadi",
            "Method not found",
        )
        .with_data(method)
    }

    pub fn insufficient_privilege() -> Self {
        Self::new(
            INSUFFICIENT_PRIVILEGE,
            "Недостаточно привилегий",
            "Huquqlar yetarli emas",
            "Insufficient privilege",
        )
    }

    pub fn system_error() -> Self {
        Self::new(
            SYSTEM_ERROR,
            "Системная ошибка",
            "Tizim xatosi",
            "System error",
        )
    }

    pub fn invalid_amount() -> Self {
        Self::new(
            INVALID_AMOUNT,
            "Неверная сумма",
            "Noto'g'ri summa",
            "Invalid amount",
        )
        .with_data("amount")
    }

    pub fn transaction_not_found() -> Self {
        Self::new(
            TRANSACTION_NOT_FOUND,
            "Транзакция не найдена",
            "Tranzaksiya topilmadi",
            "Transaction not found",
        )
    }

    pub fn could_not_perform(reason: &str) -> Self {
        Self::new(
            COULD_NOT_PERFORM,
            "Невозможно выполнить операцию",
            "Amalni bajarib bo'lmaydi",
            "Could not perform this operation",
        )
        .with_data(reason)
    }

    pub fn invalid_account() -> Self {
        Self::new(
            INVALID_ACCOUNT,
            "Заказ не найден",
            "Buyurtma topilmadi",
            "Order not found",
        )
        .with_data("order_id")
    }

    pub fn another_transaction_in_progress() -> Self {
        Self::new(
            ANOTHER_TRANSACTION_IN_PROGRESS,
            "По заказу уже идёт другая транзакция",
            "Buyurtma bo'yicha boshqa tranzaksiya amalga oshirilmoqda",
            "Another transaction is in progress for this order",
        )
        .with_data("order_id")
    }

    pub fn already_paid() -> Self {
        Self::new(
            ORDER_ALREADY_PAID,
            "Заказ уже оплачен",
            "Buyurtma allaqachon to'langan",
            "Order already paid",
        )
        .with_data("order_id")
    }

    pub fn to_json(&self) -> JsonValue {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(data) = &self.data {
            error["data"] = JsonValue::String(data.clone());
        }
        error
    }
}

/// Raw JSON-RPC request; fields are optional so shape errors map to -32600.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: JsonValue,
    pub method: Option<String>,
    pub params: Option<JsonValue>,
}

pub fn rpc_result(id: &JsonValue, result: JsonValue) -> JsonValue {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn rpc_error(id: &JsonValue, error: &PaymeError) -> JsonValue {
    json!({ "jsonrpc": "2.0", "id": id, "error": error.to_json() })
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckPerformParams {
    pub amount: JsonValue,
    pub account: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateParams {
    pub id: String,
    pub time: i64,
    pub amount: JsonValue,
    pub account: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdParams {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelParams {
    pub id: String,
    pub reason: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatementParams {
    pub from: i64,
    pub to: i64,
}

/// Payme amounts are tiyin, normally integral; float noise is rounded away.
pub fn amount_tiyin(value: &JsonValue) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return (v >= 0).then_some(v);
    }
    let f = value.as_f64()?;
    (f.is_finite() && f >= 0.0 && f < i64::MAX as f64).then(|| f.round() as i64)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptItem {
    pub title: String,
    pub price: i64,
    pub count: u32,
    pub code: String,
    pub vat_percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_code: Option<String>,
}

impl From<&FiscalItem> for ReceiptItem {
    fn from(item: &FiscalItem) -> Self {
        Self {
            title: item.title.clone(),
            price: item.unit_price_minor,
            count: item.count,
            code: item.tax_code.clone(),
            vat_percent: item.vat_percent,
            package_code: item.package_code.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptDetail {
    pub receipt_type: u8,
    pub items: Vec<ReceiptItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckPerformResult {
    pub allow: bool,
    pub detail: ReceiptDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateResult {
    pub create_time: i64,
    pub transaction: String,
    pub state: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformResult {
    pub transaction: String,
    pub perform_time: i64,
    pub state: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResult {
    pub transaction: String,
    pub cancel_time: i64,
    pub state: i8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub create_time: i64,
    pub perform_time: i64,
    pub cancel_time: i64,
    pub transaction: String,
    pub state: i8,
    pub reason: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementAccount {
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementEntry {
    pub id: String,
    pub time: i64,
    pub amount: i64,
    pub account: StatementAccount,
    pub create_time: i64,
    pub perform_time: i64,
    pub cancel_time: i64,
    pub transaction: String,
    pub state: i8,
    pub reason: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementResult {
    pub transactions: Vec<StatementEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_renders_localized_message_and_data() {
        let rendered = PaymeError::invalid_account().to_json();
        assert_eq!(rendered["code"], -31050);
        assert_eq!(rendered["message"]["en"], "Order not found");
        assert_eq!(rendered["data"], "order_id");
        assert!(PaymeError::system_error().to_json().get("data").is_none());
    }

    #[test]
    fn amount_accepts_integral_and_float_tiyin() {
        assert_eq!(amount_tiyin(&json!(150000)), Some(150_000));
        assert_eq!(amount_tiyin(&json!(150000.0000001)), Some(150_000));
        assert_eq!(amount_tiyin(&json!(-5)), None);
        assert_eq!(amount_tiyin(&json!("150000")), None);
    }
}
