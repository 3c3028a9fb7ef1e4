//! Click SHOP API wire types: the form-encoded webhook request, the JSON
//! response and the numeric error vocabulary.

use serde::{Deserialize, Serialize};

use crate::payments::utils::{md5_hex, secure_eq};

pub const SUCCESS: i32 = 0;
pub const SIGN_CHECK_FAILED: i32 = -1;
pub const INCORRECT_AMOUNT: i32 = -2;
pub const ACTION_NOT_FOUND: i32 = -3;
pub const ALREADY_PAID: i32 = -4;
pub const USER_DOES_NOT_EXIST: i32 = -5;
pub const TRANSACTION_DOES_NOT_EXIST: i32 = -6;
pub const FAILED_TO_UPDATE_USER: i32 = -7;
pub const ERROR_IN_REQUEST_FROM_CLICK: i32 = -8;
pub const TRANSACTION_CANCELLED: i32 = -9;

/// Code Click reports in Complete's `error` when the payer cancelled.
pub const CLICK_CANCELLED: i32 = -5017;

pub const ACTION_PREPARE: &str = "0";
pub const ACTION_COMPLETE: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("click error {code}: {note}")]
pub struct ClickError {
    pub code: i32,
    pub note: &'static str,
}

impl ClickError {
    const fn new(code: i32, note: &'static str) -> Self {
        Self { code, note }
    }

    pub const fn sign_check_failed() -> Self {
        Self::new(SIGN_CHECK_FAILED, "SIGN CHECK FAILED!")
    }

    pub const fn incorrect_amount() -> Self {
        Self::new(INCORRECT_AMOUNT, "Incorrect parameter amount")
    }

    pub const fn action_not_found() -> Self {
        Self::new(ACTION_NOT_FOUND, "Action not found")
    }

    pub const fn already_paid() -> Self {
        Self::new(ALREADY_PAID, "Already paid")
    }

    pub const fn user_does_not_exist() -> Self {
        Self::new(USER_DOES_NOT_EXIST, "User does not exist")
    }

    pub const fn transaction_does_not_exist() -> Self {
        Self::new(TRANSACTION_DOES_NOT_EXIST, "Transaction does not exist")
    }

    pub const fn failed_to_update() -> Self {
        Self::new(FAILED_TO_UPDATE_USER, "Failed to update user")
    }

    pub const fn bad_request() -> Self {
        Self::new(ERROR_IN_REQUEST_FROM_CLICK, "Error in request from click")
    }

    pub const fn cancelled() -> Self {
        Self::new(TRANSACTION_CANCELLED, "Transaction cancelled")
    }
}

/// Webhook form body. Everything is optional here so a missing field becomes
/// a protocol error instead of an extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClickRequest {
    pub click_trans_id: Option<String>,
    pub service_id: Option<String>,
    pub click_paydoc_id: Option<String>,
    pub merchant_trans_id: Option<String>,
    pub merchant_prepare_id: Option<String>,
    pub amount: Option<String>,
    pub action: Option<String>,
    pub error: Option<String>,
    pub error_note: Option<String>,
    pub sign_time: Option<String>,
    pub sign_string: Option<String>,
}

/// Prepare fields, all present and non-empty.
#[derive(Debug, Clone)]
pub struct PrepareFields {
    pub click_trans_id: String,
    pub service_id: String,
    pub click_paydoc_id: String,
    pub merchant_trans_id: String,
    /// Exactly as sent; the signature covers these bytes
    pub amount: String,
    pub action: String,
    pub sign_time: String,
    pub sign_string: String,
}

#[derive(Debug, Clone)]
pub struct CompleteFields {
    pub base: PrepareFields,
    pub merchant_prepare_id: String,
    pub error: i32,
    pub error_note: Option<String>,
}

/// Present and not blank. The value is returned as sent: signatures cover
/// the literal bytes.
fn required(value: &Option<String>) -> Result<String, ClickError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(ClickError::bad_request()),
    }
}

impl ClickRequest {
    pub fn prepare_fields(&self) -> Result<PrepareFields, ClickError> {
        Ok(PrepareFields {
            click_trans_id: required(&self.click_trans_id)?,
            service_id: required(&self.service_id)?,
            click_paydoc_id: required(&self.click_paydoc_id)?,
            merchant_trans_id: required(&self.merchant_trans_id)?,
            amount: required(&self.amount)?,
            action: required(&self.action)?,
            sign_time: required(&self.sign_time)?,
            sign_string: required(&self.sign_string)?,
        })
    }

    pub fn complete_fields(&self) -> Result<CompleteFields, ClickError> {
        let base = self.prepare_fields()?;
        let merchant_prepare_id = required(&self.merchant_prepare_id)?;
        let error = required(&self.error)?
            .trim()
            .parse::<i32>()
            .map_err(|_| ClickError::bad_request())?;
        Ok(CompleteFields {
            base,
            merchant_prepare_id,
            error,
            error_note: self.error_note.clone().filter(|n| !n.is_empty()),
        })
    }
}

/// md5(click_trans_id + service_id + secret + merchant_trans_id
///     [+ merchant_prepare_id] + amount + action + sign_time)
pub fn expected_signature(
    fields: &PrepareFields,
    secret_key: &str,
    merchant_prepare_id: Option<&str>,
) -> String {
    let mut input = String::with_capacity(128);
    input.push_str(&fields.click_trans_id);
    input.push_str(&fields.service_id);
    input.push_str(secret_key);
    input.push_str(&fields.merchant_trans_id);
    if let Some(prepare_id) = merchant_prepare_id {
        input.push_str(prepare_id);
    }
    input.push_str(&fields.amount);
    input.push_str(&fields.action);
    input.push_str(&fields.sign_time);
    md5_hex(&input)
}

pub fn verify_prepare_signature(fields: &PrepareFields, secret_key: &str) -> bool {
    signature_matches(&expected_signature(fields, secret_key, None), &fields.sign_string)
}

pub fn verify_complete_signature(fields: &CompleteFields, secret_key: &str) -> bool {
    let expected = expected_signature(&fields.base, secret_key, Some(&fields.merchant_prepare_id));
    signature_matches(&expected, &fields.base.sign_string)
}

fn signature_matches(expected_hex: &str, supplied: &str) -> bool {
    secure_eq(
        expected_hex.as_bytes(),
        supplied.to_ascii_lowercase().as_bytes(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickResponse {
    pub click_trans_id: String,
    pub merchant_trans_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_prepare_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_confirm_id: Option<String>,
    pub error: i32,
    pub error_note: String,
}

impl ClickResponse {
    pub fn prepared(fields: &PrepareFields, merchant_prepare_id: String) -> Self {
        Self {
            click_trans_id: fields.click_trans_id.clone(),
            merchant_trans_id: fields.merchant_trans_id.clone(),
            merchant_prepare_id: Some(merchant_prepare_id),
            merchant_confirm_id: None,
            error: SUCCESS,
            error_note: "Success".to_string(),
        }
    }

    pub fn confirmed(fields: &PrepareFields, merchant_confirm_id: String) -> Self {
        Self {
            click_trans_id: fields.click_trans_id.clone(),
            merchant_trans_id: fields.merchant_trans_id.clone(),
            merchant_prepare_id: None,
            merchant_confirm_id: Some(merchant_confirm_id),
            error: SUCCESS,
            error_note: "Success".to_string(),
        }
    }

    /// Echoes whatever correlation ids the request carried.
    pub fn rejected(request: &ClickRequest, err: &ClickError) -> Self {
        Self {
            click_trans_id: request.click_trans_id.clone().unwrap_or_default(),
            merchant_trans_id: request.merchant_trans_id.clone().unwrap_or_default(),
            merchant_prepare_id: None,
            merchant_confirm_id: None,
            error: err.code,
            error_note: err.note.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ClickRequest {
        ClickRequest {
            click_trans_id: Some("2222".to_string()),
            service_id: Some("31".to_string()),
            click_paydoc_id: Some("9001".to_string()),
            merchant_trans_id: Some("cart_1".to_string()),
            amount: Some("1500.00".to_string()),
            action: Some("0".to_string()),
            sign_time: Some("2026-01-10 12:00:00".to_string()),
            sign_string: Some(String::new()),
            ..Default::default()
        }
    }

    #[test]
    fn prepare_signature_covers_the_literal_amount() {
        let mut req = request();
        let err = req.prepare_fields().unwrap_err();
        assert_eq!(err.code, ERROR_IN_REQUEST_FROM_CLICK);

        let raw = "222231secretcart_11500.0002026-01-10 12:00:00";
        req.sign_string = Some(md5_hex(raw).to_uppercase());
        let fields = req.prepare_fields().unwrap();
        assert!(verify_prepare_signature(&fields, "secret"));

        let mut reformatted = fields.clone();
        reformatted.amount = "1500".to_string();
        assert!(!verify_prepare_signature(&reformatted, "secret"));
        assert!(!verify_prepare_signature(&fields, "other"));
    }

    #[test]
    fn complete_signature_includes_prepare_id() {
        let raw = "222231secretcart_122221500.0012026-01-10 12:00:00";
        let req = ClickRequest {
            action: Some("1".to_string()),
            merchant_prepare_id: Some("2222".to_string()),
            error: Some("0".to_string()),
            sign_string: Some(md5_hex(raw)),
            ..request()
        };
        let fields = req.complete_fields().unwrap();
        assert!(verify_complete_signature(&fields, "secret"));
        assert_eq!(fields.error, 0);
    }

    #[test]
    fn complete_requires_numeric_error() {
        let req = ClickRequest {
            action: Some("1".to_string()),
            merchant_prepare_id: Some("2222".to_string()),
            error: Some("oops".to_string()),
            sign_string: Some("x".to_string()),
            ..request()
        };
        assert_eq!(req.complete_fields().unwrap_err(), ClickError::bad_request());
    }

    #[test]
    fn rejection_echoes_correlation_ids() {
        let response = ClickResponse::rejected(&request(), &ClickError::incorrect_amount());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["click_trans_id"], "2222");
        assert_eq!(json["error"], -2);
        assert!(json.get("merchant_prepare_id").is_none());
    }

    #[test]
    fn signed_fields_are_kept_byte_for_byte() {
        let raw = "222231secretcart_1 1500.00 02026-01-10 12:00:00";
        let req = ClickRequest {
            amount: Some(" 1500.00 ".to_string()),
            sign_string: Some(format!("{} ", md5_hex(raw))),
            ..request()
        };
        let fields = req.prepare_fields().unwrap();
        assert_eq!(fields.amount, " 1500.00 ");
        // The padded signature is not a valid digest
        assert!(!verify_prepare_signature(&fields, "secret"));

        let exact = ClickRequest {
            sign_string: Some(md5_hex(raw)),
            ..req
        };
        assert!(verify_prepare_signature(&exact.prepare_fields().unwrap(), "secret"));

        let blank = ClickRequest {
            amount: Some("   ".to_string()),
            ..request()
        };
        assert_eq!(blank.prepare_fields().unwrap_err(), ClickError::bad_request());
    }
}
