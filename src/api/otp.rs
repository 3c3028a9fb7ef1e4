//! POST /auth/otp/request and /auth/otp/verify

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{AppError, AppResult, ValidationError};
use crate::middleware::error::get_request_id_from_headers;

#[derive(Debug, Deserialize)]
pub struct OtpRequestBody {
    pub phone: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OtpVerifyBody {
    pub phone: Option<String>,
    pub code: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OtpRequestResponse {
    pub success: bool,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct OtpVerifyResponse {
    pub success: bool,
    pub verified: bool,
}

fn field<'a>(value: &'a Option<String>, name: &str) -> AppResult<&'a str> {
    value.as_deref().ok_or_else(|| {
        AppError::validation(ValidationError::MissingField {
            field: name.to_string(),
        })
    })
}

pub async fn request_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OtpRequestBody>,
) -> AppResult<Json<OtpRequestResponse>> {
    let tag = |e: AppError| match get_request_id_from_headers(&headers) {
        Some(id) => e.with_request_id(id),
        None => e,
    };

    let phone = body.phone.as_deref().unwrap_or_default();
    let purpose = body.purpose.as_deref().unwrap_or("login");
    let issued = state.otp.request_otp(phone, purpose).await.map_err(tag)?;

    Ok(Json(OtpRequestResponse {
        success: true,
        expires_in: issued.expires_in.as_secs(),
    }))
}

pub async fn verify_otp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OtpVerifyBody>,
) -> AppResult<Json<OtpVerifyResponse>> {
    let tag = |e: AppError| match get_request_id_from_headers(&headers) {
        Some(id) => e.with_request_id(id),
        None => e,
    };

    let phone = body.phone.as_deref().unwrap_or_default();
    let code = field(&body.code, "code").map_err(tag)?;
    let purpose = body.purpose.as_deref().unwrap_or("login");
    state.otp.verify_otp(phone, code, purpose).await.map_err(tag)?;

    Ok(Json(OtpVerifyResponse {
        success: true,
        verified: true,
    }))
}
