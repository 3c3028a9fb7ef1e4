//! Gateway callbacks and checkout links
//!
//! Payme and Click always get HTTP 200; success or failure lives in their
//! own response bodies.

use axum::{
    body::Bytes,
    extract::{Form, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::AppState;
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::payments::providers::click::types::{ClickRequest, ClickResponse};
use crate::payments::types::Gateway;

pub async fn payme(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Json<JsonValue> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    Json(state.payme.handle_raw(authorization, &body).await)
}

pub async fn click_prepare(
    State(state): State<AppState>,
    Form(request): Form<ClickRequest>,
) -> Json<ClickResponse> {
    Json(state.click.prepare(&request).await)
}

pub async fn click_complete(
    State(state): State<AppState>,
    Form(request): Form<ClickRequest>,
) -> Json<ClickResponse> {
    Json(state.click.complete(&request).await)
}

pub async fn click(
    State(state): State<AppState>,
    Form(request): Form<ClickRequest>,
) -> Json<ClickResponse> {
    Json(state.click.handle(&request).await)
}

#[derive(Debug, Deserialize)]
pub struct CheckoutLinkRequest {
    pub cart_id: String,
    pub gateway: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutLinkResponse {
    pub gateway: &'static str,
    pub url: String,
    pub amount_minor: i64,
}

pub async fn checkout_link(
    State(state): State<AppState>,
    Json(request): Json<CheckoutLinkRequest>,
) -> AppResult<Json<CheckoutLinkResponse>> {
    let gateway = match request.gateway.trim().to_lowercase().as_str() {
        "payme" => Gateway::Payme,
        "click" => Gateway::Click,
        _ => {
            return Err(AppError::validation(ValidationError::InvalidField {
                field: "gateway".to_string(),
                reason: "expected 'payme' or 'click'".to_string(),
            }))
        }
    };

    let session = state
        .backend
        .find_session_by_cart_id(&request.cart_id)
        .await?
        .ok_or_else(|| {
            AppError::domain(DomainError::SessionNotFound {
                cart_id: request.cart_id.clone(),
            })
        })?;
    let amount_minor = session.amount_minor().ok_or_else(|| {
        AppError::validation(ValidationError::InvalidField {
            field: "amount".to_string(),
            reason: "session amount is not representable".to_string(),
        })
    })?;

    let url = match gateway {
        Gateway::Payme => state.payme.checkout_url(&session.cart_id, amount_minor),
        Gateway::Click => state.click.checkout_url(&session.cart_id, amount_minor),
    };

    Ok(Json(CheckoutLinkResponse {
        gateway: gateway.as_str(),
        url,
        amount_minor,
    }))
}
