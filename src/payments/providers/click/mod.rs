//! Click SHOP API: the Prepare/Complete webhook pair, checkout links and the
//! OFD (fiscal data) submission that follows a successful Complete.

pub mod types;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use self::types::*;
use crate::commerce::{CommerceBackend, CommerceError};
use crate::config::{env_opt, env_parse, ConfigError};
use crate::payments::amount::{format_minor_units, parse_amount_to_minor_units};
use crate::payments::completion::OrderCompleter;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::fiscal::FiscalItem;
pub use crate::payments::fiscal::FiscalSubmitter;
use crate::payments::locks::SessionLocks;
use crate::payments::types::{ClickSessionData, ClickState, Gateway, PaymentSession, SessionData};
use crate::payments::utils::{sha1_hex, PaymentHttpClient};

#[derive(Debug, Clone)]
pub struct ClickConfig {
    pub service_id: String,
    pub merchant_id: String,
    pub merchant_user_id: String,
    pub secret_key: String,
    pub api_url: String,
    pub checkout_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            merchant_id: String::new(),
            merchant_user_id: String::new(),
            secret_key: String::new(),
            api_url: "https://api.click.uz".to_string(),
            checkout_url: "https://my.click.uz/services/pay".to_string(),
            timeout_secs: 10,
            max_retries: 2,
        }
    }
}

impl ClickConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            service_id: env_opt("CLICK_SERVICE_ID").unwrap_or_default(),
            merchant_id: env_opt("CLICK_MERCHANT_ID").unwrap_or_default(),
            merchant_user_id: env_opt("CLICK_MERCHANT_USER_ID").unwrap_or_default(),
            secret_key: env_opt("CLICK_SECRET_KEY").unwrap_or_default(),
            api_url: env_opt("CLICK_API_URL")
                .unwrap_or(defaults.api_url)
                .trim_end_matches('/')
                .to_string(),
            checkout_url: env_opt("CLICK_CHECKOUT_URL").unwrap_or(defaults.checkout_url),
            timeout_secs: env_parse("CLICK_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: env_parse("CLICK_MAX_RETRIES", defaults.max_retries)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.is_empty() {
            return Err(ConfigError::MissingVariable("CLICK_SECRET_KEY".to_string()));
        }
        if self.service_id.is_empty() {
            return Err(ConfigError::MissingVariable("CLICK_SERVICE_ID".to_string()));
        }
        Ok(())
    }

    /// OFD submission needs the merchant user credentials as well.
    pub fn ofd_enabled(&self) -> bool {
        !self.merchant_user_id.is_empty() && !self.secret_key.is_empty()
    }
}

pub struct ClickOfdClient {
    config: ClickConfig,
    http: PaymentHttpClient,
}

impl ClickOfdClient {
    pub fn new(config: ClickConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            "click",
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    /// `merchant_user_id:sha1(timestamp + secret):timestamp`
    fn auth_header(&self, timestamp: i64) -> String {
        let digest = sha1_hex(&format!("{}{}", timestamp, self.config.secret_key));
        format!("{}:{}:{}", self.config.merchant_user_id, digest, timestamp)
    }

    fn payload(&self, payment_id: &str, items: &[FiscalItem], received_card_minor: i64) -> JsonValue {
        let items: Vec<JsonValue> = items
            .iter()
            .map(|item| {
                let price = item.line_total();
                let vat = price * i64::from(item.vat_percent) / (100 + i64::from(item.vat_percent));
                json!({
                    "Name": item.title,
                    "SPIC": item.tax_code,
                    "PackageCode": item.package_code,
                    "Price": price,
                    "Amount": item.count,
                    "VAT": vat,
                    "VATPercent": item.vat_percent,
                })
            })
            .collect();

        json!({
            "service_id": self.config.service_id,
            "payment_id": payment_id,
            "items": items,
            "received_ecash": 0,
            "received_cash": 0,
            "received_card": received_card_minor,
        })
    }
}

#[async_trait]
impl FiscalSubmitter for ClickOfdClient {
    async fn submit_items(
        &self,
        payment_id: &str,
        items: &[FiscalItem],
        received_card_minor: i64,
    ) -> PaymentResult<()> {
        let url = format!(
            "{}/v2/merchant/payment/ofd_data/submit_items",
            self.config.api_url
        );
        let auth = self.auth_header(chrono::Utc::now().timestamp());
        let body = self.payload(payment_id, items, received_card_minor);

        let response: JsonValue = self
            .http
            .request_json(
                reqwest::Method::POST,
                &url,
                Some(&body),
                &[("Auth", auth.as_str()), ("Accept", "application/json")],
            )
            .await?;

        let code = response.get("error_code").and_then(|v| v.as_i64()).unwrap_or(0);
        if code != 0 {
            return Err(PaymentError::ProviderError {
                provider: "click".to_string(),
                message: response
                    .get("error_note")
                    .and_then(|v| v.as_str())
                    .unwrap_or("OFD submission rejected")
                    .to_string(),
                provider_code: Some(code.to_string()),
                retryable: false,
            });
        }
        Ok(())
    }
}

pub struct ClickHandler {
    config: ClickConfig,
    backend: Arc<dyn CommerceBackend>,
    locks: SessionLocks,
    completer: OrderCompleter,
}

impl ClickHandler {
    pub fn new(
        config: ClickConfig,
        backend: Arc<dyn CommerceBackend>,
        locks: SessionLocks,
        completer: OrderCompleter,
    ) -> Self {
        Self {
            config,
            backend,
            locks,
            completer,
        }
    }

    /// Single-endpoint form: route on `action`.
    pub async fn handle(&self, request: &ClickRequest) -> ClickResponse {
        match request.action.as_deref().map(str::trim) {
            Some(ACTION_PREPARE) => self.prepare(request).await,
            Some(ACTION_COMPLETE) => self.complete(request).await,
            Some(_) => ClickResponse::rejected(request, &ClickError::action_not_found()),
            None => ClickResponse::rejected(request, &ClickError::bad_request()),
        }
    }

    pub async fn prepare(&self, request: &ClickRequest) -> ClickResponse {
        match self.try_prepare(request).await {
            Ok(response) => response,
            Err(e) => {
                info!(
                    click_trans_id = ?request.click_trans_id,
                    merchant_trans_id = ?request.merchant_trans_id,
                    code = e.code,
                    "Click prepare rejected"
                );
                ClickResponse::rejected(request, &e)
            }
        }
    }

    pub async fn complete(&self, request: &ClickRequest) -> ClickResponse {
        match self.try_complete(request).await {
            Ok(response) => response,
            Err(e) => {
                info!(
                    click_trans_id = ?request.click_trans_id,
                    merchant_trans_id = ?request.merchant_trans_id,
                    code = e.code,
                    "Click complete rejected"
                );
                ClickResponse::rejected(request, &e)
            }
        }
    }

    async fn try_prepare(&self, request: &ClickRequest) -> Result<ClickResponse, ClickError> {
        let fields = request.prepare_fields()?;
        if fields.action != ACTION_PREPARE {
            return Err(ClickError::action_not_found());
        }
        self.check_service(&fields.service_id)?;
        if !verify_prepare_signature(&fields, &self.config.secret_key) {
            warn!(click_trans_id = %fields.click_trans_id, "Click prepare signature mismatch");
            return Err(ClickError::sign_check_failed());
        }

        let located = self.find_by_cart(&fields.merchant_trans_id).await?;
        let _guard = self.locks.lock(&located.id).await;
        let session = self.refetch(&located.id).await?;
        let data = click_view(&session)?;

        if session.is_completed() || session.captured_by() == Some(Gateway::Payme) {
            return Err(ClickError::already_paid());
        }
        if session.active_gateway() == Some(Gateway::Payme) {
            warn!(
                session_id = %session.id,
                incoming = %fields.click_trans_id,
                "Click transaction attempted on a session held by Payme"
            );
            return Err(ClickError::bad_request());
        }
        self.check_amount(&session, &fields.amount)?;

        if data.click_trans_id.as_deref() == Some(fields.click_trans_id.as_str()) {
            return match data.state() {
                ClickState::Prepared | ClickState::Completed => Ok(ClickResponse::prepared(
                    &fields,
                    data.merchant_prepare_id
                        .unwrap_or_else(|| fields.click_trans_id.clone()),
                )),
                ClickState::Cancelled | ClickState::Error => Err(ClickError::cancelled()),
                ClickState::Pending => self.record_prepare(&session, &fields).await,
            };
        }

        match data.state() {
            ClickState::Completed => Err(ClickError::already_paid()),
            ClickState::Prepared => {
                warn!(
                    session_id = %session.id,
                    active = ?data.click_trans_id,
                    incoming = %fields.click_trans_id,
                    "Second Click transaction attempted on a prepared session"
                );
                Err(ClickError::bad_request())
            }
            _ => self.record_prepare(&session, &fields).await,
        }
    }

    async fn record_prepare(
        &self,
        session: &PaymentSession,
        fields: &PrepareFields,
    ) -> Result<ClickResponse, ClickError> {
        // Derived from the gateway id so retries always see the same value
        let merchant_prepare_id = fields.click_trans_id.clone();
        let patch = ClickSessionData {
            click_trans_id: Some(fields.click_trans_id.clone()),
            click_paydoc_id: Some(fields.click_paydoc_id.clone()),
            merchant_prepare_id: Some(merchant_prepare_id.clone()),
            click_state: Some(ClickState::Prepared),
            click_error: Some(SUCCESS),
            sign_time: Some(fields.sign_time.clone()),
            cart_id: Some(session.cart_id.clone()),
            ..Default::default()
        }
        .to_patch();
        self.write(session, patch).await?;

        info!(
            session_id = %session.id,
            click_trans_id = %fields.click_trans_id,
            "Click transaction prepared"
        );
        Ok(ClickResponse::prepared(fields, merchant_prepare_id))
    }

    async fn try_complete(&self, request: &ClickRequest) -> Result<ClickResponse, ClickError> {
        let fields = request.complete_fields()?;
        if fields.base.action != ACTION_COMPLETE {
            return Err(ClickError::action_not_found());
        }
        self.check_service(&fields.base.service_id)?;
        if !verify_complete_signature(&fields, &self.config.secret_key) {
            warn!(click_trans_id = %fields.base.click_trans_id, "Click complete signature mismatch");
            return Err(ClickError::sign_check_failed());
        }

        let located = self.find_by_cart(&fields.base.merchant_trans_id).await?;
        let _guard = self.locks.lock(&located.id).await;
        let session = self.refetch(&located.id).await?;
        let data = click_view(&session)?;

        self.check_amount(&session, &fields.base.amount)?;

        let prepare_id = data.merchant_prepare_id.as_deref();
        if prepare_id != Some(fields.merchant_prepare_id.as_str())
            || data.click_trans_id.as_deref() != Some(fields.base.click_trans_id.as_str())
        {
            return Err(ClickError::transaction_does_not_exist());
        }

        match data.state() {
            ClickState::Completed if data.click_error.unwrap_or(SUCCESS) == SUCCESS => {
                return Ok(ClickResponse::confirmed(
                    &fields.base,
                    fields.merchant_prepare_id.clone(),
                ));
            }
            ClickState::Cancelled | ClickState::Error | ClickState::Completed => {
                return Err(ClickError::cancelled())
            }
            ClickState::Pending | ClickState::Prepared => {}
        }
        if session.is_completed() || session.captured_by() == Some(Gateway::Payme) {
            return Err(ClickError::already_paid());
        }

        let next = match fields.error {
            SUCCESS => ClickState::Completed,
            CLICK_CANCELLED => ClickState::Cancelled,
            _ => ClickState::Error,
        };
        let patch = ClickSessionData {
            click_state: Some(next),
            click_error: Some(fields.error),
            click_error_note: fields.error_note.clone(),
            click_paydoc_id: Some(fields.base.click_paydoc_id.clone()),
            ..Default::default()
        }
        .to_patch();
        let updated = self.write(&session, patch).await?;

        if next != ClickState::Completed {
            info!(
                session_id = %updated.id,
                click_error = fields.error,
                state = %next,
                "Click reported an unsuccessful payment"
            );
            return Err(ClickError::cancelled());
        }
        info!(
            session_id = %updated.id,
            click_trans_id = %fields.base.click_trans_id,
            "Click transaction completed"
        );

        let cart_id = data.cart_id.clone().unwrap_or_else(|| updated.cart_id.clone());
        if !updated.is_completed() {
            self.completer
                .complete_best_effort(&updated.id, &cart_id, Gateway::Click)
                .await;
        }

        Ok(ClickResponse::confirmed(&fields.base, fields.merchant_prepare_id))
    }

    /// `{checkout_url}?service_id=..&merchant_id=..&amount=..&transaction_param=..`
    pub fn checkout_url(&self, cart_id: &str, amount_minor: i64) -> String {
        format!(
            "{}?service_id={}&merchant_id={}&amount={}&transaction_param={}",
            self.config.checkout_url,
            self.config.service_id,
            self.config.merchant_id,
            format_minor_units(amount_minor),
            cart_id
        )
    }

    fn check_service(&self, service_id: &str) -> Result<(), ClickError> {
        if !self.config.service_id.is_empty() && self.config.service_id != service_id {
            warn!(service_id, "Click request for a foreign service id");
            return Err(ClickError::bad_request());
        }
        Ok(())
    }

    fn check_amount(&self, session: &PaymentSession, amount: &str) -> Result<(), ClickError> {
        let received = parse_amount_to_minor_units(amount).ok_or_else(ClickError::incorrect_amount)?;
        let expected = session.amount_minor().ok_or_else(|| {
            error!(session_id = %session.id, amount = %session.amount, "Session amount is not representable");
            ClickError::failed_to_update()
        })?;
        if received != expected {
            info!(session_id = %session.id, expected, received, "Click amount mismatch");
            return Err(ClickError::incorrect_amount());
        }
        Ok(())
    }

    async fn find_by_cart(&self, cart_id: &str) -> Result<PaymentSession, ClickError> {
        self.backend
            .find_session_by_cart_id(cart_id)
            .await
            .map_err(backend_failure)?
            .ok_or_else(ClickError::user_does_not_exist)
    }

    async fn refetch(&self, id: &str) -> Result<PaymentSession, ClickError> {
        self.backend
            .find_session_by_id(id)
            .await
            .map_err(backend_failure)?
            .ok_or_else(ClickError::user_does_not_exist)
    }

    async fn write(
        &self,
        session: &PaymentSession,
        patch: SessionData,
    ) -> Result<PaymentSession, ClickError> {
        self.backend
            .update_session_data(&session.id, session.version, patch)
            .await
            .map_err(|e| match e {
                CommerceError::VersionConflict { .. } => {
                    warn!(session_id = %session.id, "Click write lost a version race");
                    ClickError::failed_to_update()
                }
                other => backend_failure(other),
            })
    }
}

fn backend_failure(err: CommerceError) -> ClickError {
    error!(error = %err, "Commerce backend failure during Click call");
    ClickError::failed_to_update()
}

fn click_view(session: &PaymentSession) -> Result<ClickSessionData, ClickError> {
    session.click().map_err(|e| {
        error!(session_id = %session.id, error = %e, "Unreadable Click session data");
        ClickError::failed_to_update()
    })
}
