use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uzpay_backend::commerce::{Cart, CartLineItem, CommerceBackend, InMemoryCommerceBackend};
use uzpay_backend::payments::clock::ManualClock;
use uzpay_backend::payments::fiscal::{FiscalItem, FiscalPolicy};
use uzpay_backend::payments::providers::click::types::ClickRequest;
use uzpay_backend::payments::providers::{ClickConfig, ClickHandler, FiscalSubmitter};
use uzpay_backend::payments::types::{PaymentSession, SessionData};
use uzpay_backend::payments::utils::md5_hex;
use uzpay_backend::payments::{OrderCompleter, PaymentResult, SessionLocks};

const SECRET: &str = "click-secret";
const SERVICE_ID: &str = "31";
const SIGN_TIME: &str = "2026-10-19 10:00:00";

#[derive(Default)]
struct RecordingSubmitter {
    calls: Mutex<Vec<(String, i64, usize)>>,
}

#[async_trait]
impl FiscalSubmitter for RecordingSubmitter {
    async fn submit_items(
        &self,
        payment_id: &str,
        items: &[FiscalItem],
        received_card_minor: i64,
    ) -> PaymentResult<()> {
        self.calls.lock().unwrap().push((
            payment_id.to_string(),
            received_card_minor,
            items.len(),
        ));
        Ok(())
    }
}

struct Fixture {
    backend: Arc<InMemoryCommerceBackend>,
    submitter: Arc<RecordingSubmitter>,
    clock: Arc<ManualClock>,
    locks: SessionLocks,
    completer: OrderCompleter,
    handler: Arc<ClickHandler>,
}

async fn fixture() -> Fixture {
    let backend = Arc::new(InMemoryCommerceBackend::new());
    backend
        .insert_session(PaymentSession {
            id: "ps_1".to_string(),
            cart_id: "cart_1".to_string(),
            amount: BigDecimal::from_str("1500.00").unwrap(),
            currency_code: "uzs".to_string(),
            data: SessionData::new(),
            version: 0,
            created_at: Utc::now(),
            completed_at: None,
        })
        .await;

    let mut metadata = SessionData::new();
    metadata.insert("tax_code".to_string(), json!("06912001001000000"));
    backend
        .insert_cart(Cart {
            id: "cart_1".to_string(),
            currency_code: "uzs".to_string(),
            items: vec![CartLineItem {
                id: "item_1".to_string(),
                title: "Piyola".to_string(),
                quantity: 3,
                total_minor: 150_000,
                metadata,
            }],
            shipping_total_minor: 0,
            total_minor: 150_000,
            completed_at: None,
        })
        .await;

    let submitter = Arc::new(RecordingSubmitter::default());
    let clock = Arc::new(ManualClock::new(1_760_000_000_000));
    let locks = SessionLocks::new();
    let dyn_backend: Arc<dyn CommerceBackend> = backend.clone();
    let completer = OrderCompleter::new(dyn_backend.clone(), Duration::from_secs(5))
        .with_clock(clock.clone())
        .with_fiscal_submitter(submitter.clone(), FiscalPolicy::default());
    let handler = ClickHandler::new(
        ClickConfig {
            service_id: SERVICE_ID.to_string(),
            merchant_id: "77".to_string(),
            secret_key: SECRET.to_string(),
            ..ClickConfig::default()
        },
        dyn_backend,
        locks.clone(),
        completer.clone(),
    );

    Fixture {
        backend,
        submitter,
        clock,
        locks,
        completer,
        handler: Arc::new(handler),
    }
}

fn prepare_request(click_trans_id: &str, amount: &str) -> ClickRequest {
    let sign = md5_hex(&format!(
        "{click_trans_id}{SERVICE_ID}{SECRET}cart_1{amount}0{SIGN_TIME}"
    ));
    ClickRequest {
        click_trans_id: Some(click_trans_id.to_string()),
        service_id: Some(SERVICE_ID.to_string()),
        click_paydoc_id: Some(format!("doc-{click_trans_id}")),
        merchant_trans_id: Some("cart_1".to_string()),
        amount: Some(amount.to_string()),
        action: Some("0".to_string()),
        sign_time: Some(SIGN_TIME.to_string()),
        sign_string: Some(sign),
        ..Default::default()
    }
}

fn complete_request(click_trans_id: &str, prepare_id: &str, error: i32) -> ClickRequest {
    let amount = "1500.00";
    let sign = md5_hex(&format!(
        "{click_trans_id}{SERVICE_ID}{SECRET}cart_1{prepare_id}{amount}1{SIGN_TIME}"
    ));
    ClickRequest {
        click_trans_id: Some(click_trans_id.to_string()),
        service_id: Some(SERVICE_ID.to_string()),
        click_paydoc_id: Some(format!("doc-{click_trans_id}")),
        merchant_trans_id: Some("cart_1".to_string()),
        merchant_prepare_id: Some(prepare_id.to_string()),
        amount: Some(amount.to_string()),
        action: Some("1".to_string()),
        error: Some(error.to_string()),
        sign_time: Some(SIGN_TIME.to_string()),
        sign_string: Some(sign),
        ..Default::default()
    }
}

async fn wait_for_submission(submitter: &RecordingSubmitter) -> Vec<(String, i64, usize)> {
    for _ in 0..100 {
        let calls = submitter.calls.lock().unwrap().clone();
        if !calls.is_empty() {
            return calls;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn prepare_then_complete_places_one_order() {
    let f = fixture().await;

    let prepared = f.handler.handle(&prepare_request("5001", "1500.00")).await;
    assert_eq!(prepared.error, 0);
    assert_eq!(prepared.merchant_prepare_id.as_deref(), Some("5001"));

    let retried = f.handler.prepare(&prepare_request("5001", "1500.00")).await;
    assert_eq!(retried, prepared);

    let completed = f.handler.handle(&complete_request("5001", "5001", 0)).await;
    assert_eq!(completed.error, 0, "{completed:?}");
    assert_eq!(completed.merchant_confirm_id.as_deref(), Some("5001"));
    assert_eq!(f.backend.completion_calls(), 1);

    let session = f.backend.session("ps_1").await.unwrap();
    assert!(session.is_completed());
    assert_eq!(session.data["click_state"], "completed");
    assert_eq!(session.data["transaction_id"], "order_0001");

    let again = f.handler.complete(&complete_request("5001", "5001", 0)).await;
    assert_eq!(again.error, 0);
    assert_eq!(f.backend.completion_calls(), 1);

    let prepare_after = f.handler.prepare(&prepare_request("5001", "1500.00")).await;
    assert_eq!(prepare_after.error, -4);
    let other_after = f.handler.prepare(&prepare_request("5002", "1500.00")).await;
    assert_eq!(other_after.error, -4);

    let calls = wait_for_submission(&f.submitter).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "doc-5001");
    assert_eq!(calls[0].1, 150_000);
    assert_eq!(calls[0].2, 1);
}

#[tokio::test]
async fn second_click_transaction_is_refused_while_prepared() {
    let f = fixture().await;
    assert_eq!(
        f.handler.prepare(&prepare_request("5001", "1500.00")).await.error,
        0
    );
    let competing = f.handler.prepare(&prepare_request("5002", "1500.00")).await;
    assert_eq!(competing.error, -8);
    assert_eq!(competing.click_trans_id, "5002");
}

#[tokio::test]
async fn signature_and_amount_are_checked() {
    let f = fixture().await;

    let mut forged = prepare_request("5001", "1500.00");
    forged.sign_string = Some(md5_hex("forged"));
    assert_eq!(f.handler.prepare(&forged).await.error, -1);

    let short = f.handler.prepare(&prepare_request("5001", "1400.00")).await;
    assert_eq!(short.error, -2);

    let mut foreign = prepare_request("5001", "1500.00");
    foreign.merchant_trans_id = Some("cart_404".to_string());
    // Re-signed so the lookup, not the signature, rejects it
    foreign.sign_string = Some(md5_hex(&format!(
        "5001{SERVICE_ID}{SECRET}cart_4041500.000{SIGN_TIME}"
    )));
    assert_eq!(f.handler.prepare(&foreign).await.error, -5);

    assert!(f.backend.session("ps_1").await.unwrap().data.is_empty());
}

#[tokio::test]
async fn complete_requires_matching_prepare() {
    let f = fixture().await;

    let unprepared = f.handler.complete(&complete_request("5001", "5001", 0)).await;
    assert_eq!(unprepared.error, -6);

    f.handler.prepare(&prepare_request("5001", "1500.00")).await;
    let wrong_id = f.handler.complete(&complete_request("5001", "9999", 0)).await;
    assert_eq!(wrong_id.error, -6);
    assert_eq!(f.backend.completion_calls(), 0);
}

#[tokio::test]
async fn cancelled_payment_is_recorded_and_final() {
    let f = fixture().await;
    f.handler.prepare(&prepare_request("5001", "1500.00")).await;

    let cancelled = f
        .handler
        .complete(&complete_request("5001", "5001", -5017))
        .await;
    assert_eq!(cancelled.error, -9);

    let session = f.backend.session("ps_1").await.unwrap();
    assert_eq!(session.data["click_state"], "cancelled");
    assert_eq!(session.data["click_error"], -5017);
    assert!(!session.is_completed());

    let retry = f.handler.complete(&complete_request("5001", "5001", 0)).await;
    assert_eq!(retry.error, -9);
    let reprepare = f.handler.prepare(&prepare_request("5001", "1500.00")).await;
    assert_eq!(reprepare.error, -9);
    assert_eq!(f.backend.completion_calls(), 0);
}

#[tokio::test]
async fn failed_order_completion_still_confirms_payment() {
    let f = fixture().await;
    f.handler.prepare(&prepare_request("5001", "1500.00")).await;

    f.backend.set_fail_completion(true);
    let completed = f.handler.complete(&complete_request("5001", "5001", 0)).await;
    assert_eq!(completed.error, 0);

    let session = f.backend.session("ps_1").await.unwrap();
    assert!(!session.is_completed());
    assert_eq!(session.data["click_state"], "completed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.submitter.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_action_and_missing_fields() {
    let f = fixture().await;

    let mut unknown = prepare_request("5001", "1500.00");
    unknown.action = Some("7".to_string());
    assert_eq!(f.handler.handle(&unknown).await.error, -3);

    let mut missing = prepare_request("5001", "1500.00");
    missing.sign_time = None;
    assert_eq!(f.handler.prepare(&missing).await.error, -8);

    assert_eq!(f.handler.handle(&ClickRequest::default()).await.error, -8);
}

#[tokio::test]
async fn reconciled_order_still_reaches_ofd() {
    let f = fixture().await;
    f.handler.prepare(&prepare_request("5001", "1500.00")).await;

    f.backend.set_fail_completion(true);
    let completed = f.handler.complete(&complete_request("5001", "5001", 0)).await;
    assert_eq!(completed.error, 0);
    assert_eq!(f.backend.session("ps_1").await.unwrap().completion_attempts(), 1);

    f.backend.set_fail_completion(false);
    f.clock.advance_ms(60_000);
    let report = f.completer.reconcile_pending(&f.locks, 10).await.unwrap();
    assert_eq!(report.completed, 1);

    let session = f.backend.session("ps_1").await.unwrap();
    assert!(session.is_completed());
    assert_eq!(session.data["transaction_id"], "order_0002");

    let calls = wait_for_submission(&f.submitter).await;
    assert_eq!(calls, vec![("doc-5001".to_string(), 150_000, 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completes_place_the_order_once() {
    let f = fixture().await;
    f.handler.prepare(&prepare_request("5001", "1500.00")).await;

    let calls = (0..8).map(|_| {
        let handler = f.handler.clone();
        tokio::spawn(async move { handler.complete(&complete_request("5001", "5001", 0)).await })
    });
    for response in join_all(calls).await {
        let response = response.unwrap();
        assert_eq!(response.error, 0, "{response:?}");
        assert_eq!(response.merchant_confirm_id.as_deref(), Some("5001"));
    }

    assert_eq!(f.backend.completion_calls(), 1);
    assert!(f.backend.session("ps_1").await.unwrap().is_completed());
    assert_eq!(wait_for_submission(&f.submitter).await.len(), 1);
}
