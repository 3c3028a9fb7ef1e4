use base64::{engine::general_purpose::STANDARD, Engine as _};
use bigdecimal::BigDecimal;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use uzpay_backend::commerce::{Cart, CartLineItem, CommerceBackend, InMemoryCommerceBackend};
use uzpay_backend::payments::clock::ManualClock;
use uzpay_backend::payments::fiscal::FiscalPolicy;
use uzpay_backend::payments::providers::payme::types::{CancelParams, IdParams};
use uzpay_backend::payments::providers::payme::{PaymeConfig, PaymeHandler};
use uzpay_backend::payments::types::{PaymentSession, SessionData};
use uzpay_backend::payments::{OrderCompleter, SessionLocks};

const NOW: i64 = 1_760_000_000_000;
const TWELVE_HOURS_MS: i64 = 43_200_000;

struct Fixture {
    backend: Arc<InMemoryCommerceBackend>,
    clock: Arc<ManualClock>,
    handler: Arc<PaymeHandler>,
    auth: String,
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
    metadata.insert("mxik".to_string(), json!("06912001001000000"));
    metadata.insert("package_code".to_string(), json!("1496150"));
    backend
        .insert_cart(Cart {
            id: "cart_1".to_string(),
            currency_code: "uzs".to_string(),
            items: vec![CartLineItem {
                id: "item_1".to_string(),
                title: "Choynak".to_string(),
                quantity: 2,
                total_minor: 150_000,
                metadata,
            }],
            shipping_total_minor: 0,
            total_minor: 150_000,
            completed_at: None,
        })
        .await;

    let clock = Arc::new(ManualClock::new(NOW));
    let dyn_backend: Arc<dyn CommerceBackend> = backend.clone();
    let handler = PaymeHandler::new(
        PaymeConfig {
            merchant_id: "merchant".to_string(),
            key: "secret-key".to_string(),
            ..PaymeConfig::default()
        },
        dyn_backend.clone(),
        SessionLocks::new(),
        OrderCompleter::new(dyn_backend, Duration::from_secs(5)),
        FiscalPolicy::default(),
    )
    .with_clock(clock.clone());

    Fixture {
        backend,
        clock,
        handler: Arc::new(handler),
        auth: format!("Basic {}", STANDARD.encode("Paycom:secret-key")),
    }
}

impl Fixture {
    async fn call(&self, method: &str, params: JsonValue) -> JsonValue {
        let body = json!({ "jsonrpc": "2.0", "id": 42, "method": method, "params": params });
        let response = self
            .handler
            .handle_raw(Some(&self.auth), body.to_string().as_bytes())
            .await;
        assert_eq!(response["id"], 42);
        response
    }
}

fn error_code(response: &JsonValue) -> i64 {
    response["error"]["code"]
        .as_i64()
        .unwrap_or_else(|| panic!("expected an error, got {response}"))
}

#[tokio::test]
async fn full_lifecycle_is_idempotent_at_every_step() {
    let f = fixture().await;

    let check = f
        .call(
            "CheckPerformTransaction",
            json!({"amount": 150000, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(check["result"]["allow"], true);
    let items = check["result"]["detail"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["code"], "06912001001000000");
    assert_eq!(items[0]["price"], 75_000);
    assert_eq!(items[0]["count"], 2);

    let create_params = json!({
        "id": "pm-1",
        "time": NOW,
        "amount": 150000,
        "account": {"order_id": "cart_1"}
    });
    let created = f.call("CreateTransaction", create_params.clone()).await;
    assert_eq!(created["result"]["state"], 1);
    assert_eq!(created["result"]["transaction"], "ps_1");
    assert_eq!(created["result"]["create_time"], NOW);

    f.clock.advance_ms(1_000);
    let retried = f.call("CreateTransaction", create_params).await;
    assert_eq!(retried["result"], created["result"]);

    let competing = f
        .call(
            "CreateTransaction",
            json!({"id": "pm-2", "time": NOW, "amount": 150000, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(error_code(&competing), -31051);

    f.clock.advance_ms(1_000);
    let performed = f.call("PerformTransaction", json!({"id": "ps_1"})).await;
    assert_eq!(performed["result"]["state"], 2);
    assert_eq!(performed["result"]["perform_time"], NOW + 2_000);
    assert_eq!(f.backend.completion_calls(), 1);

    let session = f.backend.session("ps_1").await.unwrap();
    assert!(session.is_completed());
    assert_eq!(session.data["medusa_order_id"], "order_0001");
    assert_eq!(session.data["payme_state"], 2);

    f.clock.advance_ms(1_000);
    // Gateway id is accepted too, and nothing happens twice
    let again = f.call("PerformTransaction", json!({"id": "pm-1"})).await;
    assert_eq!(again["result"], performed["result"]);
    assert_eq!(f.backend.completion_calls(), 1);

    let status = f.call("CheckTransaction", json!({"id": "pm-1"})).await;
    assert_eq!(status["result"]["state"], 2);
    assert_eq!(status["result"]["perform_time"], NOW + 2_000);
    assert_eq!(status["result"]["cancel_time"], 0);
    assert!(status["result"]["reason"].is_null());

    let paid = f
        .call(
            "CheckPerformTransaction",
            json!({"amount": 150000, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(error_code(&paid), -31099);

    let cancelled = f
        .call("CancelTransaction", json!({"id": "pm-1", "reason": 5}))
        .await;
    assert_eq!(cancelled["result"]["state"], -2);
    let cancel_time = cancelled["result"]["cancel_time"].clone();

    f.clock.advance_ms(1_000);
    let cancelled_again = f
        .call("CancelTransaction", json!({"id": "pm-1", "reason": 5}))
        .await;
    assert_eq!(cancelled_again["result"]["state"], -2);
    assert_eq!(cancelled_again["result"]["cancel_time"], cancel_time);

    let statement = f
        .call("GetStatement", json!({"from": NOW - 1, "to": NOW + 10_000}))
        .await;
    let transactions = statement["result"]["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["id"], "pm-1");
    assert_eq!(transactions[0]["amount"], 150_000);
    assert_eq!(transactions[0]["account"]["order_id"], "cart_1");
    assert_eq!(transactions[0]["state"], -2);
    assert_eq!(transactions[0]["reason"], 5);

    let outside = f
        .call("GetStatement", json!({"from": NOW + 1, "to": NOW + 10_000}))
        .await;
    assert_eq!(outside["result"]["transactions"], json!([]));
}

#[tokio::test]
async fn amount_and_account_are_validated() {
    let f = fixture().await;

    let wrong = f
        .call(
            "CheckPerformTransaction",
            json!({"amount": 100, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(error_code(&wrong), -31001);

    let within_rounding = f
        .call(
            "CheckPerformTransaction",
            json!({"amount": 150050, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(within_rounding["result"]["allow"], true);

    let unknown = f
        .call(
            "CheckPerformTransaction",
            json!({"amount": 150000, "account": {"order_id": "cart_404"}}),
        )
        .await;
    assert_eq!(error_code(&unknown), -31050);
    assert_eq!(unknown["error"]["message"]["ru"], "Заказ не найден");

    let missing = f.call("CheckTransaction", json!({"id": "nope"})).await;
    assert_eq!(error_code(&missing), -31003);
}

#[tokio::test]
async fn stale_create_is_rejected() {
    let f = fixture().await;
    let stale = f
        .call(
            "CreateTransaction",
            json!({
                "id": "pm-old",
                "time": NOW - TWELVE_HOURS_MS - 1,
                "amount": 150000,
                "account": {"order_id": "cart_1"}
            }),
        )
        .await;
    assert_eq!(error_code(&stale), -31008);
    assert!(f.backend.session("ps_1").await.unwrap().data.is_empty());
}

#[tokio::test]
async fn create_time_at_the_integer_floor_is_stale() {
    let f = fixture().await;
    let ancient = f
        .call(
            "CreateTransaction",
            json!({
                "id": "pm-floor",
                "time": i64::MIN,
                "amount": 150000,
                "account": {"order_id": "cart_1"}
            }),
        )
        .await;
    assert_eq!(error_code(&ancient), -31008);
    assert!(f.backend.session("ps_1").await.unwrap().data.is_empty());
}

#[tokio::test]
async fn perform_after_timeout_cancels_the_transaction() {
    let f = fixture().await;
    f.call(
        "CreateTransaction",
        json!({"id": "pm-1", "time": NOW, "amount": 150000, "account": {"order_id": "cart_1"}}),
    )
    .await;

    f.clock.advance_ms(TWELVE_HOURS_MS + 1);
    let late = f.call("PerformTransaction", json!({"id": "ps_1"})).await;
    assert_eq!(error_code(&late), -31008);
    assert_eq!(f.backend.completion_calls(), 0);

    let status = f.call("CheckTransaction", json!({"id": "pm-1"})).await;
    assert_eq!(status["result"]["state"], -1);
    assert_eq!(status["result"]["reason"], 4);
}

#[tokio::test]
async fn cancelled_transaction_can_be_replaced() {
    let f = fixture().await;
    f.call(
        "CreateTransaction",
        json!({"id": "pm-1", "time": NOW, "amount": 150000, "account": {"order_id": "cart_1"}}),
    )
    .await;
    let cancelled = f
        .call("CancelTransaction", json!({"id": "pm-1", "reason": 3}))
        .await;
    assert_eq!(cancelled["result"]["state"], -1);

    let perform_cancelled = f.call("PerformTransaction", json!({"id": "pm-1"})).await;
    assert_eq!(error_code(&perform_cancelled), -31008);

    let replacement = f
        .call(
            "CreateTransaction",
            json!({"id": "pm-2", "time": NOW, "amount": 150000, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(replacement["result"]["state"], 1);

    let session = f.backend.session("ps_1").await.unwrap();
    assert_eq!(session.data["payme_transaction_id"], "pm-2");
    assert!(session.data["payme_cancel_reason"].is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_performs_complete_the_order_once() {
    let f = fixture().await;
    f.call(
        "CreateTransaction",
        json!({"id": "pm-1", "time": NOW, "amount": 150000, "account": {"order_id": "cart_1"}}),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let handler = f.handler.clone();
        handles.push(tokio::spawn(async move {
            handler
                .perform_transaction(IdParams {
                    id: "ps_1".to_string(),
                })
                .await
        }));
    }

    let mut perform_times = Vec::new();
    for joined in join_all(handles).await {
        let result = joined.unwrap().expect("perform should succeed");
        assert_eq!(result.state, 2);
        perform_times.push(result.perform_time);
    }
    perform_times.dedup();
    assert_eq!(perform_times.len(), 1);
    assert_eq!(f.backend.completion_calls(), 1);
}

#[tokio::test]
async fn failed_order_completion_does_not_fail_perform() {
    let f = fixture().await;
    f.call(
        "CreateTransaction",
        json!({"id": "pm-1", "time": NOW, "amount": 150000, "account": {"order_id": "cart_1"}}),
    )
    .await;

    f.backend.set_fail_completion(true);
    let performed = f.call("PerformTransaction", json!({"id": "ps_1"})).await;
    assert_eq!(performed["result"]["state"], 2);

    let session = f.backend.session("ps_1").await.unwrap();
    assert!(!session.is_completed());
    assert_eq!(session.data["payme_state"], 2);
    assert!(session.data.get("medusa_order_id").is_none());

    let cancelled = f
        .handler
        .cancel_transaction(CancelParams {
            id: "pm-1".to_string(),
            reason: Some(5),
        })
        .await
        .unwrap();
    assert_eq!(cancelled.state, -2);
}

#[tokio::test]
async fn unfiscalizable_cart_is_not_payable() {
    let f = fixture().await;
    f.backend
        .insert_cart(Cart {
            id: "cart_1".to_string(),
            currency_code: "uzs".to_string(),
            items: vec![CartLineItem {
                id: "item_1".to_string(),
                title: "No code".to_string(),
                quantity: 1,
                total_minor: 150_000,
                metadata: SessionData::new(),
            }],
            shipping_total_minor: 0,
            total_minor: 150_000,
            completed_at: None,
        })
        .await;

    let response = f
        .call(
            "CheckPerformTransaction",
            json!({"amount": 150000, "account": {"order_id": "cart_1"}}),
        )
        .await;
    assert_eq!(error_code(&response), -31008);
}
