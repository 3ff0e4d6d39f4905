use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use serde_json::json;
use shared_config::AppConfig;
use shared_storage::{KeyValueStore, MemoryStore};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use entitlement_cell::{
    ActivationOutcome, EntitlementError, EntitlementService, DEFAULT_TRIAL_LIMIT,
};

fn config_for(url: &str) -> AppConfig {
    AppConfig {
        activation_verify_url: url.to_string(),
        data_dir: ".".to_string(),
    }
}

fn service(url: &str) -> (EntitlementService, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn KeyValueStore> = memory.clone();
    (
        EntitlementService::new(store, &config_for(url)),
        memory,
    )
}

async fn mock_plan(server: &MockServer, plan: &str) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "type": plan})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn initialize_seeds_the_default_trial() {
    let (service, _) = service("http://unused.test");

    let state = service.initialize().await.unwrap();

    assert!(!state.is_premium);
    assert_eq!(state.prescription_count, 0);
    assert_eq!(state.prescription_limit, Some(DEFAULT_TRIAL_LIMIT));
    assert_eq!(service.remaining().await.unwrap(), Some(2));
}

#[tokio::test]
async fn initialize_clears_a_finite_limit_on_premium_state() {
    let (service, memory) = service("http://unused.test");
    let store: Arc<dyn KeyValueStore> = memory.clone();
    store.set("isPremium", &true).await.unwrap();
    store.set("prescriptionLimit", &50u32).await.unwrap();

    let state = service.initialize().await.unwrap();

    assert!(state.is_premium);
    assert_eq!(state.prescription_limit, None);
}

#[tokio::test]
async fn trial_allows_exactly_the_limit() {
    let (service, _) = service("http://unused.test");
    service.initialize().await.unwrap();

    assert!(service.can_consume().await.unwrap());
    assert_eq!(service.consume().await.unwrap(), 1);
    assert_eq!(service.consume().await.unwrap(), 2);

    assert!(!service.can_consume().await.unwrap());
    let result = service.consume().await;
    assert_matches!(
        result,
        Err(EntitlementError::LimitExceeded { count: 2, limit: 2 })
    );
    // A failed consume must not mutate the counter.
    assert_eq!(service.snapshot().await.unwrap().prescription_count, 2);
}

#[tokio::test]
async fn a_null_limit_is_never_unlimited_without_premium() {
    let (service, memory) = service("http://unused.test");
    let store: Arc<dyn KeyValueStore> = memory.clone();
    store
        .set_raw("prescriptionLimit", serde_json::Value::Null)
        .await
        .unwrap();

    let state = service.snapshot().await.unwrap();
    assert_eq!(state.effective_limit(), Some(DEFAULT_TRIAL_LIMIT));
}

#[tokio::test]
async fn premium_consume_passes_without_counting() {
    let (service, memory) = service("http://unused.test");
    let store: Arc<dyn KeyValueStore> = memory.clone();
    store.set("isPremium", &true).await.unwrap();
    store
        .set_raw("prescriptionLimit", serde_json::Value::Null)
        .await
        .unwrap();

    assert!(service.can_consume().await.unwrap());
    service.consume().await.unwrap();
    assert_eq!(service.snapshot().await.unwrap().prescription_count, 0);
    assert_eq!(service.remaining().await.unwrap(), None);
}

#[tokio::test]
async fn lifetime_code_grants_unlimited_premium() {
    let server = MockServer::start().await;
    mock_plan(&server, "Lifetime").await;
    let (service, _) = service(&server.uri());

    let outcome = service.redeem_code("abc123").await.unwrap();
    assert_eq!(outcome, ActivationOutcome::Lifetime);

    let state = service.snapshot().await.unwrap();
    assert!(state.is_premium);
    assert_eq!(state.premium_type.as_deref(), Some("Lifetime"));
    assert_eq!(state.expiry_date, None);
    assert_eq!(state.prescription_limit, None);
    // Codes are normalized to upper case before verification.
    assert_eq!(state.used_codes, vec!["ABC123".to_string()]);
}

#[tokio::test]
async fn codes_are_trimmed_and_uppercased_for_the_verifier() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("code", "ABC123"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "type": "Lifetime"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let (service, _) = service(&server.uri());

    service.redeem_code("  abc123  ").await.unwrap();
}

#[tokio::test]
async fn six_month_code_expires_six_calendar_months_out() {
    let server = MockServer::start().await;
    mock_plan(&server, "6 Month").await;
    let (service, _) = service(&server.uri());

    let now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let outcome = service.redeem_code_at("sub1", now).await.unwrap();

    let expected = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::Subscription {
            plan: "6 Month".to_string(),
            expires_at: expected
        }
    );

    let state = service.snapshot().await.unwrap();
    assert!(state.is_premium);
    assert_eq!(state.expiry_date, Some(expected));
    assert_eq!(state.prescription_limit, None);
}

#[tokio::test]
async fn renewal_extends_from_a_still_future_expiry() {
    let server = MockServer::start().await;
    mock_plan(&server, "6 Month").await;
    let (service, memory) = service(&server.uri());

    let store: Arc<dyn KeyValueStore> = memory.clone();
    store.set("isPremium", &true).await.unwrap();
    store
        .set(
            "expiryDate",
            &Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap();

    let now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    service.redeem_code_at("sub2", now).await.unwrap();

    let state = service.snapshot().await.unwrap();
    assert_eq!(
        state.expiry_date,
        Some(Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn one_year_code_adds_twelve_months() {
    let server = MockServer::start().await;
    mock_plan(&server, "1 Year").await;
    let (service, _) = service(&server.uri());

    let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
    service.redeem_code_at("year1", now).await.unwrap();

    let state = service.snapshot().await.unwrap();
    assert_eq!(
        state.expiry_date,
        Some(Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn trial_code_raises_the_limit_and_keeps_the_count() {
    let server = MockServer::start().await;
    mock_plan(&server, "Trial 20").await;
    let (service, _) = service(&server.uri());
    service.initialize().await.unwrap();
    service.consume().await.unwrap();

    let outcome = service.redeem_code("more1").await.unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::TrialExtended {
            added: 20,
            new_limit: 22
        }
    );

    let state = service.snapshot().await.unwrap();
    assert!(!state.is_premium);
    assert_eq!(state.prescription_limit, Some(22));
    assert_eq!(state.prescription_count, 1);
}

#[tokio::test]
async fn numeric_code_is_a_trial_extension() {
    let server = MockServer::start().await;
    mock_plan(&server, "25").await;
    let (service, _) = service(&server.uri());

    let outcome = service.redeem_code("more2").await.unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::TrialExtended {
            added: 25,
            new_limit: 27
        }
    );
}

#[tokio::test]
async fn trial_code_without_a_number_defaults_to_ten() {
    let server = MockServer::start().await;
    mock_plan(&server, "Trial").await;
    let (service, _) = service(&server.uri());

    let outcome = service.redeem_code("more3").await.unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::TrialExtended {
            added: 10,
            new_limit: 12
        }
    );
}

#[tokio::test]
async fn unrecognized_plan_is_unlimited_premium_without_expiry() {
    let server = MockServer::start().await;
    mock_plan(&server, "Partner").await;
    let (service, _) = service(&server.uri());

    let outcome = service.redeem_code("part1").await.unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::Premium {
            plan: "Partner".to_string()
        }
    );

    let state = service.snapshot().await.unwrap();
    assert!(state.is_premium);
    assert_eq!(state.expiry_date, None);
    assert_eq!(state.prescription_limit, None);
}

#[tokio::test]
async fn every_redeemed_code_is_recorded() {
    let server = MockServer::start().await;
    mock_plan(&server, "Trial 5").await;
    let (service, _) = service(&server.uri());

    service.redeem_code("dup1").await.unwrap();
    // Replay is not blocked; both redemptions land in the audit list.
    service.redeem_code("dup1").await.unwrap();

    let state = service.snapshot().await.unwrap();
    assert_eq!(
        state.used_codes,
        vec!["DUP1".to_string(), "DUP1".to_string()]
    );
    assert_eq!(state.prescription_limit, Some(12));
}

#[tokio::test]
async fn rejected_code_fails_with_the_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "message": "Code already used."
        })))
        .mount(&server)
        .await;
    let (service, _) = service(&server.uri());

    let result = service.redeem_code("bad1").await;
    assert_matches!(
        result,
        Err(EntitlementError::InvalidCode { message }) if message == "Code already used."
    );

    // A rejection never mutates state.
    let state = service.snapshot().await.unwrap();
    assert!(!state.is_premium);
    assert!(state.used_codes.is_empty());
}

#[tokio::test]
async fn server_error_is_a_verification_failure_not_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    let (service, _) = service(&server.uri());

    let result = service.redeem_code("code1").await;
    assert_matches!(result, Err(EntitlementError::Verification { .. }));
}

#[tokio::test]
async fn malformed_response_is_a_verification_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;
    let (service, _) = service(&server.uri());

    let result = service.redeem_code("code2").await;
    assert_matches!(result, Err(EntitlementError::Verification { .. }));
}

#[tokio::test]
async fn unreachable_server_is_a_verification_failure() {
    // Bind, grab the address, then drop the server.
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let (service, _) = service(&uri);
    let result = service.redeem_code("code3").await;
    assert_matches!(result, Err(EntitlementError::Verification { .. }));
}

#[tokio::test]
async fn lapsed_subscription_reverts_to_the_default_trial() {
    let (service, memory) = service("http://unused.test");
    let store: Arc<dyn KeyValueStore> = memory.clone();
    store.set("isPremium", &true).await.unwrap();
    store.set("premiumType", &"6 Month").await.unwrap();
    store.set("prescriptionCount", &9u32).await.unwrap();
    store
        .set(
            "expiryDate",
            &Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap();

    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let check = service.check_and_reconcile_expiry_at(now).await.unwrap();
    assert!(check.expired);

    let state = service.snapshot().await.unwrap();
    assert!(!state.is_premium);
    assert_eq!(state.premium_type, None);
    assert_eq!(state.expiry_date, None);
    assert_eq!(state.prescription_limit, Some(DEFAULT_TRIAL_LIMIT));
    assert_eq!(state.prescription_count, 0);

    // Idempotent: a second check reports nothing to do.
    let again = service.check_and_reconcile_expiry_at(now).await.unwrap();
    assert!(!again.expired);
}

#[tokio::test]
async fn a_future_expiry_is_left_alone() {
    let (service, memory) = service("http://unused.test");
    let store: Arc<dyn KeyValueStore> = memory.clone();
    store.set("isPremium", &true).await.unwrap();
    store
        .set(
            "expiryDate",
            &Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap();

    let now = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    let check = service.check_and_reconcile_expiry_at(now).await.unwrap();
    assert!(!check.expired);
    assert!(service.snapshot().await.unwrap().is_premium);
}

#[tokio::test]
async fn storage_failure_surfaces_from_consume() {
    let (service, memory) = service("http://unused.test");
    service.initialize().await.unwrap();

    memory.set_fail_writes(true);
    let result = service.consume().await;
    assert_matches!(result, Err(EntitlementError::Storage(_)));

    memory.set_fail_writes(false);
    assert_eq!(service.snapshot().await.unwrap().prescription_count, 0);
}
