/// End-to-end dispatch scenarios against the in-memory store and
/// recording provider clients.
mod common;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use common::{FakeClient, MemoryStore};
use push_gateway::config::AutomationConfig;
use push_gateway::dispatch::PushGateway;
use push_gateway::error::GatewayError;
use push_gateway::models::ProviderKind;
use push_gateway::providers::{Completion, PushClient};
use push_gateway::store::Store;

fn automation(auto_redeliver: bool, redeliver_attempts: u32, auto_deregister: bool) -> AutomationConfig {
    AutomationConfig {
        auto_redeliver,
        redeliver_attempts,
        auto_deregister,
        retry_interval_secs: 5,
    }
}

fn gateway(
    store: &Arc<MemoryStore>,
    apns: Option<Arc<FakeClient>>,
    gcm: Option<Arc<FakeClient>>,
    automation: AutomationConfig,
) -> PushGateway {
    PushGateway::new(
        store.clone() as Arc<dyn Store>,
        apns.map(|client| client as Arc<dyn PushClient>),
        gcm.map(|client| client as Arc<dyn PushClient>),
        automation,
    )
}

fn ok(kind: ProviderKind, ident: u32) -> Completion {
    Completion {
        kind,
        ident,
        error: None,
    }
}

fn failed(kind: ProviderKind, ident: u32, reason: &str) -> Completion {
    Completion {
        kind,
        ident,
        error: Some(reason.to_string()),
    }
}

#[tokio::test]
async fn happy_apns_push() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns.clone()), None, automation(true, 3, true));

    let device = store
        .register_apns_device(&[0xDE, 0xAD, 0xBE, 0xEF])
        .await
        .unwrap();
    let message = gw.push(device, "hi", "t").await.unwrap();

    let posts = apns.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].payload.contains("\"alert\":\"hi\""));
    {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        // The client receives the stored base64 token field.
        assert_eq!(posts[0].token, BASE64.encode([0xDE, 0xAD, 0xBE, 0xEF]));
    }

    gw.handle_completion(ok(ProviderKind::Apns, posts[0].ident))
        .await
        .unwrap();

    assert!(store.get_message(message).await.unwrap().is_none());
    assert!(store
        .get_failed_messages(ProviderKind::Apns)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn apns_failure_then_attempts_cap() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns.clone()), None, automation(true, 2, true));

    let device = store
        .register_apns_device(&[0xDE, 0xAD, 0xBE, 0xEF])
        .await
        .unwrap();
    let message = gw.push(device, "hi", "t").await.unwrap();

    // First failure: attempts goes 0 -> 1, message parked for redelivery.
    let ident = apns.last_ident().unwrap();
    gw.handle_completion(failed(ProviderKind::Apns, ident, "bad"))
        .await
        .unwrap();

    let parked = store.get_failed_messages(ProviderKind::Apns).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].message, message);
    assert_eq!(parked[0].attempts, 1);
    assert_eq!(parked[0].reason, "bad");

    // Redelivery pass claims and resubmits the persisted payload.
    gw.run_redelivery_pass().await;
    let posts = apns.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[1].payload, posts[0].payload);
    assert!(store
        .get_failed_messages(ProviderKind::Apns)
        .await
        .unwrap()
        .is_empty());

    // Second failure hits the cap; the message is retired for good.
    gw.handle_completion(failed(ProviderKind::Apns, posts[1].ident, "bad"))
        .await
        .unwrap();

    assert!(store.get_message(message).await.unwrap().is_none());
    assert!(store
        .get_failed_messages(ProviderKind::Apns)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn two_peers_race_on_one_claim() {
    let store = Arc::new(MemoryStore::new());
    let apns_one = FakeClient::new(ProviderKind::Apns);
    let apns_two = FakeClient::new(ProviderKind::Apns);
    let peer_one = gateway(&store, Some(apns_one.clone()), None, automation(true, 5, true));
    let peer_two = gateway(&store, Some(apns_two.clone()), None, automation(true, 5, true));

    let device = store.register_apns_device(&[1, 2, 3, 4]).await.unwrap();
    let message = peer_one.push(device, "hi", "").await.unwrap();
    peer_one
        .handle_completion(failed(ProviderKind::Apns, apns_one.last_ident().unwrap(), "bad"))
        .await
        .unwrap();
    assert_eq!(apns_one.post_count(), 1);

    // Both peers go after the same parked message; one claim wins.
    peer_one.redeliver(message, device, ProviderKind::Apns).await.unwrap();
    peer_two.redeliver(message, device, ProviderKind::Apns).await.unwrap();

    assert_eq!(apns_one.post_count(), 2);
    assert_eq!(apns_two.post_count(), 0);
}

#[tokio::test]
async fn feedback_with_auto_deregister_drops_device() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns), None, automation(true, 3, true));

    let token = [0xAA, 0xBB, 0xCC];
    let device = store.register_apns_device(&token).await.unwrap();

    gw.handle_feedback(&token, Utc::now()).await.unwrap();

    assert!(store.get_device_kind(device).await.unwrap().is_none());
    let token_b64 = {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        BASE64.encode(token)
    };
    assert!(store
        .find_device_by_token_b64(&token_b64)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn feedback_without_auto_deregister_marks_dead() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns), None, automation(true, 3, false));

    let token = [0xAA, 0xBB, 0xCC];
    let device = store.register_apns_device(&token).await.unwrap();
    let time = Utc::now();

    gw.handle_feedback(&token, time).await.unwrap();

    assert_eq!(
        store.get_device_kind(device).await.unwrap(),
        Some(ProviderKind::Apns)
    );
    let dead = store.get_dead_devices().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].device, device);
    assert_eq!(dead[0].time, time);
}

#[tokio::test]
async fn feedback_for_unknown_token_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns), None, automation(true, 3, true));

    let device = store.register_apns_device(&[1, 2, 3]).await.unwrap();

    gw.handle_feedback(&[9, 9, 9], Utc::now()).await.unwrap();

    assert!(store.get_device_kind(device).await.unwrap().is_some());
    assert!(store.get_dead_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn push_to_unconfigured_provider_leaves_no_record() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    // APNS configured, GCM not.
    let gw = gateway(&store, Some(apns.clone()), None, automation(true, 3, true));

    let apns_device = store.register_apns_device(&[1, 2, 3]).await.unwrap();
    assert!(gw.push(apns_device, "hi", "").await.is_ok());

    let gcm_device = store.register_gcm_device("reg-1").await.unwrap();
    let err = gw.push(gcm_device, "hi", "").await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ProviderNotConfigured(ProviderKind::Gcm)
    ));

    // Only the successful APNS push wrote a record.
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn push_to_unknown_device_fails() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway(
        &store,
        Some(FakeClient::new(ProviderKind::Apns)),
        None,
        automation(true, 3, true),
    );

    let err = gw.push(Uuid::new_v4(), "hi", "").await.unwrap_err();
    assert!(matches!(err, GatewayError::UnknownDevice(_)));
}

#[tokio::test]
async fn attempts_cap_of_one_retires_on_first_failure() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns.clone()), None, automation(true, 1, true));

    let device = store.register_apns_device(&[7]).await.unwrap();
    let message = gw.push(device, "hi", "").await.unwrap();

    gw.handle_completion(failed(ProviderKind::Apns, apns.last_ident().unwrap(), "bad"))
        .await
        .unwrap();

    assert!(store.get_message(message).await.unwrap().is_none());
    assert!(store
        .get_failed_messages(ProviderKind::Apns)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failures_park_message_when_auto_redeliver_is_off() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns.clone()), None, automation(false, 1, true));

    let device = store.register_apns_device(&[7]).await.unwrap();
    let message = gw.push(device, "hi", "").await.unwrap();

    // Past the cap, but auto-redeliver is off: nothing gets retired.
    gw.handle_completion(failed(ProviderKind::Apns, apns.last_ident().unwrap(), "bad"))
        .await
        .unwrap();

    assert!(store.get_message(message).await.unwrap().is_some());
    assert_eq!(
        store
            .get_failed_messages(ProviderKind::Apns)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn completion_for_unknown_identifier_is_an_invariant_violation() {
    let store = Arc::new(MemoryStore::new());
    let gw = gateway(
        &store,
        Some(FakeClient::new(ProviderKind::Apns)),
        None,
        automation(true, 3, true),
    );

    let err = gw
        .handle_completion(ok(ProviderKind::Apns, 4242))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::CorrelationViolation { ident: 4242, .. }
    ));
}

#[tokio::test]
async fn drop_device_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let device = store.register_apns_device(&[1]).await.unwrap();

    store.drop_device(device).await.unwrap();
    store.drop_device(device).await.unwrap();

    assert!(store.get_device_kind(device).await.unwrap().is_none());
}

#[tokio::test]
async fn register_and_lookup_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let token = [0xDE, 0xAD, 0xBE, 0xEF];
    let device = store.register_apns_device(&token).await.unwrap();

    let token_b64 = {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        BASE64.encode(token)
    };
    assert_eq!(
        store.find_device_by_token_b64(&token_b64).await.unwrap(),
        Some(device)
    );
    assert_eq!(
        store.get_device_kind(device).await.unwrap(),
        Some(ProviderKind::Apns)
    );
}

#[tokio::test]
async fn message_record_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let device = store.register_gcm_device("reg-1").await.unwrap();

    let message = store
        .write_message(device, ProviderKind::Gcm, r#"{"msg":"x"}"#, "tag-1")
        .await
        .unwrap();

    let record = store.get_message(message).await.unwrap().unwrap();
    assert_eq!(record.device, device);
    assert_eq!(record.kind, ProviderKind::Gcm);
    assert_eq!(record.tag, "tag-1");
    // Fresh records report attempts as 1 even before the first failure.
    assert_eq!(record.attempts, 1);
    assert_eq!(
        store.get_message_payload(message).await.unwrap(),
        r#"{"msg":"x"}"#
    );
}

#[tokio::test]
async fn failed_set_claim_is_single_winner() {
    let store = Arc::new(MemoryStore::new());
    let device = store.register_gcm_device("reg-1").await.unwrap();
    let message = store
        .write_message(device, ProviderKind::Gcm, "{}", "")
        .await
        .unwrap();

    assert_eq!(store.mark_message_failed(message, "bad").await.unwrap(), 1);
    assert_eq!(
        store
            .get_failed_messages(ProviderKind::Gcm)
            .await
            .unwrap()
            .len(),
        1
    );

    assert!(store.remove_from_failed_set(message).await.unwrap());
    assert!(!store.remove_from_failed_set(message).await.unwrap());
    assert!(store
        .get_failed_messages(ProviderKind::Gcm)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn redelivery_pass_skips_unconfigured_providers() {
    let store = Arc::new(MemoryStore::new());
    let apns = FakeClient::new(ProviderKind::Apns);
    let gw = gateway(&store, Some(apns.clone()), None, automation(true, 5, true));

    // Park a GCM message while only APNS is configured.
    let device = store.register_gcm_device("reg-1").await.unwrap();
    let message = store
        .write_message(device, ProviderKind::Gcm, "{}", "")
        .await
        .unwrap();
    store.mark_message_failed(message, "bad").await.unwrap();

    gw.run_redelivery_pass().await;

    // Unclaimed: the message stays parked for a peer that speaks GCM.
    assert_eq!(apns.post_count(), 0);
    assert_eq!(
        store
            .get_failed_messages(ProviderKind::Gcm)
            .await
            .unwrap()
            .len(),
        1
    );
}
