use serde_json::json;

use rocket_rides_server::idempotency::{
    Acquisition, IdempotencyKey, InboundRequest, RecoveryPoint, acquire,
};

use crate::helpers::{MockGateway, ScriptedCharge, ride_body, seed_user, spawn_app, spawn_app_with_gateway};

#[tokio::test]
async fn creating_a_ride_charges_once_and_stores_the_response() {
    let app = spawn_app().await;

    let response = app.post_ride("first-ride", &ride_body()).await;

    assert_eq!(201, response.status().as_u16());
    let ride: serde_json::Value = response.json().await.unwrap();
    assert!(ride["id"].is_i64());
    let expected_token = format!("ride-{}-first-ride", app.test_user.id);
    assert_eq!(ride["charge_id"], json!(format!("ch_{expected_token}")));

    assert_eq!(app.ride_count().await, 1);
    assert_eq!(app.staged_job_count().await, 1);
    assert_eq!(app.gateway.tokens(), vec![expected_token]);

    let key = app.fetch_key("first-ride").await.unwrap();
    assert_eq!(key.recovery_point, RecoveryPoint::Finished);
    assert!(key.locked_at.is_none());
    assert!(key.response.is_some());
}

#[tokio::test]
async fn retrying_a_finished_request_replays_the_response_byte_for_byte() {
    let app = spawn_app().await;

    let first = app.post_ride("retry-me", &ride_body()).await;
    let first_status = first.status().as_u16();
    let first_body = first.text().await.unwrap();

    let second = app.post_ride("retry-me", &ride_body()).await;
    let second_status = second.status().as_u16();
    let second_body = second.text().await.unwrap();

    assert_eq!(first_status, second_status);
    assert_eq!(first_body, second_body);
    // exactly one effect of each kind
    assert_eq!(app.ride_count().await, 1);
    assert_eq!(app.staged_job_count().await, 1);
    assert_eq!(app.gateway.call_count(), 1);
}

#[tokio::test]
async fn reusing_a_key_with_different_params_conflicts() {
    let app = spawn_app().await;

    let first = app.post_ride("frozen-params", &ride_body()).await;
    assert_eq!(201, first.status().as_u16());

    let mut different = ride_body();
    different["target_lat"] = json!(40.0);
    let second = app.post_ride("frozen-params", &different).await;

    assert_eq!(409, second.status().as_u16());
    // nothing about the stored request changed
    let key = app.fetch_key("frozen-params").await.unwrap();
    assert_eq!(key.request_params["target_lat"], json!(37.80));
    assert_eq!(app.ride_count().await, 1);
}

#[tokio::test]
async fn a_duplicate_in_flight_is_rejected_as_in_progress() {
    let app = spawn_app().await;

    // the first request holds the lease, as if it were mid-phase right now
    let params = ride_body();
    let key = IdempotencyKey::try_from("in-flight".to_string()).unwrap();
    let inbound = InboundRequest {
        user_id: app.test_user.id,
        key: &key,
        method: "POST",
        path: "/rides",
        params: &params,
    };
    let winner = acquire(&app.db_pool, &inbound, app.settings.lease_ttl()).await.unwrap();
    assert!(matches!(winner, Acquisition::New(_)));

    let response = app.post_ride("in-flight", &ride_body()).await;

    assert_eq!(409, response.status().as_u16());
    assert_eq!(app.ride_count().await, 0);
}

#[tokio::test]
async fn an_abandoned_lease_is_stolen_and_the_request_completes() {
    let app = spawn_app().await;

    // simulate a request that acquired the key and died before phase one
    let params = ride_body();
    let key = IdempotencyKey::try_from("abandoned".to_string()).unwrap();
    let inbound = InboundRequest {
        user_id: app.test_user.id,
        key: &key,
        method: "POST",
        path: "/rides",
        params: &params,
    };
    acquire(&app.db_pool, &inbound, app.settings.lease_ttl()).await.unwrap();
    let ttl_seconds = i64::from(app.settings.lease_ttl_seconds);
    app.backdate_lease("abandoned", ttl_seconds + 5).await;

    let response = app.post_ride("abandoned", &ride_body()).await;

    assert_eq!(201, response.status().as_u16());
    assert_eq!(app.ride_count().await, 1);
    assert_eq!(app.gateway.call_count(), 1);
}

#[tokio::test]
async fn a_crash_between_phases_resumes_without_double_effects() {
    // two transient failures exhaust the default attempt budget, leaving the
    // key exactly where the last successful phase committed it
    let gateway = MockGateway::scripted([ScriptedCharge::Transient, ScriptedCharge::Transient]);
    let app = spawn_app_with_gateway(gateway).await;

    let first = app.post_ride("interrupted", &ride_body()).await;
    assert_eq!(503, first.status().as_u16());

    let key = app.fetch_key("interrupted").await.unwrap();
    assert_eq!(key.recovery_point, RecoveryPoint::RideCreated);
    assert!(key.locked_at.is_none());
    assert_eq!(app.ride_count().await, 1);
    assert_eq!(app.staged_job_count().await, 0);
    assert_eq!(app.gateway.call_count(), 2);

    // the retry resumes at the charge phase; the ride is not recreated
    let second = app.post_ride("interrupted", &ride_body()).await;
    assert_eq!(201, second.status().as_u16());
    assert_eq!(app.ride_count().await, 1);
    assert_eq!(app.staged_job_count().await, 1);

    let tokens = app.gateway.tokens();
    assert_eq!(tokens.len(), 3);
    assert!(tokens.iter().all(|t| t == &tokens[0]));

    let key = app.fetch_key("interrupted").await.unwrap();
    assert_eq!(key.recovery_point, RecoveryPoint::Finished);
}

#[tokio::test]
async fn a_declined_charge_finishes_the_key_with_402() {
    let gateway = MockGateway::scripted([ScriptedCharge::Declined("insufficient_funds")]);
    let app = spawn_app_with_gateway(gateway).await;

    let first = app.post_ride("declined", &ride_body()).await;

    assert_eq!(402, first.status().as_u16());
    let body: serde_json::Value = first.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("insufficient_funds"));

    let key = app.fetch_key("declined").await.unwrap();
    assert_eq!(key.recovery_point, RecoveryPoint::Finished);

    // retries replay the decline without touching the processor again
    let second = app.post_ride("declined", &ride_body()).await;
    assert_eq!(402, second.status().as_u16());
    assert_eq!(app.gateway.call_count(), 1);
    assert_eq!(app.staged_job_count().await, 0);
}

#[tokio::test]
async fn invalid_coordinates_finish_the_key_with_422() {
    let app = spawn_app().await;

    let mut body = ride_body();
    body["origin_lat"] = json!(123.0);
    let first = app.post_ride("bad-coords", &body).await;

    assert_eq!(422, first.status().as_u16());
    assert_eq!(app.ride_count().await, 0);
    assert_eq!(app.gateway.call_count(), 0);

    // the terminal response replays like any other
    let second = app.post_ride("bad-coords", &body).await;
    assert_eq!(422, second.status().as_u16());
}

#[tokio::test]
async fn requests_without_credentials_are_rejected() {
    let app = spawn_app().await;

    let response = app
        .api_client
        .post(format!("{}/rides", &app.address))
        .header("Idempotency-Key", "no-auth")
        .json(&ride_body())
        .send()
        .await
        .expect("Failed to execute request.");
    assert_eq!(401, response.status().as_u16());

    let unknown = app
        .api_client
        .post(format!("{}/rides", &app.address))
        .header("Idempotency-Key", "no-auth")
        .header("Authorization", "nobody@example.com")
        .json(&ride_body())
        .send()
        .await
        .expect("Failed to execute request.");
    assert_eq!(401, unknown.status().as_u16());
}

#[tokio::test]
async fn requests_without_an_idempotency_key_are_rejected() {
    let app = spawn_app().await;

    let response = app
        .api_client
        .post(format!("{}/rides", &app.address))
        .header("Authorization", &app.test_user.email)
        .json(&ride_body())
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(400, response.status().as_u16());
    assert_eq!(app.ride_count().await, 0);
}

#[tokio::test]
async fn a_rider_only_sees_their_own_rides() {
    let app = spawn_app().await;

    let created = app.post_ride("mine", &ride_body()).await;
    let ride: serde_json::Value = created.json().await.unwrap();
    let ride_id = ride["id"].as_i64().unwrap();

    let response = app.get_ride(ride_id).await;
    assert_eq!(200, response.status().as_u16());

    let other_user = seed_user(&app.db_pool).await;
    let response = app.get_ride_as(&other_user.email, ride_id).await;
    assert_eq!(404, response.status().as_u16());
}
