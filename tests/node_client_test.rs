use ledger_fleet_simulator::{Backoff, NodeApi, NodeClient, NodeClientError};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> NodeClient {
    NodeClient::with_base_url(server.uri(), Duration::from_secs(5), Duration::from_secs(5)).unwrap()
}

async fn password_challenge(server: &MockServer, endpoint: &str) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Password needed",
            "result": {"id": "req-1", "mode": 0}
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn transfer_completes_signing_handshake() {
    let server = MockServer::start().await;
    password_challenge(&server, "/api/initiate-rbt-transfer").await;
    Mock::given(method("POST"))
        .and(path("/api/signature-response"))
        .and(body_partial_json(json!({"id": "req-1", "mode": 0, "password": "pw"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Transfer finished successfully in 1.2s with trnxid 0a1b2c ",
            "result": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tx_id = client(&server)
        .initiate_transfer("alice", "bob", 2.0, "Transaction 0 from node7 to node8", "pw")
        .await
        .unwrap();
    assert_eq!(tx_id, "0a1b2c");
}

#[tokio::test]
async fn transfer_body_carries_rounded_amount() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/initiate-rbt-transfer"))
        .and(body_json(json!({
            "sender": "alice",
            "receiver": "bob",
            "tokenCOunt": 1.234,
            "comment": "memo",
            "type": 2
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Password needed",
            "result": {"id": "req-9", "mode": 0}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/signature-response"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Transfer finished successfully"
        })))
        .mount(&server)
        .await;

    // no id in the confirmation: the signing request id stands in
    let tx_id = client(&server)
        .initiate_transfer("alice", "bob", 1.23456, "memo", "pw")
        .await
        .unwrap();
    assert_eq!(tx_id, "req-9");
}

#[tokio::test]
async fn rejected_signature_is_an_error() {
    let server = MockServer::start().await;
    password_challenge(&server, "/api/initiate-rbt-transfer").await;
    Mock::given(method("POST"))
        .and(path("/api/signature-response"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": false,
            "message": "insufficient tokens"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .initiate_transfer("alice", "bob", 5.0, "memo", "pw")
        .await
        .unwrap_err();
    match err {
        NodeClientError::Rejected { operation, message } => {
            assert_eq!(operation, "initiate-rbt-transfer");
            assert_eq!(message, "insufficient tokens");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn registration_goes_through_handshake() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/register-did"))
        .and(body_json(json!({"did": "bafy1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Password needed",
            "result": {"id": "reg-1", "mode": 0}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/signature-response"))
        .and(body_partial_json(json!({"id": "reg-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "DID registered successfully"
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).register_identity("bafy1", "pw").await.unwrap();
}

#[tokio::test]
async fn funding_without_challenge_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate-test-token"))
        .and(body_json(json!({"number_of_tokens": 100, "did": "bafy1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Test tokens generated successfully"
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).request_funding("bafy1", 100, "pw").await.unwrap();
}

#[tokio::test]
async fn balance_is_read_from_first_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/get-account-info"))
        .and(query_param("did", "bafy1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Got account info successfully",
            "account_info": [{"did": "bafy1", "rbt_amount": 42.5}]
        })))
        .mount(&server)
        .await;

    let balance = client(&server).get_balance("bafy1").await.unwrap();
    assert_eq!(balance, 42.5);
}

#[tokio::test]
async fn empty_account_info_is_missing_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/get-account-info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "",
            "account_info": []
        })))
        .mount(&server)
        .await;

    let err = client(&server).get_balance("bafy2").await.unwrap_err();
    assert!(matches!(err, NodeClientError::MissingAccount(id) if id == "bafy2"));
}

#[tokio::test]
async fn server_errors_carry_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client(&server).ping().await.unwrap_err();
    assert!(matches!(err, NodeClientError::Status { status: 500, ref body } if body == "boom"));
}

#[tokio::test]
async fn malformed_json_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/getallquorum"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = client(&server).get_topology().await.unwrap_err();
    assert!(matches!(err, NodeClientError::Decode { operation: "getallquorum", .. }));
}

#[tokio::test]
async fn identity_creation_posts_multipart_config() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/createdid"))
        .and(body_string_contains("did_config"))
        .and(body_string_contains("\"priv_pwd\":\"pw\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "DID created successfully",
            "result": {"did": "bafyabc", "peerID": "12D3KooW"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = client(&server).create_identity("pw").await.unwrap();
    assert_eq!(created.identity, "bafyabc");
    assert_eq!(created.peer_id, "12D3KooW");
}

#[tokio::test]
async fn topology_round_trips_through_node() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/addquorum"))
        .and(body_json(json!([
            {"type": 2, "address": "bafy1"},
            {"type": 2, "address": "bafy2"}
        ])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Quorum list added successfully"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/getallquorum"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Got all quorums successfully",
            "result": [
                {"type": 2, "address": "bafy1"},
                {"type": 2, "address": "bafy2"}
            ]
        })))
        .mount(&server)
        .await;

    let node = client(&server);
    let members = vec!["bafy1".to_string(), "bafy2".to_string()];
    node.configure_topology(&members).await.unwrap();
    assert_eq!(node.get_topology().await.unwrap(), members);
}

#[tokio::test]
async fn consensus_setup_sends_both_passwords() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/setup-quorum"))
        .and(body_json(json!({
            "did": "bafy1",
            "password": "key-pw",
            "priv_password": "id-pw"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Quorum setup successfully"
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .setup_consensus_role("bafy1", "key-pw", "id-pw")
        .await
        .unwrap();
}

#[tokio::test]
async fn peer_count_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/get-peer-count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "",
            "peerCount": 6
        })))
        .mount(&server)
        .await;

    assert_eq!(client(&server).peer_count().await.unwrap(), 6);
}

#[tokio::test]
async fn readiness_waits_for_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/node-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "Node is up and running"
        })))
        .mount(&server)
        .await;

    let backoff = Backoff {
        initial_ms: 10,
        multiplier: 2.0,
        max_ms: 50,
    };
    client(&server)
        .wait_until_ready(Duration::from_secs(2), &backoff)
        .await
        .unwrap();
}

#[tokio::test]
async fn readiness_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/node-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": false,
            "message": "core not started"
        })))
        .mount(&server)
        .await;

    let backoff = Backoff {
        initial_ms: 20,
        multiplier: 2.0,
        max_ms: 100,
    };
    let err = client(&server)
        .wait_until_ready(Duration::from_millis(300), &backoff)
        .await
        .unwrap_err();
    assert!(matches!(err, NodeClientError::Timeout(t) if t == Duration::from_millis(300)));
}
