//! E2E tests for outbox delivery and inbound inbox POSTs

mod common;

use common::{AS2, RemotePeer, TestServer, eventually};
use courier::config::HttpConfig;
use courier::federation::{
    HttpSignatureSigner, HttpTransport, RequestBody, RequestOptions, ReqwestTransport,
    verify_signature,
};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde_json::{Value, json};
use std::sync::Arc;

const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

fn peer_transport() -> ReqwestTransport {
    ReqwestTransport::new(&HttpConfig {
        timeout_seconds: 5,
        verify: true,
        follow_redirects: false,
        user_agent: "RemotePeer/test".to_string(),
        allow_private_addresses: false,
    })
    .unwrap()
}

/// POST `activity` to `inbox`, signed as bob
async fn post_as_bob(peer: &RemotePeer, inbox: &str, activity: &Value) -> u16 {
    let signer =
        HttpSignatureSigner::new(format!("{}#main-key", peer.bob()), &peer.private_key_pem)
            .unwrap();
    let options = RequestOptions::new()
        .with_header(CONTENT_TYPE, HeaderValue::from_static(AS2))
        .with_signer(Arc::new(signer));

    peer_transport()
        .post(inbox, RequestBody::Bytes(activity.to_string().into_bytes()), options)
        .await
        .unwrap()
        .status_code
}

async fn collection_contains(server: &TestServer, collection: &str, item: &str) -> bool {
    server
        .stored(collection)
        .await
        .and_then(|collection| collection["orderedItems"].as_array().cloned())
        .is_some_and(|items| items.iter().any(|entry| entry == item))
}

#[tokio::test]
async fn test_outbox_post_delivers_to_remote_and_local_inboxes() {
    let server = TestServer::new().await;
    let peer = RemotePeer::start().await;
    let alice = server.actor_uri("alice");
    let carol = server.actor_uri("carol");

    let response = server
        .post_as_alice(
            "/actor/alice/outbox",
            &json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "type": "Create",
                "to": [peer.bob()],
                "cc": [PUBLIC],
                "bcc": [carol],
                "object": {
                    "type": "Note",
                    "content": "Hello, fediverse"
                }
            }),
        )
        .await;

    assert_eq!(response.status(), 201);
    let activity_id = response.headers()["location"].to_str().unwrap().to_string();
    assert!(activity_id.starts_with(&format!("{}/activities/", alice)));

    // Remote delivery: signed, addressed copy without blind recipients
    let received = peer.wait_for(1).await;
    assert_eq!(received.len(), 1);
    let delivery = &received[0];
    let body: Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(body["id"], activity_id);
    assert_eq!(body["actor"], alice);
    assert!(body.get("bcc").is_none());
    assert!(body.get("bto").is_none());
    assert!(body["object"]["id"].as_str().unwrap().starts_with(&format!("{}/objects/", alice)));

    let actor = server.stored(&alice).await.unwrap();
    let public_key_pem = actor["publicKey"]["publicKeyPem"].as_str().unwrap();
    verify_signature(
        "POST",
        &delivery.path,
        &delivery.headers,
        Some(&delivery.body),
        public_key_pem,
    )
    .unwrap();

    // Local delivery: carol's inbox references the activity
    let carol_inbox = format!("{}/inbox", carol);
    eventually(|| collection_contains(&server, &carol_inbox, &activity_id)).await;

    let outbox = format!("{}/outbox", alice);
    assert!(collection_contains(&server, &outbox, &activity_id).await);
}

#[tokio::test]
async fn test_anonymous_reads_hide_blind_recipients_and_inboxes() {
    let server = TestServer::new().await;
    let carol = server.actor_uri("carol");

    let response = server
        .post_as_alice(
            "/actor/alice/outbox",
            &json!({
                "type": "Create",
                "to": [PUBLIC],
                "bcc": [carol],
                "object": {"type": "Note", "content": "guess who"}
            }),
        )
        .await;
    assert_eq!(response.status(), 201);
    let activity_id = response.headers()["location"].to_str().unwrap().to_string();
    assert!(server.stored(&activity_id).await.unwrap().get("bcc").is_some());

    let response = server
        .client
        .get(&activity_id)
        .header("accept", AS2)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let activity: Value = response.json().await.unwrap();
    assert_eq!(activity["id"], activity_id);
    assert!(activity.get("bcc").is_none());

    let response = server
        .client
        .get(format!("{}/inbox", carol))
        .header("accept", AS2)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_outbox_post_by_other_actor_is_forbidden() {
    let server = TestServer::new().await;
    let peer = RemotePeer::start().await;

    let status = post_as_bob(
        &peer,
        &server.url("/actor/alice/outbox"),
        &json!({
            "type": "Create",
            "actor": peer.bob(),
            "object": {"type": "Note", "content": "not mine"}
        }),
    )
    .await;

    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_outbox_post_requires_authentication() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/actor/alice/outbox"))
        .header("content-type", AS2)
        .body(json!({"type": "Create", "object": {"type": "Note"}}).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_signed_inbox_post_is_accepted() {
    let server = TestServer::new().await;
    let peer = RemotePeer::start().await;
    let alice = server.actor_uri("alice");
    let activity_id = format!("{}/activities/1", peer.base);

    let status = post_as_bob(
        &peer,
        &format!("{}/inbox", alice),
        &json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id,
            "type": "Follow",
            "actor": peer.bob(),
            "object": alice
        }),
    )
    .await;

    assert_eq!(status, 202);
    assert!(collection_contains(&server, &format!("{}/inbox", alice), &activity_id).await);
    assert_eq!(server.stored(&activity_id).await.unwrap()["type"], "Follow");
}

#[tokio::test]
async fn test_inbox_post_for_someone_else_is_forbidden() {
    let server = TestServer::new().await;
    let peer = RemotePeer::start().await;
    let alice = server.actor_uri("alice");

    let status = post_as_bob(
        &peer,
        &format!("{}/inbox", alice),
        &json!({
            "id": format!("{}/activities/2", peer.base),
            "type": "Follow",
            "actor": server.actor_uri("carol"),
            "object": alice
        }),
    )
    .await;

    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_unsigned_inbox_post_is_unauthorized() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/actor/alice/inbox"))
        .header("content-type", AS2)
        .body(json!({"id": "https://elsewhere.example/1", "type": "Like"}).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_internal_properties_are_stripped_from_posts() {
    let server = TestServer::new().await;

    let response = server
        .post_as_alice(
            "/actor/alice/outbox",
            &json!({
                "type": "Create",
                "courier:role": ["admin"],
                "object": {"type": "Note", "content": "hi"}
            }),
        )
        .await;

    assert_eq!(response.status(), 201);
    let activity_id = response.headers()["location"].to_str().unwrap().to_string();
    let stored = server.stored(&activity_id).await.unwrap();
    assert!(stored.get("courier:role").is_none());
}
