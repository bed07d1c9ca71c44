//! E2E tests for health check and basic server functionality

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_404_for_unknown_routes() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/unknown/route"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("aperture_"));
}

#[tokio::test]
async fn test_instance_actor_document() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/actors/instance"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/activity+json"
    );

    let actor: Value = response.json().await.unwrap();
    let id = server.url("/actors/instance");
    assert_eq!(actor["type"], "Application");
    assert_eq!(actor["id"], id);
    assert_eq!(actor["inbox"], format!("{}/inbox", id));
    assert_eq!(actor["endpoints"]["sharedInbox"], server.url("/shared/inbox"));
    assert_eq!(actor["publicKey"]["id"], format!("{}#main-key", id));
    assert!(
        actor["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY")
    );
    assert!(actor.get("privateKeyPem").is_none());
}

#[tokio::test]
async fn test_unknown_actor_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/actors/nobody"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}
