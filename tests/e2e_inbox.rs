//! E2E tests for inbound federation
//!
//! Signed requests go through the real router and queue; workers are
//! driven explicitly so every assertion sees a settled state.

mod common;

use std::time::Duration;

use aperture::data::{DeliveryEventResult, JobStatus};
use aperture::federation::{ActivityKind, builder, queues};
use common::{ALICE, TestServer, remote_signer};
use serde_json::json;

async fn job_count(server: &TestServer, queue: &str, status: Option<JobStatus>) -> i64 {
    server.state.db.count_jobs(queue, status).await.unwrap()
}

#[tokio::test]
async fn follow_is_accepted_end_to_end() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;

    let follow = builder::follow("https://remote.example/follows/1", ALICE, &bob.uri);
    let response = server
        .post_signed("/actors/bob/inbox", &remote_signer(ALICE), &follow)
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(job_count(&server, queues::USER_INBOX, None).await, 1);

    server.drain().await;

    let stored = server.state.db.get_follow(ALICE, &bob.uri).await.unwrap().unwrap();
    assert!(stored.approved);

    let delivered = server.delivered();
    assert_eq!(delivered.len(), 1);
    let (inbox, accept) = &delivered[0];
    assert_eq!(inbox, &format!("{}/inbox", ALICE));
    assert_eq!(accept.kind, ActivityKind::Accept);
    assert_eq!(accept.primary_actor(), bob.uri);
    assert_eq!(accept.object_id(), Some("https://remote.example/follows/1"));

    let (events, total) = server
        .state
        .db
        .list_delivery_events(&Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(events[0].event_type, "Accept");
    assert_eq!(events[0].result, DeliveryEventResult::Finished);
}

#[tokio::test]
async fn shared_inbox_routes_to_its_own_queue() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;
    let status_uri = format!("{}/statuses/1", bob.uri);

    let like = builder::like("https://remote.example/likes/1", ALICE, &status_uri);
    let response = server
        .post_signed("/shared/inbox", &remote_signer(ALICE), &like)
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(job_count(&server, queues::SHARED_INBOX, None).await, 1);

    server.drain().await;
    assert_eq!(server.state.db.count_favourites(&status_uri).await.unwrap(), 1);
}

#[tokio::test]
async fn unsigned_and_malformed_requests_are_acknowledged_but_dropped() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;

    let follow = builder::follow("https://remote.example/follows/1", ALICE, &bob.uri);
    let unsigned = server
        .client
        .post(server.url("/actors/bob/inbox"))
        .json(&follow)
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), 200);

    let malformed = server
        .client
        .post(server.url("/actors/bob/inbox"))
        .header("Signature", "keyId=\"x\"")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 200);

    assert_eq!(job_count(&server, queues::USER_INBOX, None).await, 0);
    assert!(server.state.db.get_follow(ALICE, &bob.uri).await.unwrap().is_none());
}

#[tokio::test]
async fn blocked_domain_follow_leaves_no_trace() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;

    let blocked = server
        .admin_post("/admin/domain-blocks", &json!({ "domain": "Blocked.Example" }))
        .await;
    assert_eq!(blocked.status(), 201);

    let spammer = "https://blocked.example/users/spammer";
    let follow = builder::follow("https://blocked.example/follows/1", spammer, &bob.uri);
    let response = server
        .post_signed("/actors/bob/inbox", &remote_signer(spammer), &follow)
        .await;
    assert_eq!(response.status(), 200);

    assert_eq!(job_count(&server, queues::USER_INBOX, None).await, 0);
    server.drain().await;
    assert!(server.state.db.get_follow(spammer, &bob.uri).await.unwrap().is_none());
    assert!(server.transport.posts().is_empty());
    let (_, events) = server
        .state
        .db
        .list_delivery_events(&Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(events, 0);
}

#[tokio::test]
async fn tampered_body_fails_verification() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;

    let signed = serde_json::to_vec(&builder::follow(
        "https://remote.example/follows/1",
        ALICE,
        &bob.uri,
    ))
    .unwrap();
    let sent = serde_json::to_vec(&builder::follow(
        "https://remote.example/follows/2",
        ALICE,
        &bob.uri,
    ))
    .unwrap();

    let response = server
        .post_signed_body("/actors/bob/inbox", &remote_signer(ALICE), &signed, &sent)
        .await;
    assert_eq!(response.status(), 200);

    server.drain().await;
    assert_eq!(
        job_count(&server, queues::USER_INBOX, Some(JobStatus::Failed)).await,
        1
    );
    assert!(server.state.db.get_follow(ALICE, &bob.uri).await.unwrap().is_none());
    assert!(server.transport.posts().is_empty());
}

#[tokio::test]
async fn impersonation_through_foreign_key_is_rejected() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;

    // Carol signs a Follow that claims to come from Alice.
    let follow = builder::follow("https://remote.example/follows/1", ALICE, &bob.uri);
    server
        .post_signed(
            "/actors/bob/inbox",
            &remote_signer(common::CAROL),
            &follow,
        )
        .await;

    server.drain().await;
    assert_eq!(
        job_count(&server, queues::USER_INBOX, Some(JobStatus::Failed)).await,
        1
    );
    assert!(server.state.db.get_follow(ALICE, &bob.uri).await.unwrap().is_none());
}

#[tokio::test]
async fn redelivered_activity_is_applied_once() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;
    let status_uri = format!("{}/statuses/1", bob.uri);

    let like = builder::like("https://remote.example/likes/1", ALICE, &status_uri);
    let undo = builder::undo(
        "https://remote.example/undo/1",
        ALICE,
        json!("https://remote.example/likes/1"),
    );

    for activity in [&like, &undo, &like] {
        server
            .post_signed("/actors/bob/inbox", &remote_signer(ALICE), activity)
            .await;
        server.drain().await;
    }

    assert_eq!(server.state.db.count_favourites(&status_uri).await.unwrap(), 0);
    assert!(
        server
            .state
            .db
            .is_activity_processed("https://remote.example/likes/1")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn inbox_of_unknown_actor_is_dropped_by_worker() {
    let server = TestServer::new().await;

    let follow = builder::follow(
        "https://remote.example/follows/1",
        ALICE,
        &server.url("/actors/ghost"),
    );
    let response = server
        .post_signed("/actors/ghost/inbox", &remote_signer(ALICE), &follow)
        .await;
    assert_eq!(response.status(), 200);

    server.drain().await;
    assert_eq!(
        job_count(&server, queues::USER_INBOX, Some(JobStatus::Failed)).await,
        1
    );
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let server = TestServer::with_config(|config| {
        config.federation.inbound.max_body_bytes = 256;
    })
    .await;
    server.create_local_actor("bob", false).await;

    let response = server
        .client
        .post(server.url("/actors/bob/inbox"))
        .header("Signature", "keyId=\"x\"")
        .body(vec![b' '; 1024])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert_eq!(job_count(&server, queues::USER_INBOX, None).await, 0);
}

#[tokio::test]
async fn background_workers_process_queued_jobs() {
    let server = TestServer::new().await;
    let bob = server.create_local_actor("bob", false).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = server
        .state
        .start_background_tasks(shutdown_rx)
        .await
        .unwrap();

    let follow = builder::follow("https://remote.example/follows/1", ALICE, &bob.uri);
    server
        .post_signed("/actors/bob/inbox", &remote_signer(ALICE), &follow)
        .await;

    let mut accepted = false;
    for _ in 0..100 {
        if server.transport.posts_to(&format!("{}/inbox", ALICE)) == 1 {
            accepted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(accepted, "Accept was not delivered by background workers");

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
