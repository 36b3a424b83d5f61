//! Request correlation: concurrency, late responses, timeouts, cancellation.

mod common;

use std::time::Duration;

use common::*;
use futures_util::future::join_all;
use mxlink::protocol::{Frame, ListenerId, Notification, Operation};
use mxlink::{AllowAll, ClientConfig, TransportError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn concurrent_requests_each_get_their_own_response() -> anyhow::Result<()> {
    let fixture = Fixture::start(AllowAll).await;
    let client = fixture.client();
    client.connect().await?;

    let calls = (0..64u64).map(|i| {
        let client = client.clone();
        async move {
            let delay = (i * 37) % 50;
            let label = format!("req-{}", i);
            let result = client
                .invoke(&r1(), "slow", vec![json!(delay), json!(label)], Vec::new())
                .await;
            (label, result)
        }
    });
    for (label, result) in join_all(calls).await {
        assert_eq!(result?, json!(label));
    }
    assert_eq!(client.connection().correlator_stats().in_flight, 0);

    client.close().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn timed_out_request_drops_its_late_response() {
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, ClientConfig::default());
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    let waiter = client.clone();
    let slow = tokio::spawn(async move {
        waiter
            .request_with(&Operation::GetDomains, Some(Duration::from_millis(50)), None)
            .await
    });
    let (late_id, _) = peer.next_request().await;
    let err = bounded(slow).await.unwrap().unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));
    assert!(err.is_retryable());

    peer.respond_ok(late_id, json!(["late"])).await;

    // the reader survives and keeps correlating
    let waiter = client.clone();
    let next = tokio::spawn(async move { waiter.domains().await });
    let (id, _) = peer.next_request().await;
    assert_eq!(id, late_id + 1);
    peer.respond_ok(id, json!(["fresh"])).await;
    assert_eq!(bounded(next).await.unwrap().unwrap(), vec!["fresh".to_string()]);

    let stats = client.connection().correlator_stats();
    assert_eq!(stats.late_responses, 1);
    assert_eq!(stats.unknown_responses, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn cancelled_wait_is_interrupted_not_timed_out() {
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, ClientConfig::default());
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    let token = CancellationToken::new();
    let waiter = client.clone();
    let cancel = token.clone();
    let pending = tokio::spawn(async move {
        waiter
            .request_with(&Operation::GetResourceCount, None, Some(&cancel))
            .await
    });
    let (id, _) = peer.next_request().await;
    token.cancel();
    assert_eq!(
        bounded(pending).await.unwrap().unwrap_err(),
        TransportError::Interrupted
    );

    peer.respond_ok(id, json!(3)).await;
    assert!(
        eventually(Duration::from_secs(2), || {
            client.connection().correlator_stats().late_responses == 1
        })
        .await
    );
    assert!(client.connection().is_connected());
}

#[tokio::test]
async fn unknown_ids_are_dropped_without_tearing_down() {
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, ClientConfig::default());
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    peer.respond_ok(999, json!("nobody asked")).await;
    peer.notify(42, &Notification::new("job.done", r1())).await;
    peer.send_raw(Frame::response(1000, b"not json".to_vec())).await;

    assert!(
        eventually(Duration::from_secs(2), || {
            client.connection().correlator_stats().unknown_responses == 2
                && client.connection().listener_stats().dropped_notifications == 1
        })
        .await
    );
    assert!(client.connection().is_connected());

    // still usable afterwards
    let waiter = client.clone();
    let call = tokio::spawn(async move { waiter.default_domain().await });
    let (id, op) = peer.next_request().await;
    assert_eq!(op, Operation::GetDefaultDomain);
    peer.respond_ok(id, json!("test")).await;
    assert_eq!(bounded(call).await.unwrap().unwrap(), "test");
    assert_eq!(ListenerId(42).to_string(), "listener-42");
}

#[tokio::test]
async fn remote_faults_are_not_connection_fatal() -> anyhow::Result<()> {
    let fixture = Fixture::start(AllowAll).await;
    let client = fixture.client();
    client.connect().await?;

    let err = client
        .invoke(&r1(), "missing", Vec::new(), Vec::new())
        .await
        .unwrap_err();
    match err {
        TransportError::Remote(fault) => {
            assert_eq!(fault.code, mxlink::protocol::FaultCode::InvalidArgument)
        }
        other => panic!("expected a remote fault, got {:?}", other),
    }
    assert!(!TransportError::Interrupted.is_retryable());
    assert_eq!(client.resource_count().await?, 1);

    client.close().await;
    fixture.server.stop().await;
    Ok(())
}
