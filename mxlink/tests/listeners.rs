//! Listener registration, removal and replay across reconnects.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use mxlink::protocol::{FaultCode, ListenerId, Notification, Operation, OperationKind};
use mxlink::server::dispatch::HandlerFuture;
use mxlink::{
    AllowAll, ClientConfig, ConnectionState, ConnectorServer, DispatchScope, DispatchTable,
    Handback, NotificationListener, ResubscribePolicy, ServerConfig, TransportError,
};
use serde_json::json;

type Seen = Arc<Mutex<Vec<String>>>;

fn collecting() -> (Seen, Arc<dyn NotificationListener>) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Arc<dyn NotificationListener> = Arc::new(move |n: &Notification, _h: &Handback| {
        sink.lock().unwrap().push(n.kind.clone());
    });
    (seen, listener)
}

#[tokio::test]
async fn removed_listener_stops_receiving() -> anyhow::Result<()> {
    let fixture = Fixture::start(AllowAll).await;
    let client = fixture.client();
    client.connect().await?;
    let hub = fixture.resources.hub().clone();

    let (seen, listener) = collecting();
    let registration = client
        .add_notification_listener(&r1(), None, listener, Handback::none())
        .await?;
    assert_eq!(hub.subscription_count(), 1);
    assert_eq!(client.connection().listener_stats().active, 1);

    let emitter = fixture.resources.emitter(r1());
    emitter.emit("job.one", "", None);
    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 1).await);

    client.remove_notification_listener(&registration).await?;
    assert_eq!(hub.subscription_count(), 0);
    assert_eq!(client.connection().listener_stats().active, 0);

    emitter.emit("job.two", "", None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["job.one"]);

    match client.remove_notification_listener(&registration).await {
        Err(TransportError::Remote(fault)) => assert_eq!(fault.code, FaultCode::NotFound),
        other => panic!("expected NotFound, got {:?}", other),
    }

    client.close().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn subscribing_to_a_missing_resource_fails_remotely() -> anyhow::Result<()> {
    let fixture = Fixture::start(AllowAll).await;
    let client = fixture.client();
    client.connect().await?;

    let (_seen, listener) = collecting();
    let missing = mxlink::protocol::ResourceName::parse("test:name=Missing")?;
    match client
        .add_notification_listener(&missing, None, listener, Handback::none())
        .await
    {
        Err(TransportError::Remote(fault)) => assert_eq!(fault.code, FaultCode::NotFound),
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert_eq!(client.connection().listener_stats().active, 0);

    client.close().await;
    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn closing_the_client_releases_server_subscriptions() -> anyhow::Result<()> {
    let fixture = Fixture::start(AllowAll).await;
    let client = fixture.client();
    client.connect().await?;
    let hub = fixture.resources.hub().clone();

    for _ in 0..3 {
        let (_seen, listener) = collecting();
        client
            .add_notification_listener(&r1(), None, listener, Handback::none())
            .await?;
    }
    assert_eq!(hub.subscription_count(), 3);

    client.close().await;
    assert!(eventually(Duration::from_secs(2), || hub.subscription_count() == 0).await);
    assert_eq!(fixture.resources.emitter(r1()).emit("job.after", "", None), 0);

    fixture.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn removal_after_failure_reports_a_closed_connection() {
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, ClientConfig::default());
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    let (_seen, listener) = collecting();
    let waiter = client.clone();
    let subscribe = tokio::spawn(async move {
        waiter
            .add_notification_listener(&r1(), None, listener, Handback::none())
            .await
    });
    let (id, _) = peer.next_request().await;
    peer.respond_ok(id, json!(5)).await;
    let registration = bounded(subscribe).await.unwrap().unwrap();
    assert_eq!(registration.listener_id(), ListenerId(5));

    drop(peer);
    assert!(
        eventually(Duration::from_secs(2), || client.state() == ConnectionState::Failed).await
    );

    let err = client
        .remove_notification_listener(&registration)
        .await
        .unwrap_err();
    assert!(err.is_connection_closed(), "{:?}", err);

    // a new incarnation does not revive the old registration
    let _peer = connect_scripted(&client, &mut peers, "mxlink://test 2").await;
    let err = client
        .remove_notification_listener(&registration)
        .await
        .unwrap_err();
    assert!(err.is_connection_closed(), "{:?}", err);
    assert_eq!(client.connection().listener_stats().active, 0);
}

#[tokio::test]
async fn replay_policy_resubscribes_after_reconnect() {
    let config = ClientConfig::default().resubscribe_policy(ResubscribePolicy::Replay);
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, config);
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    let (seen, listener) = collecting();
    let waiter = client.clone();
    let subscribe = tokio::spawn(async move {
        waiter
            .add_notification_listener(&r1(), None, listener, Handback::new(7u32))
            .await
    });
    let (id, _) = peer.next_request().await;
    peer.respond_ok(id, json!(5)).await;
    let first = bounded(subscribe).await.unwrap().unwrap();

    peer.notify(5, &Notification::new("job.before", r1())).await;
    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 1).await);

    drop(peer);
    assert!(
        eventually(Duration::from_secs(2), || client.state() == ConnectionState::Failed).await
    );

    let (restored, mut peer) = bounded(async {
        tokio::join!(client.reconnect(), async {
            let stream = peers.recv().await.unwrap();
            let mut peer = ScriptedPeer::accept(stream, "mxlink://test 2").await;
            let (id, op) = peer.next_request().await;
            assert_eq!(id, 1);
            assert_eq!(
                op,
                Operation::AddListener {
                    resource: r1(),
                    filter: None
                }
            );
            peer.respond_ok(id, json!(9)).await;
            peer
        })
    })
    .await;
    let restored = restored.unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].listener_id(), ListenerId(9));
    assert_eq!(restored[0].incarnation(), 2);
    assert_ne!(restored[0].incarnation(), first.incarnation());

    peer.notify(5, &Notification::new("job.stale", r1())).await;
    peer.notify(9, &Notification::new("job.after", r1())).await;
    assert!(eventually(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await);
    assert_eq!(*seen.lock().unwrap(), vec!["job.before", "job.after"]);
    assert_eq!(client.connection().listener_stats().dropped_notifications, 1);
}

#[tokio::test]
async fn without_replay_nothing_is_resubscribed() {
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, ClientConfig::default());
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    let (_seen, listener) = collecting();
    let waiter = client.clone();
    let subscribe = tokio::spawn(async move {
        waiter
            .add_notification_listener(&r1(), None, listener, Handback::none())
            .await
    });
    let (id, _) = peer.next_request().await;
    peer.respond_ok(id, json!(1)).await;
    bounded(subscribe).await.unwrap().unwrap();
    drop(peer);
    assert!(
        eventually(Duration::from_secs(2), || client.state() == ConnectionState::Failed).await
    );

    let (restored, _peer) = bounded(async {
        tokio::join!(client.reconnect(), async {
            let stream = peers.recv().await.unwrap();
            ScriptedPeer::accept(stream, "mxlink://test 2").await
        })
    })
    .await;
    assert!(restored.unwrap().is_empty());
    assert_eq!(client.connection().correlator_stats().in_flight, 0);
}

#[tokio::test]
async fn timed_out_subscribe_releases_the_late_listener() {
    let config = ClientConfig::default().request_timeout(Duration::from_millis(100));
    let (client, _dialer, mut peers) = scripted_client(Duration::ZERO, config);
    let mut peer = connect_scripted(&client, &mut peers, "mxlink://test 1").await;

    let (seen, listener) = collecting();
    let waiter = client.clone();
    let subscribe = tokio::spawn(async move {
        waiter
            .add_notification_listener(&r1(), None, listener, Handback::none())
            .await
    });
    let (add_id, op) = peer.next_request().await;
    assert!(matches!(op, Operation::AddListener { .. }));
    let err = bounded(subscribe).await.unwrap().unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }), "{:?}", err);

    // the server registers the listener after the caller gave up
    peer.respond_ok(add_id, json!(11)).await;
    let (remove_id, op) = bounded(peer.next_request()).await;
    assert_eq!(
        op,
        Operation::RemoveListener {
            resource: r1(),
            listener_id: ListenerId(11)
        }
    );
    peer.respond_ok(remove_id, serde_json::Value::Null).await;

    peer.notify(11, &Notification::new("job.orphan", r1())).await;
    assert!(
        eventually(Duration::from_secs(2), || {
            client.connection().correlator_stats().in_flight == 0
                && client.connection().listener_stats().dropped_notifications == 1
        })
        .await
    );
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(client.connection().listener_stats().active, 0);
    assert_eq!(client.connection().correlator_stats().late_responses, 0);
    assert!(client.connection().is_connected());
}

fn slow_add_listener<'a>(scope: &'a DispatchScope, operation: Operation) -> HandlerFuture<'a> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        match DispatchTable::standard().get(OperationKind::AddListener) {
            Some(standard) => standard(scope, operation).await,
            None => Err(mxlink::protocol::RemoteFault::operation_failed("no handler")),
        }
    })
}

#[tokio::test]
async fn timed_out_subscribe_leaves_no_server_subscription() -> anyhow::Result<()> {
    let mut table = DispatchTable::standard();
    table.insert(OperationKind::AddListener, slow_add_listener);
    let builder = ConnectorServer::builder(ServerConfig::default())
        .with_authorization(AllowAll)
        .with_dispatch_table(table);
    let fixture = Fixture::start_with(builder).await;
    let client =
        fixture.client_with(ClientConfig::default().request_timeout(Duration::from_millis(50)));
    client.connect().await?;
    let hub = fixture.resources.hub().clone();

    let (seen, listener) = collecting();
    let err = client
        .add_notification_listener(&r1(), None, listener, Handback::none())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }), "{:?}", err);

    // past the point where the server has registered the listener
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        eventually(Duration::from_secs(2), || {
            hub.subscription_count() == 0
                && client.connection().correlator_stats().in_flight == 0
        })
        .await
    );
    assert_eq!(fixture.resources.emitter(r1()).emit("job.orphan", "", None), 0);
    assert!(seen.lock().unwrap().is_empty());
    assert!(client.connection().is_connected());

    client.close().await;
    fixture.server.stop().await;
    Ok(())
}
