//! Server-side authorization runs before any dispatch.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};

use common::*;
use mxlink::protocol::{Attribute, ListenerId, Operation, OperationKind};
use mxlink::server::dispatch::HandlerFuture;
use mxlink::{
    AccessControlList, AccessLevel, AllowAll, AuthorizationChecker, ClientConfig,
    ConnectorServer, DenyAll, DispatchScope, DispatchTable, ServerConfig, StaticCredentials,
    TransportError,
};
use serde_json::{json, Value};

static DISPATCHED: AtomicU64 = AtomicU64::new(0);

fn spy<'a>(_scope: &'a DispatchScope, _operation: Operation) -> HandlerFuture<'a> {
    Box::pin(async {
        DISPATCHED.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    })
}

fn spy_table() -> DispatchTable {
    let mut table = DispatchTable::empty();
    for kind in OperationKind::ALL {
        table.insert(kind, spy);
    }
    table
}

fn one_of_each() -> Vec<Operation> {
    let r = r1();
    vec![
        Operation::GetAttribute {
            resource: r.clone(),
            attribute: "Count".into(),
        },
        Operation::GetAttributes {
            resource: r.clone(),
            attributes: vec!["Count".into()],
        },
        Operation::SetAttribute {
            resource: r.clone(),
            attribute: Attribute::new("Count", json!(1)),
        },
        Operation::SetAttributes {
            resource: r.clone(),
            attributes: vec![Attribute::new("Count", json!(2))],
        },
        Operation::Invoke {
            resource: r.clone(),
            operation: "op".into(),
            params: vec![],
            signature: vec![],
        },
        Operation::CreateResource {
            class_name: "Counter".into(),
            resource: r.clone(),
            params: vec![],
        },
        Operation::DestroyResource {
            resource: r.clone(),
        },
        Operation::AddListener {
            resource: r.clone(),
            filter: None,
        },
        Operation::RemoveListener {
            resource: r.clone(),
            listener_id: ListenerId(1),
        },
        Operation::QueryNames { pattern: None },
        Operation::IsRegistered {
            resource: r.clone(),
        },
        Operation::GetResourceCount,
        Operation::GetResourceInfo {
            resource: r.clone(),
        },
        Operation::GetDomains,
        Operation::GetDefaultDomain,
        Operation::IsInstanceOf {
            resource: r,
            class_name: "Counter".into(),
        },
    ]
}

async fn run_all(checker: impl AuthorizationChecker) -> Vec<Result<Value, TransportError>> {
    let builder = ConnectorServer::builder(ServerConfig::default())
        .with_authorization(checker)
        .with_dispatch_table(spy_table());
    let fixture = Fixture::start_with(builder).await;
    let client = fixture.client();
    client.connect().await.unwrap();

    let mut results = Vec::new();
    for operation in one_of_each() {
        results.push(client.request_with(&operation, None, None).await);
    }
    assert!(client.connection().is_connected());

    client.close().await;
    fixture.server.stop().await;
    results
}

// Both policies share the spy counter, so they run in one test.
#[tokio::test]
async fn checker_gates_every_operation_kind() {
    let kinds: Vec<_> = one_of_each().iter().map(Operation::kind).collect();
    assert_eq!(kinds, OperationKind::ALL.to_vec());

    DISPATCHED.store(0, Ordering::SeqCst);
    for (operation, result) in one_of_each().iter().zip(run_all(DenyAll).await) {
        match result {
            Err(TransportError::PermissionDenied { reason }) => {
                assert!(reason.contains(operation.kind().name()), "{}", reason)
            }
            other => panic!("{} was not denied: {:?}", operation.kind(), other),
        }
    }
    assert_eq!(DISPATCHED.load(Ordering::SeqCst), 0);

    for result in run_all(AllowAll).await {
        assert_eq!(result.unwrap(), Value::Null);
    }
    assert_eq!(DISPATCHED.load(Ordering::SeqCst), 16);
}

#[tokio::test]
async fn access_control_list_separates_readers_from_writers() {
    let builder = ConnectorServer::builder(ServerConfig::default())
        .with_authenticator(
            StaticCredentials::new()
                .user("reader", "r")
                .user("admin", "a"),
        )
        .with_authorization(
            AccessControlList::new()
                .grant("reader", AccessLevel::ReadOnly)
                .grant("admin", AccessLevel::ReadWrite),
        );
    let fixture = Fixture::start_with(builder).await;

    let reader = fixture.client_with(ClientConfig::default().credentials("reader", "r"));
    reader.connect().await.unwrap();
    assert_eq!(reader.resource_count().await.unwrap(), 1);
    assert_eq!(reader.get_attribute(&r1(), "Count").await.unwrap(), Value::Null);
    let err = reader
        .set_attribute(&r1(), Attribute::new("Count", json!(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::PermissionDenied { .. }), "{:?}", err);
    assert_eq!(fixture.counter.writes.load(Ordering::SeqCst), 0);

    let admin = fixture.client_with(ClientConfig::default().credentials("admin", "a"));
    admin.connect().await.unwrap();
    admin
        .set_attribute(&r1(), Attribute::new("Count", json!(5)))
        .await
        .unwrap();
    assert_eq!(reader.get_attribute(&r1(), "Count").await.unwrap(), json!(5));
    assert_eq!(
        admin
            .invoke(&r1(), "op", vec![json!("x")], vec!["string".into()])
            .await
            .unwrap(),
        json!({ "echo": ["x"] })
    );

    reader.close().await;
    admin.close().await;
    fixture.server.stop().await;
}
