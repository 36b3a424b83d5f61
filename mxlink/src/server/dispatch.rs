//! Operation dispatch.
//!
//! Every [`OperationKind`] maps to a plain handler function in a
//! [`DispatchTable`]. Adding an operation kind means adding one table entry;
//! overriding one means [`DispatchTable::insert`]. Requests are authorized
//! before the table is consulted, so a handler never runs for a denied
//! request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use mxlink_protocol::{
    Attribute, FaultCode, ListenerId, Operation, OperationKind, RemoteFault, ResponseBody,
};
use serde::Serialize;
use serde_json::Value;

use super::hub::NotificationHub;
use super::resources::{into_fault, ResourceRegistry};
use crate::auth::{authorize, AuthorizationChecker};
use crate::connection::{Connection, RequestHandler};

/// Future returned by a handler.
pub type HandlerFuture<'a> = BoxFuture<'a, Result<Value, RemoteFault>>;

/// Handler for one operation kind.
pub type Handler = for<'a> fn(&'a DispatchScope, Operation) -> HandlerFuture<'a>;

/// Per-connection state visible to handlers.
pub struct DispatchScope {
    resources: ResourceRegistry,
    connection_id: String,
    next_listener: AtomicU64,
}

impl DispatchScope {
    pub fn new(resources: ResourceRegistry, connection_id: impl Into<String>) -> Self {
        Self {
            resources,
            connection_id: connection_id.into(),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn hub(&self) -> &NotificationHub {
        self.resources.hub()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Listener IDs are never reused while the connection is alive.
    pub fn allocate_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }
}

// ════════════════════════════════════════════════════════════════════
// DispatchTable
// ════════════════════════════════════════════════════════════════════

/// `OperationKind -> handler` map.
#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<OperationKind, Handler>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DispatchTable {
    /// Table with no handlers; every request is answered `UNSUPPORTED`.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Table with the standard handler for every operation kind.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.insert(OperationKind::GetAttribute, get_attribute);
        table.insert(OperationKind::GetAttributes, get_attributes);
        table.insert(OperationKind::SetAttribute, set_attribute);
        table.insert(OperationKind::SetAttributes, set_attributes);
        table.insert(OperationKind::Invoke, invoke);
        table.insert(OperationKind::CreateResource, create_resource);
        table.insert(OperationKind::DestroyResource, destroy_resource);
        table.insert(OperationKind::AddListener, add_listener);
        table.insert(OperationKind::RemoveListener, remove_listener);
        table.insert(OperationKind::QueryNames, query_names);
        table.insert(OperationKind::IsRegistered, is_registered);
        table.insert(OperationKind::GetResourceCount, resource_count);
        table.insert(OperationKind::GetResourceInfo, resource_info);
        table.insert(OperationKind::GetDomains, domains);
        table.insert(OperationKind::GetDefaultDomain, default_domain);
        table.insert(OperationKind::IsInstanceOf, is_instance_of);
        table
    }

    /// Installs `handler` for `kind`, returning the one it replaces.
    pub fn insert(&mut self, kind: OperationKind, handler: Handler) -> Option<Handler> {
        self.handlers.insert(kind, handler)
    }

    /// Handler installed for `kind`, for wrapping it in another one.
    pub fn get(&self, kind: OperationKind) -> Option<Handler> {
        self.handlers.get(&kind).copied()
    }

    /// Removes the handler for `kind`.
    pub fn remove(&mut self, kind: OperationKind) -> Option<Handler> {
        self.handlers.remove(&kind)
    }

    /// Kinds with a handler, in wire-code order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .iter()
            .copied()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    /// Runs the handler for `operation`.
    pub async fn dispatch(
        &self,
        scope: &DispatchScope,
        operation: Operation,
    ) -> Result<Value, RemoteFault> {
        let kind = operation.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler(scope, operation).await,
            None => Err(RemoteFault::new(
                FaultCode::Unsupported,
                format!("{} is not supported by this server", kind),
            )),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// ServerSession
// ════════════════════════════════════════════════════════════════════

/// Request handler of one accepted connection: authorize, then dispatch.
pub(crate) struct ServerSession {
    scope: DispatchScope,
    table: Arc<DispatchTable>,
    checker: Arc<dyn AuthorizationChecker>,
}

impl ServerSession {
    pub(crate) fn new(
        scope: DispatchScope,
        table: Arc<DispatchTable>,
        checker: Arc<dyn AuthorizationChecker>,
    ) -> Self {
        Self {
            scope,
            table,
            checker,
        }
    }
}

#[async_trait]
impl RequestHandler for ServerSession {
    async fn handle(&self, connection: &Connection, operation: Operation) -> ResponseBody {
        let ctx = connection.authorization();
        if let Err(denied) = authorize(&*self.checker, &ctx, &operation) {
            #[cfg(feature = "tracing")]
            tracing::warn!("'{}': {}", ctx.connection_id, denied);
            return ResponseBody::fault(denied.into());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("'{}': dispatching {}", ctx.connection_id, operation.kind());

        ResponseBody::from(self.table.dispatch(&self.scope, operation).await)
    }
}

// ════════════════════════════════════════════════════════════════════
// Standard handlers
// ════════════════════════════════════════════════════════════════════

fn mismatch(expected: OperationKind) -> RemoteFault {
    RemoteFault::new(
        FaultCode::Internal,
        format!("handler for {} received another operation", expected),
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, RemoteFault> {
    serde_json::to_value(value).map_err(|e| RemoteFault::new(FaultCode::Internal, e.to_string()))
}

fn get_attribute(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::GetAttribute {
            resource,
            attribute,
        } = operation
        else {
            return Err(mismatch(OperationKind::GetAttribute));
        };
        let target = scope.resources.get(&resource)?;
        target.get_attribute(&attribute).await.map_err(into_fault)
    })
}

/// Unreadable attributes are left out of the result.
fn get_attributes(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::GetAttributes {
            resource,
            attributes,
        } = operation
        else {
            return Err(mismatch(OperationKind::GetAttributes));
        };
        let target = scope.resources.get(&resource)?;
        let mut values = Vec::with_capacity(attributes.len());
        for name in attributes {
            if let Ok(value) = target.get_attribute(&name).await {
                values.push(Attribute { name, value });
            }
        }
        to_json(&values)
    })
}

fn set_attribute(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::SetAttribute {
            resource,
            attribute,
        } = operation
        else {
            return Err(mismatch(OperationKind::SetAttribute));
        };
        let target = scope.resources.get(&resource)?;
        target.set_attribute(&attribute).await.map_err(into_fault)?;
        Ok(Value::Null)
    })
}

/// Returns the attributes that were actually set.
fn set_attributes(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::SetAttributes {
            resource,
            attributes,
        } = operation
        else {
            return Err(mismatch(OperationKind::SetAttributes));
        };
        let target = scope.resources.get(&resource)?;
        let mut applied = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            if target.set_attribute(&attribute).await.is_ok() {
                applied.push(attribute);
            }
        }
        to_json(&applied)
    })
}

fn invoke(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::Invoke {
            resource,
            operation,
            params,
            signature,
        } = operation
        else {
            return Err(mismatch(OperationKind::Invoke));
        };
        let target = scope.resources.get(&resource)?;
        target
            .invoke(&operation, &params, &signature)
            .await
            .map_err(into_fault)
    })
}

fn create_resource(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::CreateResource {
            class_name,
            resource,
            params,
        } = operation
        else {
            return Err(mismatch(OperationKind::CreateResource));
        };
        let created = scope.resources.create(&class_name, &resource, &params)?;
        to_json(&created)
    })
}

fn destroy_resource(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::DestroyResource { resource } = operation else {
            return Err(mismatch(OperationKind::DestroyResource));
        };
        scope.resources.unregister(&resource)?;
        Ok(Value::Null)
    })
}

fn add_listener(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::AddListener { resource, filter } = operation else {
            return Err(mismatch(OperationKind::AddListener));
        };
        if !scope.resources.is_registered(&resource) {
            return Err(RemoteFault::not_found(&resource));
        }
        let listener_id = scope.allocate_listener_id();
        scope
            .hub()
            .subscribe(&scope.connection_id, &resource, listener_id, filter);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "'{}': {} subscribed to {}",
            scope.connection_id,
            listener_id,
            resource
        );
        to_json(&listener_id)
    })
}

fn remove_listener(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::RemoveListener {
            resource,
            listener_id,
        } = operation
        else {
            return Err(mismatch(OperationKind::RemoveListener));
        };
        if !scope
            .hub()
            .unsubscribe(&scope.connection_id, &resource, listener_id)
        {
            return Err(RemoteFault::not_found(format!("{} on {}", listener_id, resource)));
        }
        Ok(Value::Null)
    })
}

fn query_names(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::QueryNames { pattern } = operation else {
            return Err(mismatch(OperationKind::QueryNames));
        };
        to_json(&scope.resources.query_names(pattern.as_ref()))
    })
}

fn is_registered(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::IsRegistered { resource } = operation else {
            return Err(mismatch(OperationKind::IsRegistered));
        };
        Ok(Value::Bool(scope.resources.is_registered(&resource)))
    })
}

fn resource_count(scope: &DispatchScope, _operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move { Ok(Value::from(scope.resources.count() as u64)) })
}

fn resource_info(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::GetResourceInfo { resource } = operation else {
            return Err(mismatch(OperationKind::GetResourceInfo));
        };
        to_json(&scope.resources.get(&resource)?.info())
    })
}

fn domains(scope: &DispatchScope, _operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move { to_json(&scope.resources.domains()) })
}

fn default_domain(scope: &DispatchScope, _operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move { Ok(Value::from(scope.resources.default_domain())) })
}

fn is_instance_of(scope: &DispatchScope, operation: Operation) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Operation::IsInstanceOf {
            resource,
            class_name,
        } = operation
        else {
            return Err(mismatch(OperationKind::IsInstanceOf));
        };
        Ok(Value::Bool(
            scope.resources.get(&resource)?.is_instance_of(&class_name),
        ))
    })
}
