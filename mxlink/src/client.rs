//! Remote management client
//!
//! [`RemoteClient`] is the typed face of a client [`Connection`]: one method
//! per operation kind, plus notification listener management.

use std::sync::Arc;
use std::time::Duration;

use mxlink_protocol::{
    Attribute, JsonCodec, ListenerId, NotificationFilter, Operation, PayloadCodec, RemoteFault,
    ResourceInfo, ResourceName, ResourcePattern,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::correlator::PendingRequest;
use crate::error::{TransportError, TransportResult};
use crate::interceptor::{ConnectionInterceptor, Dialer, NoInterceptor, TcpDialer};
use crate::lifecycle::{ConnectionObserver, ObserverId};
use crate::listeners::{DurableSubscription, Handback, ListenerRegistration, NotificationListener};
use crate::state::ConnectionState;

/// Client for one remote resource server
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone, Debug)]
pub struct RemoteClient {
    connection: Connection,
    request_timeout: Duration,
}

impl RemoteClient {
    /// Client for a TCP address. Does not connect.
    pub fn tcp(address: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_dialer(Arc::new(TcpDialer::new(address)), config)
    }

    /// Client over a custom dialer with the pass-through interceptor and
    /// the JSON codec
    pub fn with_dialer(dialer: Arc<dyn Dialer>, config: ClientConfig) -> Self {
        Self::with_parts(dialer, Arc::new(NoInterceptor), Arc::new(JsonCodec), config)
    }

    /// Client with every pluggable part supplied
    pub fn with_parts(
        dialer: Arc<dyn Dialer>,
        interceptor: Arc<dyn ConnectionInterceptor>,
        codec: Arc<dyn PayloadCodec>,
        config: ClientConfig,
    ) -> Self {
        let request_timeout = config.request_timeout;
        Self {
            connection: Connection::client(dialer, interceptor, codec, config),
            request_timeout,
        }
    }

    /// The underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection.connection_id()
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverId {
        self.connection.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.connection.remove_observer(id)
    }

    // ════════════════════════════════════════════════════════════════
    // Connection control
    // ════════════════════════════════════════════════════════════════

    /// Connects (or reconnects after a failure)
    ///
    /// Under [`ResubscribePolicy::Replay`](crate::ResubscribePolicy::Replay)
    /// remembered subscriptions are re-issued; use
    /// [`reconnect`](Self::reconnect) to get their new registrations.
    pub async fn connect(&self) -> TransportResult<()> {
        self.reconnect().await.map(|_| ())
    }

    /// Connects and returns the registrations re-issued for remembered
    /// subscriptions. Empty unless the policy is `Replay`.
    pub async fn reconnect(&self) -> TransportResult<Vec<ListenerRegistration>> {
        self.connection.connect().await?;

        let mut pending = self.connection.listeners().take_durable().into_iter();
        let mut restored = Vec::new();
        while let Some(subscription) = pending.next() {
            match self.subscribe(subscription.clone()).await {
                Ok(registration) => restored.push(registration),
                Err(e) if e.is_connection_closed() => {
                    // keep the rest for the next reconnect
                    self.connection
                        .listeners()
                        .remember(std::iter::once(subscription).chain(pending));
                    return Err(e);
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Dropping subscription to {} after failed replay: {}",
                        subscription.resource,
                        _e
                    );
                }
            }
        }

        #[cfg(feature = "tracing")]
        if !restored.is_empty() {
            tracing::info!("Replayed {} subscriptions", restored.len());
        }
        Ok(restored)
    }

    /// Closes the connection. Idempotent.
    pub async fn close(&self) {
        self.connection.close().await
    }

    // ════════════════════════════════════════════════════════════════
    // Requests
    // ════════════════════════════════════════════════════════════════

    /// Raw request with an explicit timeout and cancellation token
    pub async fn request_with(
        &self,
        operation: &Operation,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> TransportResult<Value> {
        self.connection
            .request_with(operation, Some(timeout.unwrap_or(self.request_timeout)), cancel)
            .await
    }

    async fn call<T: DeserializeOwned>(&self, operation: Operation) -> TransportResult<T> {
        let value = self.connection.request(&operation).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Reads one attribute
    pub async fn get_attribute(
        &self,
        resource: &ResourceName,
        attribute: &str,
    ) -> TransportResult<Value> {
        self.call(Operation::GetAttribute {
            resource: resource.clone(),
            attribute: attribute.to_string(),
        })
        .await
    }

    /// Reads several attributes; unreadable ones are omitted from the result
    pub async fn get_attributes(
        &self,
        resource: &ResourceName,
        attributes: &[&str],
    ) -> TransportResult<Vec<Attribute>> {
        self.call(Operation::GetAttributes {
            resource: resource.clone(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        })
        .await
    }

    /// Writes one attribute
    pub async fn set_attribute(
        &self,
        resource: &ResourceName,
        attribute: Attribute,
    ) -> TransportResult<()> {
        self.call::<Value>(Operation::SetAttribute {
            resource: resource.clone(),
            attribute,
        })
        .await
        .map(|_| ())
    }

    /// Writes several attributes; returns the ones that were set
    pub async fn set_attributes(
        &self,
        resource: &ResourceName,
        attributes: Vec<Attribute>,
    ) -> TransportResult<Vec<Attribute>> {
        self.call(Operation::SetAttributes {
            resource: resource.clone(),
            attributes,
        })
        .await
    }

    /// Invokes an operation on a resource
    pub async fn invoke(
        &self,
        resource: &ResourceName,
        operation: &str,
        params: Vec<Value>,
        signature: Vec<String>,
    ) -> TransportResult<Value> {
        self.call(Operation::Invoke {
            resource: resource.clone(),
            operation: operation.to_string(),
            params,
            signature,
        })
        .await
    }

    /// Asks the server to instantiate and register a resource
    pub async fn create_resource(
        &self,
        class_name: &str,
        resource: &ResourceName,
        params: Vec<Value>,
    ) -> TransportResult<ResourceName> {
        self.call(Operation::CreateResource {
            class_name: class_name.to_string(),
            resource: resource.clone(),
            params,
        })
        .await
    }

    /// Unregisters a resource on the server
    pub async fn destroy_resource(&self, resource: &ResourceName) -> TransportResult<()> {
        self.call::<Value>(Operation::DestroyResource {
            resource: resource.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Names matching `pattern` (all names when `None`)
    pub async fn query_names(
        &self,
        pattern: Option<ResourcePattern>,
    ) -> TransportResult<Vec<ResourceName>> {
        self.call(Operation::QueryNames { pattern }).await
    }

    pub async fn is_registered(&self, resource: &ResourceName) -> TransportResult<bool> {
        self.call(Operation::IsRegistered {
            resource: resource.clone(),
        })
        .await
    }

    pub async fn resource_count(&self) -> TransportResult<u64> {
        self.call(Operation::GetResourceCount).await
    }

    pub async fn resource_info(&self, resource: &ResourceName) -> TransportResult<ResourceInfo> {
        self.call(Operation::GetResourceInfo {
            resource: resource.clone(),
        })
        .await
    }

    pub async fn domains(&self) -> TransportResult<Vec<String>> {
        self.call(Operation::GetDomains).await
    }

    pub async fn default_domain(&self) -> TransportResult<String> {
        self.call(Operation::GetDefaultDomain).await
    }

    pub async fn is_instance_of(
        &self,
        resource: &ResourceName,
        class_name: &str,
    ) -> TransportResult<bool> {
        self.call(Operation::IsInstanceOf {
            resource: resource.clone(),
            class_name: class_name.to_string(),
        })
        .await
    }

    // ════════════════════════════════════════════════════════════════
    // Notification listeners
    // ════════════════════════════════════════════════════════════════

    /// Subscribes `listener` to notifications from `resource`
    ///
    /// The filter runs on the server. `handback` is kept locally and handed
    /// back unchanged with every delivery; it never crosses the wire. The
    /// registration is valid until it is removed or the connection leaves
    /// CONNECTED.
    pub async fn add_notification_listener(
        &self,
        resource: &ResourceName,
        filter: Option<NotificationFilter>,
        listener: Arc<dyn NotificationListener>,
        handback: Handback,
    ) -> TransportResult<ListenerRegistration> {
        self.subscribe(DurableSubscription {
            resource: resource.clone(),
            filter,
            listener,
            handback,
        })
        .await
    }

    async fn subscribe(
        &self,
        subscription: DurableSubscription,
    ) -> TransportResult<ListenerRegistration> {
        let operation = Operation::AddListener {
            resource: subscription.resource.clone(),
            filter: subscription.filter.clone(),
        };
        let pending = self.connection.submit(&operation).await?;
        let incarnation = pending.incarnation();
        let value = match self
            .connection
            .await_or_keep(pending, Some(self.request_timeout), None)
            .await
        {
            Ok(outcome) => outcome?,
            Err((interruption, pending)) => {
                self.release_abandoned(subscription.resource, pending);
                return Err(interruption);
            }
        };
        let listener_id: ListenerId = serde_json::from_value(value)?;

        let registration = self
            .connection
            .listeners()
            .insert(incarnation, listener_id, subscription)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Registered {} on {}",
            registration.listener_id(),
            registration.resource()
        );
        Ok(registration)
    }

    /// Waits in the background for an AddListener nobody waits for any
    /// more, and removes the server-side listener it created.
    fn release_abandoned(&self, resource: ResourceName, pending: PendingRequest) {
        let connection = self.connection.clone();
        let timeout = self.request_timeout;
        let incarnation = pending.incarnation();
        tokio::spawn(async move {
            // resolved by the response or by teardown, whichever comes first
            let Ok(value) = connection.await_response(pending, None, None).await else {
                return;
            };
            let Ok(listener_id) = serde_json::from_value::<ListenerId>(value) else {
                return;
            };
            if connection.incarnation() != incarnation {
                return;
            }
            let _outcome = connection
                .request_with(
                    &Operation::RemoveListener {
                        resource,
                        listener_id,
                    },
                    Some(timeout),
                    None,
                )
                .await;
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Released abandoned {} ({})",
                listener_id,
                if _outcome.is_ok() { "removed" } else { "not removed" }
            );
        });
    }

    /// Removes a registration on the server and locally
    ///
    /// Fails with `ConnectionClosed` if the registration's connection
    /// incarnation is gone, and with a `NotFound` remote fault if it was
    /// already removed.
    pub async fn remove_notification_listener(
        &self,
        registration: &ListenerRegistration,
    ) -> TransportResult<()> {
        if !self.connection.is_connected()
            || registration.incarnation() != self.connection.incarnation()
        {
            return Err(TransportError::closed(
                "registration belongs to a connection that is no longer open",
            ));
        }
        if !self.connection.listeners().contains(registration) {
            return Err(RemoteFault::not_found(registration.listener_id()).into());
        }

        self.connection
            .request(&Operation::RemoveListener {
                resource: registration.resource().clone(),
                listener_id: registration.listener_id(),
            })
            .await?;
        self.connection.listeners().remove(registration);
        Ok(())
    }
}
