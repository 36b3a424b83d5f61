//! Server-side registry of manageable resources.
//!
//! A [`ManagedResource`] is an administrative object exposing attributes,
//! operations and notifications. The [`ResourceRegistry`] names them, answers
//! the query operations, instantiates resources for `CreateResource` through
//! registered factories, and stamps emitted notifications before handing them
//! to the [`NotificationHub`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mxlink_protocol::{
    Attribute, FaultCode, Notification, RemoteFault, ResourceInfo, ResourceName, ResourcePattern,
};
use serde_json::Value;

use super::hub::NotificationHub;

/// Default domain reported when none is configured.
pub const DEFAULT_DOMAIN: &str = "mxlink";

/// An administrative object reachable over the transport.
///
/// Methods return `anyhow::Result`; an error that is (or wraps) a
/// [`RemoteFault`] is sent back with its code, anything else becomes an
/// `OPERATION_FAILED` fault.
#[async_trait]
pub trait ManagedResource: Send + Sync + 'static {
    /// Static description: class, attributes, operations, notifications.
    fn info(&self) -> ResourceInfo;

    async fn get_attribute(&self, name: &str) -> anyhow::Result<Value> {
        Err(RemoteFault::not_found(format!("attribute '{}'", name)).into())
    }

    async fn set_attribute(&self, attribute: &Attribute) -> anyhow::Result<()> {
        Err(RemoteFault::new(
            FaultCode::Unsupported,
            format!("attribute '{}' is not writable", attribute.name),
        )
        .into())
    }

    async fn invoke(
        &self,
        operation: &str,
        _params: &[Value],
        _signature: &[String],
    ) -> anyhow::Result<Value> {
        Err(RemoteFault::new(
            FaultCode::Unsupported,
            format!("operation '{}' is not supported", operation),
        )
        .into())
    }

    fn is_instance_of(&self, class_name: &str) -> bool {
        self.info().class_name == class_name
    }
}

/// Builds a resource for `CreateResource`.
pub type ResourceFactory =
    Arc<dyn Fn(&ResourceName, &[Value]) -> anyhow::Result<Arc<dyn ManagedResource>> + Send + Sync>;

/// Converts a resource error into the fault sent to the client.
pub(crate) fn into_fault(error: anyhow::Error) -> RemoteFault {
    match error.downcast::<RemoteFault>() {
        Ok(fault) => fault,
        Err(other) => RemoteFault::operation_failed(format!("{:#}", other)),
    }
}

struct Inner {
    default_domain: String,
    resources: DashMap<ResourceName, Arc<dyn ManagedResource>>,
    factories: DashMap<String, ResourceFactory>,
    sequences: DashMap<ResourceName, u64>,
    hub: NotificationHub,
}

/// Named resources of one server.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<Inner>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("default_domain", &self.inner.default_domain)
            .field("resources", &self.inner.resources.len())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(default_domain: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_domain: default_domain.into(),
                resources: DashMap::new(),
                factories: DashMap::new(),
                sequences: DashMap::new(),
                hub: NotificationHub::new(),
            }),
        }
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.inner.hub
    }

    // ────────────────────────────────────────────────────────────────
    // Registration
    // ────────────────────────────────────────────────────────────────

    pub fn register(
        &self,
        name: ResourceName,
        resource: Arc<dyn ManagedResource>,
    ) -> Result<(), RemoteFault> {
        match self.inner.resources.entry(name) {
            Entry::Occupied(e) => Err(RemoteFault::new(
                FaultCode::AlreadyExists,
                format!("{} is already registered", e.key()),
            )),
            Entry::Vacant(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Registered resource {}", e.key());
                self.inner.sequences.insert(e.key().clone(), 0);
                e.insert(resource);
                Ok(())
            }
        }
    }

    /// Unregisters a resource and drops every subscription to it.
    pub fn unregister(&self, name: &ResourceName) -> Result<Arc<dyn ManagedResource>, RemoteFault> {
        let (_, resource) = self
            .inner
            .resources
            .remove(name)
            .ok_or_else(|| RemoteFault::not_found(name))?;
        self.inner.sequences.remove(name);
        let _dropped = self.inner.hub.remove_resource(name);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Unregistered resource {} ({} subscriptions dropped)",
            name,
            _dropped
        );
        Ok(resource)
    }

    pub fn get(&self, name: &ResourceName) -> Result<Arc<dyn ManagedResource>, RemoteFault> {
        self.inner
            .resources
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| RemoteFault::not_found(name))
    }

    pub fn is_registered(&self, name: &ResourceName) -> bool {
        self.inner.resources.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.resources.len()
    }

    /// Sources with a notification sequence; one per registered resource.
    pub fn sequence_count(&self) -> usize {
        self.inner.sequences.len()
    }

    // ────────────────────────────────────────────────────────────────
    // Queries
    // ────────────────────────────────────────────────────────────────

    /// Sorted names matching `pattern` (every name when `None`).
    pub fn query_names(&self, pattern: Option<&ResourcePattern>) -> Vec<ResourceName> {
        let mut names: Vec<ResourceName> = self
            .inner
            .resources
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| pattern.map(|p| p.matches(name)).unwrap_or(true))
            .collect();
        names.sort();
        names
    }

    /// Sorted, distinct domains of registered resources.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .inner
            .resources
            .iter()
            .map(|e| e.key().domain().to_string())
            .collect();
        domains.sort();
        domains.dedup();
        domains
    }

    pub fn default_domain(&self) -> &str {
        &self.inner.default_domain
    }

    // ────────────────────────────────────────────────────────────────
    // Factories
    // ────────────────────────────────────────────────────────────────

    /// Registers the factory used by `CreateResource` for `class_name`.
    pub fn register_factory<F>(&self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&ResourceName, &[Value]) -> anyhow::Result<Arc<dyn ManagedResource>>
            + Send
            + Sync
            + 'static,
    {
        self.inner
            .factories
            .insert(class_name.into(), Arc::new(factory));
    }

    /// Instantiates `class_name` and registers it under `name`.
    pub fn create(
        &self,
        class_name: &str,
        name: &ResourceName,
        params: &[Value],
    ) -> Result<ResourceName, RemoteFault> {
        let factory = self
            .inner
            .factories
            .get(class_name)
            .map(|f| f.value().clone())
            .ok_or_else(|| RemoteFault::not_found(format!("resource class '{}'", class_name)))?;
        if self.is_registered(name) {
            return Err(RemoteFault::new(
                FaultCode::AlreadyExists,
                format!("{} is already registered", name),
            ));
        }
        let resource = factory(name, params).map_err(into_fault)?;
        self.register(name.clone(), resource)?;
        Ok(name.clone())
    }

    // ────────────────────────────────────────────────────────────────
    // Notifications
    // ────────────────────────────────────────────────────────────────

    /// Stamps `notification` with the next per-source sequence number and
    /// the current time, then fans it out. Returns the number of deliveries
    /// queued; a source that is not registered emits nothing.
    pub fn emit(&self, mut notification: Notification) -> usize {
        // the sequence guard is held through publish so emissions from one
        // source reach every outbox in sequence order
        let Some(mut sequence) = self.inner.sequences.get_mut(&notification.source) else {
            #[cfg(feature = "tracing")]
            tracing::debug!("Dropped notification from unregistered {}", notification.source);
            return 0;
        };
        *sequence += 1;
        notification.sequence = *sequence;
        notification.timestamp = Utc::now().timestamp_millis();
        self.inner.hub.publish(&notification)
    }

    /// Emission handle bound to one source name.
    pub fn emitter(&self, source: ResourceName) -> NotificationEmitter {
        NotificationEmitter {
            registry: self.clone(),
            source,
        }
    }
}

/// Emits notifications on behalf of one resource.
#[derive(Clone, Debug)]
pub struct NotificationEmitter {
    registry: ResourceRegistry,
    source: ResourceName,
}

impl NotificationEmitter {
    pub fn source(&self) -> &ResourceName {
        &self.source
    }

    /// Emits a notification of type `kind`.
    pub fn emit(
        &self,
        kind: impl Into<String>,
        message: impl Into<String>,
        user_data: Option<Value>,
    ) -> usize {
        let mut notification = Notification::new(kind, self.source.clone()).with_message(message);
        notification.user_data = user_data;
        self.registry.emit(notification)
    }

    /// Emits an attribute-change notification.
    pub fn attribute_changed(
        &self,
        attribute: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) -> usize {
        self.registry.emit(Notification::attribute_changed(
            self.source.clone(),
            attribute,
            old_value,
            new_value,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxlink_protocol::ListenerId;
    use serde_json::json;

    struct Plain(&'static str);

    #[async_trait]
    impl ManagedResource for Plain {
        fn info(&self) -> ResourceInfo {
            ResourceInfo {
                class_name: self.0.to_string(),
                description: String::new(),
                attributes: Vec::new(),
                operations: Vec::new(),
                notifications: Vec::new(),
            }
        }
    }

    fn name(raw: &str) -> ResourceName {
        ResourceName::parse(raw).unwrap()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ResourceRegistry::default();
        registry
            .register(name("a:type=X"), Arc::new(Plain("X")))
            .unwrap();
        let err = registry
            .register(name("a:type=X"), Arc::new(Plain("X")))
            .unwrap_err();
        assert_eq!(err.code, FaultCode::AlreadyExists);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn queries_are_sorted_and_filtered() {
        let registry = ResourceRegistry::new("jobs");
        for raw in ["b:type=Node,id=2", "a:type=Node,id=1", "b:type=Driver"] {
            registry.register(name(raw), Arc::new(Plain("X"))).unwrap();
        }
        let pattern = ResourcePattern::parse("b:type=Node,*").unwrap();
        assert_eq!(
            registry.query_names(Some(&pattern)),
            vec![name("b:type=Node,id=2")]
        );
        assert_eq!(registry.query_names(None).len(), 3);
        assert_eq!(registry.domains(), vec!["a", "b"]);
        assert_eq!(registry.default_domain(), "jobs");
    }

    #[test]
    fn create_uses_the_class_factory() {
        let registry = ResourceRegistry::default();
        registry.register_factory("Counter", |_name: &ResourceName, params: &[Value]| {
            anyhow::ensure!(params.len() <= 1, "at most one parameter");
            Ok(Arc::new(Plain("Counter")) as Arc<dyn ManagedResource>)
        });

        let created = registry
            .create("Counter", &name("a:type=Counter"), &[json!(1)])
            .unwrap();
        assert!(registry.is_registered(&created));

        let missing = registry
            .create("Nope", &name("a:type=Other"), &[])
            .unwrap_err();
        assert_eq!(missing.code, FaultCode::NotFound);

        let failed = registry
            .create("Counter", &name("a:type=Bad"), &[json!(1), json!(2)])
            .unwrap_err();
        assert_eq!(failed.code, FaultCode::OperationFailed);
        assert!(!registry.is_registered(&name("a:type=Bad")));
    }

    #[test]
    fn resource_faults_keep_their_code() {
        let fault = into_fault(RemoteFault::invalid_argument("bad").into());
        assert_eq!(fault.code, FaultCode::InvalidArgument);
        let other = into_fault(anyhow::anyhow!("disk on fire"));
        assert_eq!(other.code, FaultCode::OperationFailed);
        assert!(other.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn emit_stamps_sequence_per_source() {
        let registry = ResourceRegistry::default();
        let r1 = name("test:name=R1");
        registry.register(r1.clone(), Arc::new(Plain("X"))).unwrap();
        let mut rx = registry.hub().attach("c1", 8);
        registry.hub().subscribe("c1", &r1, ListenerId(7), None);

        let emitter = registry.emitter(r1.clone());
        assert_eq!(emitter.emit("job.done", "first", None), 1);
        assert_eq!(emitter.attribute_changed("Count", json!(0), json!(1)), 1);

        let (id, first) = rx.recv().await.unwrap();
        assert_eq!(id, ListenerId(7));
        assert_eq!((first.sequence, first.message.as_str()), (1, "first"));
        assert!(first.timestamp > 0);
        assert_eq!(rx.recv().await.unwrap().1.sequence, 2);
    }

    #[test]
    fn unregister_drops_subscriptions() {
        let registry = ResourceRegistry::default();
        let r1 = name("test:name=R1");
        registry.register(r1.clone(), Arc::new(Plain("X"))).unwrap();
        let _rx = registry.hub().attach("c1", 8);
        registry.hub().subscribe("c1", &r1, ListenerId(1), None);

        registry.unregister(&r1).unwrap();
        assert_eq!(registry.hub().subscription_count(), 0);
        assert_eq!(registry.emitter(r1.clone()).emit("job.late", "", None), 0);
        assert_eq!(registry.sequence_count(), 0);
        assert_eq!(
            registry.unregister(&r1).err().unwrap().code,
            FaultCode::NotFound
        );
    }
}
