//! Authentication and authorization for remote operations.
//!
//! Two hooks, both server side:
//!
//! 1. **Handshake**: [`Authenticator::authenticate`] turns the credentials in
//!    the client's hello into the [`Principal`] bound to the connection.
//! 2. **Every request**: [`authorize`] routes the operation to the matching
//!    check method of an [`AuthorizationChecker`] before it is dispatched.
//!
//! Every check method defaults to denial. A policy only grants what it
//! overrides, so a newly added operation kind is denied until a policy
//! explicitly allows it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use mxlink_protocol::{
    Attribute, Credentials, ListenerId, NotificationFilter, Operation, OperationKind,
    RemoteFault, ResourceName, ResourcePattern,
};
use serde_json::Value;

// ════════════════════════════════════════════════════════════════════
// Public types
// ════════════════════════════════════════════════════════════════════

/// Authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity bound to a connection once its handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationContext {
    /// `None` for anonymous connections.
    pub principal: Option<Principal>,
    pub connection_id: String,
}

impl AuthorizationContext {
    pub fn new(connection_id: impl Into<String>, principal: Option<Principal>) -> Self {
        Self {
            principal,
            connection_id: connection_id.into(),
        }
    }

    pub fn principal_name(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.name.as_str())
    }
}

/// Rejection raised by a check method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenied {
    pub kind: OperationKind,
    pub resource: Option<String>,
    pub principal: Option<String>,
    pub reason: String,
}

impl PermissionDenied {
    pub fn new(
        ctx: &AuthorizationContext,
        kind: OperationKind,
        resource: Option<&ResourceName>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            resource: resource.map(|r| r.to_string()),
            principal: ctx.principal_name().map(str::to_string),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PermissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} denied", self.kind)?;
        if let Some(resource) = &self.resource {
            write!(f, " on {}", resource)?;
        }
        match &self.principal {
            Some(p) => write!(f, " for principal '{}'", p)?,
            None => write!(f, " for anonymous connection")?,
        }
        write!(f, ": {}", self.reason)
    }
}

impl std::error::Error for PermissionDenied {}

impl From<PermissionDenied> for RemoteFault {
    fn from(denied: PermissionDenied) -> Self {
        RemoteFault::permission_denied(denied.to_string())
    }
}

/// Result of a check method.
pub type CheckResult = Result<(), PermissionDenied>;

fn deny(
    ctx: &AuthorizationContext,
    kind: OperationKind,
    resource: Option<&ResourceName>,
) -> CheckResult {
    Err(PermissionDenied::new(ctx, kind, resource, "not permitted by policy"))
}

// ════════════════════════════════════════════════════════════════════
// AuthorizationChecker
// ════════════════════════════════════════════════════════════════════

/// Per-operation authorization hook. One method per [`OperationKind`].
#[allow(unused_variables)]
pub trait AuthorizationChecker: Send + Sync + 'static {
    fn check_get_attribute(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attribute: &str,
    ) -> CheckResult {
        deny(ctx, OperationKind::GetAttribute, Some(resource))
    }

    fn check_get_attributes(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attributes: &[String],
    ) -> CheckResult {
        deny(ctx, OperationKind::GetAttributes, Some(resource))
    }

    fn check_set_attribute(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attribute: &Attribute,
    ) -> CheckResult {
        deny(ctx, OperationKind::SetAttribute, Some(resource))
    }

    fn check_set_attributes(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attributes: &[Attribute],
    ) -> CheckResult {
        deny(ctx, OperationKind::SetAttributes, Some(resource))
    }

    fn check_invoke(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        operation: &str,
        params: &[Value],
        signature: &[String],
    ) -> CheckResult {
        deny(ctx, OperationKind::Invoke, Some(resource))
    }

    fn check_create_resource(
        &self,
        ctx: &AuthorizationContext,
        class_name: &str,
        resource: &ResourceName,
        params: &[Value],
    ) -> CheckResult {
        deny(ctx, OperationKind::CreateResource, Some(resource))
    }

    fn check_destroy_resource(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        deny(ctx, OperationKind::DestroyResource, Some(resource))
    }

    fn check_add_listener(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        filter: Option<&NotificationFilter>,
    ) -> CheckResult {
        deny(ctx, OperationKind::AddListener, Some(resource))
    }

    fn check_remove_listener(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        listener_id: ListenerId,
    ) -> CheckResult {
        deny(ctx, OperationKind::RemoveListener, Some(resource))
    }

    fn check_query_names(
        &self,
        ctx: &AuthorizationContext,
        pattern: Option<&ResourcePattern>,
    ) -> CheckResult {
        deny(ctx, OperationKind::QueryNames, None)
    }

    fn check_is_registered(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        deny(ctx, OperationKind::IsRegistered, Some(resource))
    }

    fn check_get_resource_count(&self, ctx: &AuthorizationContext) -> CheckResult {
        deny(ctx, OperationKind::GetResourceCount, None)
    }

    fn check_get_resource_info(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        deny(ctx, OperationKind::GetResourceInfo, Some(resource))
    }

    fn check_get_domains(&self, ctx: &AuthorizationContext) -> CheckResult {
        deny(ctx, OperationKind::GetDomains, None)
    }

    fn check_get_default_domain(&self, ctx: &AuthorizationContext) -> CheckResult {
        deny(ctx, OperationKind::GetDefaultDomain, None)
    }

    fn check_is_instance_of(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        class_name: &str,
    ) -> CheckResult {
        deny(ctx, OperationKind::IsInstanceOf, Some(resource))
    }
}

/// Routes `operation` to the check method for its kind.
pub fn authorize(
    checker: &dyn AuthorizationChecker,
    ctx: &AuthorizationContext,
    operation: &Operation,
) -> CheckResult {
    match operation {
        Operation::GetAttribute {
            resource,
            attribute,
        } => checker.check_get_attribute(ctx, resource, attribute),
        Operation::GetAttributes {
            resource,
            attributes,
        } => checker.check_get_attributes(ctx, resource, attributes),
        Operation::SetAttribute {
            resource,
            attribute,
        } => checker.check_set_attribute(ctx, resource, attribute),
        Operation::SetAttributes {
            resource,
            attributes,
        } => checker.check_set_attributes(ctx, resource, attributes),
        Operation::Invoke {
            resource,
            operation,
            params,
            signature,
        } => checker.check_invoke(ctx, resource, operation, params, signature),
        Operation::CreateResource {
            class_name,
            resource,
            params,
        } => checker.check_create_resource(ctx, class_name, resource, params),
        Operation::DestroyResource { resource } => checker.check_destroy_resource(ctx, resource),
        Operation::AddListener { resource, filter } => {
            checker.check_add_listener(ctx, resource, filter.as_ref())
        }
        Operation::RemoveListener {
            resource,
            listener_id,
        } => checker.check_remove_listener(ctx, resource, *listener_id),
        Operation::QueryNames { pattern } => checker.check_query_names(ctx, pattern.as_ref()),
        Operation::IsRegistered { resource } => checker.check_is_registered(ctx, resource),
        Operation::GetResourceCount => checker.check_get_resource_count(ctx),
        Operation::GetResourceInfo { resource } => checker.check_get_resource_info(ctx, resource),
        Operation::GetDomains => checker.check_get_domains(ctx),
        Operation::GetDefaultDomain => checker.check_get_default_domain(ctx),
        Operation::IsInstanceOf {
            resource,
            class_name,
        } => checker.check_is_instance_of(ctx, resource, class_name),
    }
}

// ════════════════════════════════════════════════════════════════════
// Ready-made policies
// ════════════════════════════════════════════════════════════════════

/// Permits every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[allow(unused_variables)]
impl AuthorizationChecker for AllowAll {
    fn check_get_attribute(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attribute: &str,
    ) -> CheckResult {
        Ok(())
    }
    fn check_get_attributes(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attributes: &[String],
    ) -> CheckResult {
        Ok(())
    }
    fn check_set_attribute(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attribute: &Attribute,
    ) -> CheckResult {
        Ok(())
    }
    fn check_set_attributes(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attributes: &[Attribute],
    ) -> CheckResult {
        Ok(())
    }
    fn check_invoke(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        operation: &str,
        params: &[Value],
        signature: &[String],
    ) -> CheckResult {
        Ok(())
    }
    fn check_create_resource(
        &self,
        ctx: &AuthorizationContext,
        class_name: &str,
        resource: &ResourceName,
        params: &[Value],
    ) -> CheckResult {
        Ok(())
    }
    fn check_destroy_resource(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        Ok(())
    }
    fn check_add_listener(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        filter: Option<&NotificationFilter>,
    ) -> CheckResult {
        Ok(())
    }
    fn check_remove_listener(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        listener_id: ListenerId,
    ) -> CheckResult {
        Ok(())
    }
    fn check_query_names(
        &self,
        ctx: &AuthorizationContext,
        pattern: Option<&ResourcePattern>,
    ) -> CheckResult {
        Ok(())
    }
    fn check_is_registered(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        Ok(())
    }
    fn check_get_resource_count(&self, ctx: &AuthorizationContext) -> CheckResult {
        Ok(())
    }
    fn check_get_resource_info(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        Ok(())
    }
    fn check_get_domains(&self, ctx: &AuthorizationContext) -> CheckResult {
        Ok(())
    }
    fn check_get_default_domain(&self, ctx: &AuthorizationContext) -> CheckResult {
        Ok(())
    }
    fn check_is_instance_of(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        class_name: &str,
    ) -> CheckResult {
        Ok(())
    }
}

/// Denies every operation; the trait defaults, unmodified.
///
/// Wrap or copy it to grant individual kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl AuthorizationChecker for DenyAll {}

/// Access granted to a principal by an [`AccessControlList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// Read attributes, query, inspect, (un)subscribe.
    ReadOnly,
    /// Everything, including writes, invocations and resource lifecycle.
    ReadWrite,
}

/// Principal-name to [`AccessLevel`] table. Unknown and anonymous
/// principals are denied unless `anonymous` is set.
#[derive(Debug, Clone, Default)]
pub struct AccessControlList {
    entries: HashMap<String, AccessLevel>,
    anonymous: Option<AccessLevel>,
}

impl AccessControlList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `level` to `principal`.
    pub fn grant(mut self, principal: impl Into<String>, level: AccessLevel) -> Self {
        self.entries.insert(principal.into(), level);
        self
    }

    /// Grants `level` to unauthenticated connections.
    pub fn anonymous(mut self, level: AccessLevel) -> Self {
        self.anonymous = Some(level);
        self
    }

    /// Parses `principal readonly|readwrite` lines; `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut acl = Self::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(principal), Some(level), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(format!("line {}: expected '<principal> <level>'", n + 1));
            };
            let level = match level.to_ascii_lowercase().as_str() {
                "readonly" => AccessLevel::ReadOnly,
                "readwrite" => AccessLevel::ReadWrite,
                other => return Err(format!("line {}: unknown access level '{}'", n + 1, other)),
            };
            acl = acl.grant(principal, level);
        }
        Ok(acl)
    }

    fn level_for(&self, ctx: &AuthorizationContext) -> Option<AccessLevel> {
        match ctx.principal_name() {
            Some(name) => self.entries.get(name).copied(),
            None => self.anonymous,
        }
    }

    fn require(
        &self,
        ctx: &AuthorizationContext,
        kind: OperationKind,
        resource: Option<&ResourceName>,
    ) -> CheckResult {
        match self.level_for(ctx) {
            Some(AccessLevel::ReadWrite) => Ok(()),
            Some(AccessLevel::ReadOnly) if !kind.is_mutating() => Ok(()),
            Some(AccessLevel::ReadOnly) => Err(PermissionDenied::new(
                ctx,
                kind,
                resource,
                "read-only access",
            )),
            None => Err(PermissionDenied::new(ctx, kind, resource, "no access granted")),
        }
    }
}

#[allow(unused_variables)]
impl AuthorizationChecker for AccessControlList {
    fn check_get_attribute(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attribute: &str,
    ) -> CheckResult {
        self.require(ctx, OperationKind::GetAttribute, Some(resource))
    }
    fn check_get_attributes(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attributes: &[String],
    ) -> CheckResult {
        self.require(ctx, OperationKind::GetAttributes, Some(resource))
    }
    fn check_set_attribute(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attribute: &Attribute,
    ) -> CheckResult {
        self.require(ctx, OperationKind::SetAttribute, Some(resource))
    }
    fn check_set_attributes(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        attributes: &[Attribute],
    ) -> CheckResult {
        self.require(ctx, OperationKind::SetAttributes, Some(resource))
    }
    fn check_invoke(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        operation: &str,
        params: &[Value],
        signature: &[String],
    ) -> CheckResult {
        self.require(ctx, OperationKind::Invoke, Some(resource))
    }
    fn check_create_resource(
        &self,
        ctx: &AuthorizationContext,
        class_name: &str,
        resource: &ResourceName,
        params: &[Value],
    ) -> CheckResult {
        self.require(ctx, OperationKind::CreateResource, Some(resource))
    }
    fn check_destroy_resource(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        self.require(ctx, OperationKind::DestroyResource, Some(resource))
    }
    fn check_add_listener(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        filter: Option<&NotificationFilter>,
    ) -> CheckResult {
        self.require(ctx, OperationKind::AddListener, Some(resource))
    }
    fn check_remove_listener(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        listener_id: ListenerId,
    ) -> CheckResult {
        self.require(ctx, OperationKind::RemoveListener, Some(resource))
    }
    fn check_query_names(
        &self,
        ctx: &AuthorizationContext,
        pattern: Option<&ResourcePattern>,
    ) -> CheckResult {
        self.require(ctx, OperationKind::QueryNames, None)
    }
    fn check_is_registered(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        self.require(ctx, OperationKind::IsRegistered, Some(resource))
    }
    fn check_get_resource_count(&self, ctx: &AuthorizationContext) -> CheckResult {
        self.require(ctx, OperationKind::GetResourceCount, None)
    }
    fn check_get_resource_info(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
    ) -> CheckResult {
        self.require(ctx, OperationKind::GetResourceInfo, Some(resource))
    }
    fn check_get_domains(&self, ctx: &AuthorizationContext) -> CheckResult {
        self.require(ctx, OperationKind::GetDomains, None)
    }
    fn check_get_default_domain(&self, ctx: &AuthorizationContext) -> CheckResult {
        self.require(ctx, OperationKind::GetDefaultDomain, None)
    }
    fn check_is_instance_of(
        &self,
        ctx: &AuthorizationContext,
        resource: &ResourceName,
        class_name: &str,
    ) -> CheckResult {
        self.require(ctx, OperationKind::IsInstanceOf, Some(resource))
    }
}

// ════════════════════════════════════════════════════════════════════
// Authenticator
// ════════════════════════════════════════════════════════════════════

/// Error returned when a handshake is rejected.
///
/// The message is sent to the client in the handshake rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub message: String,
}

impl AuthError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Handshake authentication hook.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the principal to bind to the connection (`None` for an
    /// anonymous connection), or rejects the handshake.
    async fn authenticate(
        &self,
        credentials: Option<&Credentials>,
        peer: SocketAddr,
    ) -> Result<Option<Principal>, AuthError>;
}

/// Accepts every client; binds the username as principal when credentials
/// are presented, without checking the password.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl Authenticator for Anonymous {
    async fn authenticate(
        &self,
        credentials: Option<&Credentials>,
        _peer: SocketAddr,
    ) -> Result<Option<Principal>, AuthError> {
        Ok(credentials.map(|c| Principal::new(c.username.clone())))
    }
}

/// Fixed username/password table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticCredentials {
    async fn authenticate(
        &self,
        credentials: Option<&Credentials>,
        _peer: SocketAddr,
    ) -> Result<Option<Principal>, AuthError> {
        let creds = credentials.ok_or_else(|| AuthError::new("credentials required"))?;
        match self.users.get(&creds.username) {
            Some(expected) if *expected == creds.password => {
                Ok(Some(Principal::new(creds.username.clone())))
            }
            _ => Err(AuthError::new("invalid username or password")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn r1() -> ResourceName {
        ResourceName::parse("test:name=R1").unwrap()
    }

    fn one_of_each() -> Vec<Operation> {
        let r = r1();
        vec![
            Operation::GetAttribute {
                resource: r.clone(),
                attribute: "A".into(),
            },
            Operation::GetAttributes {
                resource: r.clone(),
                attributes: vec!["A".into()],
            },
            Operation::SetAttribute {
                resource: r.clone(),
                attribute: Attribute::new("A", json!(1)),
            },
            Operation::SetAttributes {
                resource: r.clone(),
                attributes: vec![],
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

    #[test]
    fn fixture_covers_every_kind() {
        let kinds: Vec<_> = one_of_each().iter().map(Operation::kind).collect();
        assert_eq!(kinds, OperationKind::ALL.to_vec());
    }

    #[test]
    fn allow_all_permits_every_kind() {
        let ctx = AuthorizationContext::new("c1", None);
        for op in one_of_each() {
            assert!(authorize(&AllowAll, &ctx, &op).is_ok(), "{}", op.kind());
        }
    }

    #[test]
    fn deny_all_rejects_every_kind() {
        let ctx = AuthorizationContext::new("c1", Some(Principal::new("alice")));
        for op in one_of_each() {
            let denied = authorize(&DenyAll, &ctx, &op).unwrap_err();
            assert_eq!(denied.kind, op.kind());
            assert_eq!(denied.principal.as_deref(), Some("alice"));
        }
    }

    #[test]
    fn deny_all_can_be_selectively_overridden() {
        struct ReadCount;
        impl AuthorizationChecker for ReadCount {
            fn check_get_resource_count(&self, _ctx: &AuthorizationContext) -> CheckResult {
                Ok(())
            }
        }
        let ctx = AuthorizationContext::default();
        assert!(authorize(&ReadCount, &ctx, &Operation::GetResourceCount).is_ok());
        assert!(authorize(&ReadCount, &ctx, &Operation::GetDomains).is_err());
    }

    #[test]
    fn access_levels() {
        let acl = AccessControlList::parse(
            "# monitoring\nmonitor readonly\nadmin  ReadWrite # full access\n",
        )
        .unwrap();
        let monitor = AuthorizationContext::new("c1", Some(Principal::new("monitor")));
        let admin = AuthorizationContext::new("c2", Some(Principal::new("admin")));
        let stranger = AuthorizationContext::new("c3", Some(Principal::new("eve")));
        let anonymous = AuthorizationContext::new("c4", None);

        for op in one_of_each() {
            let mutating = op.kind().is_mutating();
            assert_eq!(authorize(&acl, &monitor, &op).is_ok(), !mutating, "{}", op.kind());
            assert!(authorize(&acl, &admin, &op).is_ok());
            assert!(authorize(&acl, &stranger, &op).is_err());
            assert!(authorize(&acl, &anonymous, &op).is_err());
        }

        let open = AccessControlList::new().anonymous(AccessLevel::ReadOnly);
        assert!(authorize(&open, &anonymous, &Operation::GetDomains).is_ok());
    }

    #[test]
    fn acl_parse_errors() {
        assert!(AccessControlList::parse("admin").is_err());
        assert!(AccessControlList::parse("admin superuser").is_err());
        assert!(AccessControlList::parse("admin readwrite extra").is_err());
    }

    #[test]
    fn denial_message_is_echoable() {
        let ctx = AuthorizationContext::new("c1", None);
        let denied = PermissionDenied::new(&ctx, OperationKind::Invoke, Some(&r1()), "nope");
        let fault: RemoteFault = denied.into();
        assert_eq!(
            fault.message,
            "invoke denied on test:name=R1 for anonymous connection: nope"
        );
    }

    #[tokio::test]
    async fn static_credentials() {
        let auth = StaticCredentials::new().user("admin", "secret");
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let ok = auth
            .authenticate(Some(&Credentials::new("admin", "secret")), peer)
            .await
            .unwrap();
        assert_eq!(ok, Some(Principal::new("admin")));
        assert!(auth
            .authenticate(Some(&Credentials::new("admin", "wrong")), peer)
            .await
            .is_err());
        assert!(auth.authenticate(None, peer).await.is_err());
        assert_eq!(Anonymous.authenticate(None, peer).await.unwrap(), None);
    }
}
