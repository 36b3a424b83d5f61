//! Remote operations and their parameters.
//!
//! [`OperationKind`] is the closed set of operations the transport carries.
//! Each kind has a stable one-byte wire code. [`Operation`] is the request
//! payload: one variant per kind, carrying that operation's parameters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::name::{ResourceName, ResourcePattern};
use crate::notification::NotificationFilter;

/// Server-assigned identifier of one notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ════════════════════════════════════════════════════════════════════
// OperationKind
// ════════════════════════════════════════════════════════════════════

/// Kind of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GetAttribute,
    GetAttributes,
    SetAttribute,
    SetAttributes,
    Invoke,
    CreateResource,
    DestroyResource,
    AddListener,
    RemoveListener,
    QueryNames,
    IsRegistered,
    GetResourceCount,
    GetResourceInfo,
    GetDomains,
    GetDefaultDomain,
    IsInstanceOf,
}

impl OperationKind {
    /// Every operation kind, in wire-code order.
    pub const ALL: [OperationKind; 16] = [
        OperationKind::GetAttribute,
        OperationKind::GetAttributes,
        OperationKind::SetAttribute,
        OperationKind::SetAttributes,
        OperationKind::Invoke,
        OperationKind::CreateResource,
        OperationKind::DestroyResource,
        OperationKind::AddListener,
        OperationKind::RemoveListener,
        OperationKind::QueryNames,
        OperationKind::IsRegistered,
        OperationKind::GetResourceCount,
        OperationKind::GetResourceInfo,
        OperationKind::GetDomains,
        OperationKind::GetDefaultDomain,
        OperationKind::IsInstanceOf,
    ];

    /// Stable wire code (1-based).
    pub fn code(self) -> u8 {
        match self {
            Self::GetAttribute => 1,
            Self::GetAttributes => 2,
            Self::SetAttribute => 3,
            Self::SetAttributes => 4,
            Self::Invoke => 5,
            Self::CreateResource => 6,
            Self::DestroyResource => 7,
            Self::AddListener => 8,
            Self::RemoveListener => 9,
            Self::QueryNames => 10,
            Self::IsRegistered => 11,
            Self::GetResourceCount => 12,
            Self::GetResourceInfo => 13,
            Self::GetDomains => 14,
            Self::GetDefaultDomain => 15,
            Self::IsInstanceOf => 16,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// Returns `true` for kinds that change server state.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::SetAttribute
                | Self::SetAttributes
                | Self::Invoke
                | Self::CreateResource
                | Self::DestroyResource
        )
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::GetAttribute => "get_attribute",
            Self::GetAttributes => "get_attributes",
            Self::SetAttribute => "set_attribute",
            Self::SetAttributes => "set_attributes",
            Self::Invoke => "invoke",
            Self::CreateResource => "create_resource",
            Self::DestroyResource => "destroy_resource",
            Self::AddListener => "add_listener",
            Self::RemoveListener => "remove_listener",
            Self::QueryNames => "query_names",
            Self::IsRegistered => "is_registered",
            Self::GetResourceCount => "get_resource_count",
            Self::GetResourceInfo => "get_resource_info",
            Self::GetDomains => "get_domains",
            Self::GetDefaultDomain => "get_default_domain",
            Self::IsInstanceOf => "is_instance_of",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ════════════════════════════════════════════════════════════════════
// Operation
// ════════════════════════════════════════════════════════════════════

/// A named attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: Value,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Request payload: one remote operation with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    GetAttribute {
        resource: ResourceName,
        attribute: String,
    },
    GetAttributes {
        resource: ResourceName,
        attributes: Vec<String>,
    },
    SetAttribute {
        resource: ResourceName,
        attribute: Attribute,
    },
    SetAttributes {
        resource: ResourceName,
        attributes: Vec<Attribute>,
    },
    Invoke {
        resource: ResourceName,
        operation: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(default)]
        signature: Vec<String>,
    },
    CreateResource {
        class_name: String,
        resource: ResourceName,
        #[serde(default)]
        params: Vec<Value>,
    },
    DestroyResource {
        resource: ResourceName,
    },
    AddListener {
        resource: ResourceName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<NotificationFilter>,
    },
    RemoveListener {
        resource: ResourceName,
        listener_id: ListenerId,
    },
    QueryNames {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<ResourcePattern>,
    },
    IsRegistered {
        resource: ResourceName,
    },
    GetResourceCount,
    GetResourceInfo {
        resource: ResourceName,
    },
    GetDomains,
    GetDefaultDomain,
    IsInstanceOf {
        resource: ResourceName,
        class_name: String,
    },
}

impl Operation {
    /// Kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::GetAttribute { .. } => OperationKind::GetAttribute,
            Self::GetAttributes { .. } => OperationKind::GetAttributes,
            Self::SetAttribute { .. } => OperationKind::SetAttribute,
            Self::SetAttributes { .. } => OperationKind::SetAttributes,
            Self::Invoke { .. } => OperationKind::Invoke,
            Self::CreateResource { .. } => OperationKind::CreateResource,
            Self::DestroyResource { .. } => OperationKind::DestroyResource,
            Self::AddListener { .. } => OperationKind::AddListener,
            Self::RemoveListener { .. } => OperationKind::RemoveListener,
            Self::QueryNames { .. } => OperationKind::QueryNames,
            Self::IsRegistered { .. } => OperationKind::IsRegistered,
            Self::GetResourceCount => OperationKind::GetResourceCount,
            Self::GetResourceInfo { .. } => OperationKind::GetResourceInfo,
            Self::GetDomains => OperationKind::GetDomains,
            Self::GetDefaultDomain => OperationKind::GetDefaultDomain,
            Self::IsInstanceOf { .. } => OperationKind::IsInstanceOf,
        }
    }

    /// Target resource, for operations that address one.
    pub fn resource(&self) -> Option<&ResourceName> {
        match self {
            Self::GetAttribute { resource, .. }
            | Self::GetAttributes { resource, .. }
            | Self::SetAttribute { resource, .. }
            | Self::SetAttributes { resource, .. }
            | Self::Invoke { resource, .. }
            | Self::CreateResource { resource, .. }
            | Self::DestroyResource { resource }
            | Self::AddListener { resource, .. }
            | Self::RemoveListener { resource, .. }
            | Self::IsRegistered { resource }
            | Self::GetResourceInfo { resource }
            | Self::IsInstanceOf { resource, .. } => Some(resource),
            Self::QueryNames { .. }
            | Self::GetResourceCount
            | Self::GetDomains
            | Self::GetDefaultDomain => None,
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Resource metadata
// ════════════════════════════════════════════════════════════════════

/// Description of one attribute exposed by a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    pub type_name: String,
    pub readable: bool,
    pub writable: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Description of one invocable operation exposed by a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub name: String,
    #[serde(default)]
    pub signature: Vec<String>,
    pub return_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Management interface of a resource, returned by `GetResourceInfo`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub attributes: Vec<AttributeInfo>,
    #[serde(default)]
    pub operations: Vec<OperationInfo>,
    /// Notification types the resource may emit.
    #[serde(default)]
    pub notifications: Vec<String>,
}
