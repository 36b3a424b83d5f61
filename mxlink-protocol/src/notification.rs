//! Notifications and server-side notification filters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::name::ResourceName;

/// Notification type emitted for attribute changes.
pub const ATTRIBUTE_CHANGE: &str = "attribute.change";

/// Old and new value of a changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Asynchronous event emitted by a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Dotted notification type, e.g. `node.task.finished`.
    #[serde(rename = "type")]
    pub kind: String,
    pub source: ResourceName,
    /// Per-source emission sequence number.
    pub sequence: u64,
    /// Emission time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_change: Option<AttributeChange>,
}

impl Notification {
    /// Creates a notification with no message or user data. Sequence and
    /// timestamp are normally stamped by the emitting registry.
    pub fn new(kind: impl Into<String>, source: ResourceName) -> Self {
        Self {
            kind: kind.into(),
            source,
            sequence: 0,
            timestamp: 0,
            message: String::new(),
            user_data: None,
            attribute_change: None,
        }
    }

    /// Creates an attribute-change notification.
    pub fn attribute_changed(
        source: ResourceName,
        attribute: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        let mut n = Self::new(ATTRIBUTE_CHANGE, source);
        n.attribute_change = Some(AttributeChange {
            attribute: attribute.into(),
            old_value,
            new_value,
        });
        n
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_user_data(mut self, data: Value) -> Self {
        self.user_data = Some(data);
        self
    }
}

// ════════════════════════════════════════════════════════════════════
// Filters
// ════════════════════════════════════════════════════════════════════

/// Predicate evaluated on the server before a notification is sent to a
/// subscriber. Clients treat it as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum NotificationFilter {
    /// Accepts notifications whose type equals, or starts with `prefix.`,
    /// one of the enabled type prefixes.
    Types { enabled: Vec<String> },

    /// Accepts attribute-change notifications for the named attributes.
    Attributes { names: Vec<String> },

    /// Accepts notifications accepted by every inner filter.
    AllOf { filters: Vec<NotificationFilter> },

    /// Accepts notifications accepted by at least one inner filter.
    AnyOf { filters: Vec<NotificationFilter> },
}

impl NotificationFilter {
    /// Type-prefix filter.
    pub fn types<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Types {
            enabled: enabled.into_iter().map(Into::into).collect(),
        }
    }

    /// Attribute-change filter.
    pub fn attributes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Attributes {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluates the filter.
    pub fn accepts(&self, notification: &Notification) -> bool {
        match self {
            Self::Types { enabled } => enabled
                .iter()
                .any(|prefix| type_matches(prefix, &notification.kind)),
            Self::Attributes { names } => notification
                .attribute_change
                .as_ref()
                .is_some_and(|change| names.iter().any(|n| *n == change.attribute)),
            Self::AllOf { filters } => filters.iter().all(|f| f.accepts(notification)),
            Self::AnyOf { filters } => filters.iter().any(|f| f.accepts(notification)),
        }
    }
}

fn type_matches(prefix: &str, kind: &str) -> bool {
    match kind.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}
