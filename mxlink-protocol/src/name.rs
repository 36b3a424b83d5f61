//! Resource names and name patterns.
//!
//! A manageable resource is addressed by a name of the form
//! `domain:key=value[,key=value...]`. Names compare by their canonical form,
//! in which key properties are sorted by key, so `a:x=1,y=2` and `a:y=2,x=1`
//! are the same resource.
//!
//! [`ResourcePattern`] is the query form used by `QueryNames`: the domain may
//! contain `*` and `?` wildcards and the property list may end with `,*`
//! (or be just `*`) to match names carrying additional properties.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ════════════════════════════════════════════════════════════════════
// ResourceName
// ════════════════════════════════════════════════════════════════════

/// Name of a manageable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName {
    canonical: String,
    domain_len: usize,
    properties: Vec<(String, String)>,
}

impl ResourceName {
    /// Parses and validates a resource name.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let (domain, props) = split_domain(raw)?;
        if domain.contains(['*', '?']) {
            return Err(ProtocolError::invalid_name(raw, "wildcards are not allowed in a name"));
        }
        let mut properties = parse_properties(raw, props)?;
        if properties.is_empty() {
            return Err(ProtocolError::invalid_name(raw, "at least one key property is required"));
        }
        properties.sort();
        Ok(Self::from_parts(domain, properties))
    }

    /// Builds a name from a domain and a single key property.
    pub fn with_key(
        domain: impl AsRef<str>,
        key: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self, ProtocolError> {
        Self::parse(&format!("{}:{}={}", domain.as_ref(), key.as_ref(), value.as_ref()))
    }

    fn from_parts(domain: &str, properties: Vec<(String, String)>) -> Self {
        let mut canonical = String::with_capacity(domain.len() + 16);
        canonical.push_str(domain);
        canonical.push(':');
        for (i, (k, v)) in properties.iter().enumerate() {
            if i > 0 {
                canonical.push(',');
            }
            canonical.push_str(k);
            canonical.push('=');
            canonical.push_str(v);
        }
        Self {
            canonical,
            domain_len: domain.len(),
            properties,
        }
    }

    /// The domain part (before the colon).
    pub fn domain(&self) -> &str {
        &self.canonical[..self.domain_len]
    }

    /// Value of one key property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Key properties, sorted by key.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for ResourceName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceName> for String {
    fn from(name: ResourceName) -> Self {
        name.canonical
    }
}

// ════════════════════════════════════════════════════════════════════
// ResourcePattern
// ════════════════════════════════════════════════════════════════════

/// Query pattern over resource names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    raw: String,
    domain: String,
    properties: Vec<(String, String)>,
    property_wildcard: bool,
}

impl ResourcePattern {
    /// Pattern matching every resource (`*:*`).
    pub fn all() -> Self {
        Self {
            raw: "*:*".to_string(),
            domain: "*".to_string(),
            properties: Vec::new(),
            property_wildcard: true,
        }
    }

    /// Parses a pattern.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let (domain, props) = split_domain(raw)?;
        let (props, property_wildcard) = if props == "*" {
            ("", true)
        } else if let Some(head) = props.strip_suffix(",*") {
            (head, true)
        } else {
            (props, false)
        };
        let properties = parse_properties(raw, props)?;
        if properties.is_empty() && !property_wildcard {
            return Err(ProtocolError::invalid_name(raw, "empty property list"));
        }
        Ok(Self {
            raw: raw.to_string(),
            domain: domain.to_string(),
            properties,
            property_wildcard,
        })
    }

    /// Returns `true` if `name` is selected by this pattern.
    pub fn matches(&self, name: &ResourceName) -> bool {
        if !glob_matches(self.domain.as_bytes(), name.domain().as_bytes()) {
            return false;
        }
        let all_present = self
            .properties
            .iter()
            .all(|(k, v)| name.property(k) == Some(v.as_str()));
        if self.property_wildcard {
            all_present
        } else {
            all_present && self.properties.len() == name.properties().len()
        }
    }

    /// Raw pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> Self {
        pattern.raw
    }
}

// ────────────────────────────────────────────────────────────────────
// Parsing helpers
// ────────────────────────────────────────────────────────────────────

fn split_domain(raw: &str) -> Result<(&str, &str), ProtocolError> {
    let (domain, props) = raw
        .split_once(':')
        .ok_or_else(|| ProtocolError::invalid_name(raw, "missing ':' separator"))?;
    if domain.is_empty() {
        return Err(ProtocolError::invalid_name(raw, "empty domain"));
    }
    Ok((domain, props))
}

fn parse_properties(raw: &str, props: &str) -> Result<Vec<(String, String)>, ProtocolError> {
    if props.is_empty() {
        return Ok(Vec::new());
    }
    let mut out: Vec<(String, String)> = Vec::new();
    for pair in props.split(',') {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| ProtocolError::invalid_name(raw, "property without '='"))?;
        if k.is_empty() || v.is_empty() {
            return Err(ProtocolError::invalid_name(raw, "empty property key or value"));
        }
        if k.contains([':', '*', '?']) || v.contains([':', '=']) {
            return Err(ProtocolError::invalid_name(raw, "illegal character in property"));
        }
        if out.iter().any(|(existing, _)| existing == k) {
            return Err(ProtocolError::invalid_name(raw, "duplicate property key"));
        }
        out.push((k.to_string(), v.to_string()));
    }
    Ok(out)
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_matches(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
