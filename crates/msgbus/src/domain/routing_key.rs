//! # Routing Keys
//!
//! Hierarchical, dot-delimited addresses used for topic routing:
//!
//! ```text
//! <event-class>.<source>[.<scope>].<org>.<system>.<service>.<object>.<action>
//!     event      cloud     local    acme   registry  member   member   create
//! ```
//!
//! Keys are assembled with `RoutingKeyBuilder`. A key with a missing
//! segment would be silently misrouted by the broker, so `must_build()`
//! panics on an incomplete builder: that is a programming defect, not a
//! runtime condition. `build()` is the non-panicking variant.
//!
//! Binding patterns use the same grammar plus the AMQP topic wildcards:
//! `*` matches exactly one segment and `#` matches zero or more.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Placeholder substituted by `RoutingKey::prepare`.
pub const ORG_PLACEHOLDER: &str = "{{ .Org}}";

/// Errors from routing key construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingKeyError {
    /// A required segment was never set.
    #[error("routing key segment '{0}' is not set")]
    MissingSegment(&'static str),

    /// A segment value is not a valid routing key token.
    #[error("routing key segment '{segment}' has invalid value '{value}'")]
    InvalidSegment {
        segment: &'static str,
        value: String,
    },
}

/// First segment: what kind of message this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum EventClass {
    #[default]
    Event,
    Request,
    Response,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Event => "event",
            EventClass::Request => "request",
            EventClass::Response => "response",
        }
    }
}

/// Second segment: where the message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Cloud,
    Device,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cloud => "cloud",
            Source::Device => "device",
        }
    }
}

/// Optional segment after the source: org-local or global traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Local,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

/// An immutable routing key (or binding pattern).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Wrap a raw key without validation.
    ///
    /// Used for broker-provided addresses (reply-to) and for keys read
    /// from configuration.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Substitute the organization into a route template.
    ///
    /// `event.cloud.local.{{ .Org}}.registry.member.member.create` with
    /// org `acme` becomes `event.cloud.local.acme.registry.member.member.create`.
    pub fn prepare(org: &str, template: &str) -> Self {
        Self(template.replace(ORG_PLACEHOLDER, org).replace("{{.Org}}", org))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Iterate over the dot-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Whether this key is matched by a topic binding `pattern`.
    pub fn matches(&self, pattern: &str) -> bool {
        topic_matches(pattern, &self.0)
    }

    /// Whether this key contains topic wildcards.
    pub fn is_pattern(&self) -> bool {
        self.segments().any(|s| s == "*" || s == "#")
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// AMQP topic-exchange matching.
///
/// `*` matches exactly one segment, `#` matches zero or more segments,
/// any other segment must match literally.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    // reachable[j]: the pattern segments seen so far match key[..j].
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;
    for &segment in pattern {
        let mut next = vec![false; key.len() + 1];
        match segment {
            "#" => {
                let mut seen = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    seen |= reachable[j];
                    *slot = seen;
                }
            }
            "*" => {
                for j in 1..=key.len() {
                    next[j] = reachable[j - 1];
                }
            }
            word => {
                for j in 1..=key.len() {
                    next[j] = reachable[j - 1] && key[j - 1] == word;
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }
    reachable[key.len()]
}

/// Fluent builder for routing keys.
///
/// Cheap to clone: services keep a base builder with source, org, system
/// and service set, and derive one key per event from it.
///
/// ```
/// use msgbus::RoutingKeyBuilder;
///
/// let base = RoutingKeyBuilder::new()
///     .cloud_source()
///     .org("acme")
///     .system("node")
///     .service("state");
///
/// let key = base.clone().object("node").action("online").must_build();
/// assert_eq!(key.as_str(), "event.cloud.acme.node.state.node.online");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingKeyBuilder {
    class: EventClass,
    source: Option<Source>,
    scope: Option<Scope>,
    org: Option<String>,
    system: Option<String>,
    service: Option<String>,
    object: Option<String>,
    action: Option<String>,
}

impl RoutingKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: EventClass) -> Self {
        self.class = class;
        self
    }

    pub fn event(self) -> Self {
        self.class(EventClass::Event)
    }

    pub fn request(self) -> Self {
        self.class(EventClass::Request)
    }

    pub fn response(self) -> Self {
        self.class(EventClass::Response)
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn cloud_source(self) -> Self {
        self.source(Source::Cloud)
    }

    pub fn device_source(self) -> Self {
        self.source(Source::Device)
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn local_scope(self) -> Self {
        self.scope(Scope::Local)
    }

    pub fn global_scope(self) -> Self {
        self.scope(Scope::Global)
    }

    pub fn org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn action_create(self) -> Self {
        self.action("create")
    }

    pub fn action_update(self) -> Self {
        self.action("update")
    }

    pub fn action_delete(self) -> Self {
        self.action("delete")
    }

    /// Assemble the key, reporting the first missing or invalid segment.
    pub fn build(&self) -> Result<RoutingKey, RoutingKeyError> {
        let source = self
            .source
            .ok_or(RoutingKeyError::MissingSegment("source"))?;

        let mut segments: Vec<&str> = Vec::with_capacity(8);
        segments.push(self.class.as_str());
        segments.push(source.as_str());
        if let Some(scope) = self.scope {
            segments.push(scope.as_str());
        }
        segments.push(required("org", &self.org)?);
        segments.push(required("system", &self.system)?);
        segments.push(required("service", &self.service)?);
        segments.push(required("object", &self.object)?);
        segments.push(required("action", &self.action)?);

        Ok(RoutingKey(segments.join(".")))
    }

    /// Assemble the key.
    ///
    /// # Panics
    ///
    /// Panics if a required segment is unset or invalid.
    pub fn must_build(&self) -> RoutingKey {
        match self.build() {
            Ok(key) => key,
            Err(e) => panic!("invalid routing key: {e}"),
        }
    }
}

fn required<'a>(
    segment: &'static str,
    value: &'a Option<String>,
) -> Result<&'a str, RoutingKeyError> {
    let value = value
        .as_deref()
        .ok_or(RoutingKeyError::MissingSegment(segment))?;
    if is_valid_segment(value) {
        Ok(value)
    } else {
        Err(RoutingKeyError::InvalidSegment {
            segment,
            value: value.to_string(),
        })
    }
}

/// A segment is a non-empty run of printable ASCII without `.`; wildcards
/// are only allowed as a whole segment.
fn is_valid_segment(value: &str) -> bool {
    if value == "*" || value == "#" {
        return true;
    }
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '.' && c != '*' && c != '#')
}
