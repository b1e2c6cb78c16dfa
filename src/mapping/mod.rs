//! Field mapping between the internal vocabulary and provider identifiers
//!
//! A [`FieldMapping`] holds one [`Dictionary`] per mapped field (status and
//! severity) for a single (tenant, provider). Lookups never fail: a miss
//! resolves to the documented default and is reported as `defaulted` so the
//! caller can surface it as a warning.

mod store;

pub use store::MappingStore;

use crate::domain::{Severity, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which way a value is being translated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToExternal,
    FromExternal,
}

/// The mapped field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    Status,
    Severity,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::Status => "status",
            MappingKind::Severity => "severity",
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingKind {
    type Err = crate::BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "status" => Ok(MappingKind::Status),
            "severity" | "priority" => Ok(MappingKind::Severity),
            other => Err(crate::BridgeError::Other(format!(
                "Unknown mapping kind: {}",
                other
            ))),
        }
    }
}

/// What to do when a status change has no target on the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedStatusPolicy {
    /// Leave the external status untouched and report a warning
    #[default]
    Skip,
    /// Move the item to the mapping of the default status (`open`)
    UseDefault,
}

/// Internal enum that can be mapped
pub trait Vocabulary: Copy + Ord + Default + fmt::Display + FromStr + 'static {
    const KIND: MappingKind;
}

impl Vocabulary for Status {
    const KIND: MappingKind = MappingKind::Status;
}

impl Vocabulary for Severity {
    const KIND: MappingKind = MappingKind::Severity;
}

/// Two-way table between internal values and provider identifiers
///
/// `forward` drives writes to the provider. `reverse` drives reads and may
/// hold several provider values for the same internal value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "T: Vocabulary + Serialize + serde::de::DeserializeOwned")]
pub struct Dictionary<T: Vocabulary> {
    #[serde(default)]
    pub forward: BTreeMap<T, String>,
    #[serde(default)]
    pub reverse: BTreeMap<String, T>,
}

impl<T: Vocabulary> Default for Dictionary<T> {
    fn default() -> Self {
        Self {
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
        }
    }
}

impl<T: Vocabulary> Dictionary<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `value` to `external`; also maps `external` back unless it is already taken
    pub fn insert(&mut self, value: T, external: impl Into<String>) {
        let external = external.into();
        self.reverse.entry(external.clone()).or_insert(value);
        self.forward.insert(value, external);
    }

    /// Add a read-only alias (e.g. a provider value that is never written)
    pub fn insert_reverse(&mut self, external: impl Into<String>, value: T) {
        self.reverse.insert(external.into(), value);
    }

    /// Remove the forward entry for `value` and every reverse entry pointing at it
    pub fn remove(&mut self, value: T) {
        self.forward.remove(&value);
        self.reverse.retain(|_, v| *v != value);
    }

    pub fn forward(&self, value: T) -> Option<&str> {
        self.forward.get(&value).map(String::as_str)
    }

    /// Exact match first, then case-insensitive
    pub fn reverse(&self, external: &str) -> Option<T> {
        if let Some(value) = self.reverse.get(external) {
            return Some(*value);
        }
        let external = external.trim();
        self.reverse
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(external))
            .map(|(_, v)| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.reverse.is_empty()
    }
}

/// Versioned mapping for one (tenant, provider)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Bumped by every [`MappingStore::replace`]; 0 when nothing is stored
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub status: Dictionary<Status>,
    #[serde(default)]
    pub severity: Dictionary<Severity>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: Status, external: impl Into<String>) -> Self {
        self.status.insert(status, external);
        self
    }

    pub fn with_severity(mut self, severity: Severity, external: impl Into<String>) -> Self {
        self.severity.insert(severity, external);
        self
    }
}

/// Result of a single lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// `None` when neither the value nor the default is mapped
    pub value: Option<String>,
    /// The value was not mapped and the default was used instead
    pub defaulted: bool,
}

/// Typed result of a reverse lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub defaulted: bool,
}

/// How to apply a status on an existing external item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusPlan {
    Apply(Translation),
    Skip { requested: Status, reason: String },
}

/// Translates field values in both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMapper {
    policy: UnmappedStatusPolicy,
}

impl FieldMapper {
    pub fn new(policy: UnmappedStatusPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> UnmappedStatusPolicy {
        self.policy
    }

    /// Untyped entry point
    ///
    /// `value` is an internal value name for `ToExternal` and a provider
    /// identifier for `FromExternal`. Never fails; see [`Translation`].
    pub fn translate(
        &self,
        direction: Direction,
        kind: MappingKind,
        mapping: &FieldMapping,
        value: &str,
    ) -> Translation {
        match (direction, kind) {
            (Direction::ToExternal, MappingKind::Status) => {
                to_external_str(&mapping.status, value)
            }
            (Direction::ToExternal, MappingKind::Severity) => {
                to_external_str(&mapping.severity, value)
            }
            (Direction::FromExternal, MappingKind::Status) => {
                let resolved = from_external(&mapping.status, value);
                Translation {
                    value: Some(resolved.value.to_string()),
                    defaulted: resolved.defaulted,
                }
            }
            (Direction::FromExternal, MappingKind::Severity) => {
                let resolved = from_external(&mapping.severity, value);
                Translation {
                    value: Some(resolved.value.to_string()),
                    defaulted: resolved.defaulted,
                }
            }
        }
    }

    pub fn severity_to_priority(&self, mapping: &FieldMapping, severity: Severity) -> Translation {
        to_external(&mapping.severity, severity)
    }

    /// Status for a newly created item; always falls back to the default
    pub fn status_to_external(&self, mapping: &FieldMapping, status: Status) -> Translation {
        to_external(&mapping.status, status)
    }

    pub fn priority_to_severity(&self, mapping: &FieldMapping, external: &str) -> Resolved<Severity> {
        from_external(&mapping.severity, external)
    }

    pub fn external_to_status(&self, mapping: &FieldMapping, external: &str) -> Resolved<Status> {
        from_external(&mapping.status, external)
    }

    /// Status for an existing item, honoring the unmapped-status policy
    pub fn status_for_update(&self, mapping: &FieldMapping, status: Status) -> StatusPlan {
        if let Some(external) = mapping.status.forward(status) {
            return StatusPlan::Apply(Translation {
                value: Some(external.to_string()),
                defaulted: false,
            });
        }

        match self.policy {
            UnmappedStatusPolicy::UseDefault => {
                let translation = to_external(&mapping.status, status);
                if translation.value.is_some() {
                    StatusPlan::Apply(translation)
                } else {
                    StatusPlan::Skip {
                        requested: status,
                        reason: "no mapping for the status or the default status".to_string(),
                    }
                }
            }
            UnmappedStatusPolicy::Skip => {
                tracing::warn!(status = %status, "No provider status mapped, leaving status unchanged");
                StatusPlan::Skip {
                    requested: status,
                    reason: format!("status '{}' is not mapped for this provider", status),
                }
            }
        }
    }
}

fn to_external_str<T: Vocabulary>(dict: &Dictionary<T>, value: &str) -> Translation {
    match value.parse::<T>() {
        Ok(value) => to_external(dict, value),
        Err(_) => {
            tracing::warn!(kind = %T::KIND, value = %value, "Unknown internal value, using default");
            default_forward(dict)
        }
    }
}

fn to_external<T: Vocabulary>(dict: &Dictionary<T>, value: T) -> Translation {
    if let Some(external) = dict.forward(value) {
        return Translation {
            value: Some(external.to_string()),
            defaulted: false,
        };
    }

    tracing::warn!(
        kind = %T::KIND,
        value = %value,
        default = %T::default(),
        "Mapping incomplete, using default"
    );
    default_forward(dict)
}

fn default_forward<T: Vocabulary>(dict: &Dictionary<T>) -> Translation {
    Translation {
        value: dict.forward(T::default()).map(str::to_string),
        defaulted: true,
    }
}

fn from_external<T: Vocabulary>(dict: &Dictionary<T>, external: &str) -> Resolved<T> {
    match dict.reverse(external) {
        Some(value) => Resolved {
            value,
            defaulted: false,
        },
        None => {
            tracing::warn!(
                kind = %T::KIND,
                value = %external,
                default = %T::default(),
                "Mapping incomplete, using default"
            );
            Resolved {
                value: T::default(),
                defaulted: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jira_mapping() -> FieldMapping {
        FieldMapping::new()
            .with_severity(Severity::High, "2")
            .with_severity(Severity::Medium, "3")
            .with_status(Status::Open, "To Do")
            .with_status(Status::Resolved, "Done")
    }

    #[test]
    fn test_forward_hit() {
        let mapper = FieldMapper::default();
        let t = mapper.severity_to_priority(&jira_mapping(), Severity::High);
        assert_eq!(t.value.as_deref(), Some("2"));
        assert!(!t.defaulted);
    }

    #[test]
    fn test_missing_critical_falls_back_to_medium() {
        let mapper = FieldMapper::default();
        let t = mapper.translate(
            Direction::ToExternal,
            MappingKind::Severity,
            &jira_mapping(),
            "critical",
        );
        assert_eq!(t.value.as_deref(), Some("3"));
        assert!(t.defaulted);
    }

    #[test]
    fn test_missing_value_and_default_gives_none() {
        let mapper = FieldMapper::default();
        let mapping = FieldMapping::new().with_severity(Severity::High, "2");
        let t = mapper.severity_to_priority(&mapping, Severity::Low);
        assert_eq!(t.value, None);
        assert!(t.defaulted);

        let t = mapper.status_to_external(&FieldMapping::new(), Status::Closed);
        assert_eq!(t.value, None);
    }

    #[test]
    fn test_reverse_lookup_is_case_insensitive() {
        let mapper = FieldMapper::default();
        let resolved = mapper.external_to_status(&jira_mapping(), "done");
        assert_eq!(resolved.value, Status::Resolved);
        assert!(!resolved.defaulted);
    }

    #[test]
    fn test_reverse_miss_defaults() {
        let mapper = FieldMapper::default();
        let status = mapper.external_to_status(&jira_mapping(), "Blocked");
        assert_eq!(status.value, Status::Open);
        assert!(status.defaulted);

        let t = mapper.translate(
            Direction::FromExternal,
            MappingKind::Severity,
            &jira_mapping(),
            "9",
        );
        assert_eq!(t.value.as_deref(), Some("medium"));
        assert!(t.defaulted);
    }

    #[test]
    fn test_unknown_internal_value_uses_default() {
        let mapper = FieldMapper::default();
        let t = mapper.translate(Direction::ToExternal, MappingKind::Status, &jira_mapping(), "wontfix");
        assert_eq!(t.value.as_deref(), Some("To Do"));
        assert!(t.defaulted);
    }

    #[test]
    fn test_insert_keeps_first_reverse_entry() {
        let mut dict = Dictionary::new();
        dict.insert(Status::Resolved, "Done");
        dict.insert(Status::Closed, "Done");
        assert_eq!(dict.forward(Status::Closed), Some("Done"));
        assert_eq!(dict.reverse("Done"), Some(Status::Resolved));

        dict.insert_reverse("Won't Do", Status::Closed);
        assert_eq!(dict.reverse("won't do"), Some(Status::Closed));

        dict.remove(Status::Closed);
        assert_eq!(dict.forward(Status::Closed), None);
        assert_eq!(dict.reverse("Won't Do"), None);
    }

    #[test]
    fn test_status_for_update_skip_policy() {
        let mapper = FieldMapper::new(UnmappedStatusPolicy::Skip);
        let mapping = FieldMapping::new()
            .with_status(Status::Open, "list1")
            .with_status(Status::Resolved, "list2");

        assert_eq!(
            mapper.status_for_update(&mapping, Status::Resolved),
            StatusPlan::Apply(Translation {
                value: Some("list2".to_string()),
                defaulted: false
            })
        );
        assert!(matches!(
            mapper.status_for_update(&mapping, Status::Closed),
            StatusPlan::Skip {
                requested: Status::Closed,
                ..
            }
        ));
    }

    #[test]
    fn test_status_for_update_use_default_policy() {
        let mapper = FieldMapper::new(UnmappedStatusPolicy::UseDefault);
        let mapping = FieldMapping::new().with_status(Status::Open, "list1");

        assert_eq!(
            mapper.status_for_update(&mapping, Status::Closed),
            StatusPlan::Apply(Translation {
                value: Some("list1".to_string()),
                defaulted: true
            })
        );
        assert!(matches!(
            mapper.status_for_update(&FieldMapping::new(), Status::Closed),
            StatusPlan::Skip { .. }
        ));
    }

    #[test]
    fn test_mapping_kind_parse() {
        assert_eq!("priority".parse::<MappingKind>().unwrap(), MappingKind::Severity);
        assert!("color".parse::<MappingKind>().is_err());
    }
}
