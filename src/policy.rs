// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cleaner policy model
//!
//! Serde model of the `Cleaner` custom resource plus the validated [`Policy`]
//! a task runs, and the [`Candidate`]/[`MatchResult`] values produced while
//! selecting resources.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// API group of the Cleaner custom resource
pub const CLEANER_GROUP: &str = "cleany.wys1203.com";

/// API version of the Cleaner custom resource
pub const CLEANER_VERSION: &str = "v1alpha1";

/// Kind of the Cleaner custom resource
pub const CLEANER_KIND: &str = "Cleaner";

/// Validation failures when turning a Cleaner spec into a [`Policy`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy must contain at least one resource selector")]
    NoSelectors,

    #[error("resource selector #{index}: {field} must not be empty")]
    EmptyField { index: usize, field: &'static str },
}

/// Action to take on matching resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Delete matching resources
    #[default]
    Delete,
    /// Update matching resources with the output of the transform script
    Transform,
    /// Only report matching resources
    Scan,
}

/// Label comparison used by a [`LabelFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Equal,
    Different,
}

/// Filter on a single label of the selected resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFilter {
    pub key: String,
    pub operation: Operation,
    pub value: String,
}

/// One declarative rule identifying a resource type, its scope and an optional predicate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// Explicit namespace of the selected resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label selector expression matched against namespace labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<String>,

    /// API group (empty for the core group)
    #[serde(default)]
    pub group: String,

    pub version: String,

    pub kind: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<LabelFilter>,

    /// Lua source defining `evaluate(obj)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<String>,
}

impl ResourceSelector {
    /// Predicate script, treating blank source as absent
    pub fn script(&self) -> Option<&str> {
        self.evaluate.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Namespace label expression, treating a blank one as absent
    pub fn namespace_expression(&self) -> Option<&str> {
        self.namespace_selector
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePolicySet {
    pub resource_selectors: Vec<ResourceSelector>,

    /// Lua source defining `evaluate(resources)` over every matched object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_selection: Option<String>,
}

/// Desired state of a Cleaner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanerSpec {
    pub resource_policy_set: ResourcePolicySet,

    #[serde(default)]
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    /// Cron schedule
    #[serde(default)]
    pub schedule: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_resource_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerMetadata {
    pub name: String,
}

/// A Cleaner manifest as stored in the cluster or on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cleaner {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: CleanerMetadata,
    pub spec: CleanerSpec,
}

impl Cleaner {
    /// Load a Cleaner manifest from a YAML (or JSON) file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cleaner manifest: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse cleaner manifest: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let cleaner: Cleaner = serde_yaml::from_str(content)?;
        Ok(cleaner)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Decode listed Cleaner objects, skipping the ones that do not decode
    pub fn decode_all(items: Vec<Value>) -> Vec<Self> {
        items
            .into_iter()
            .filter_map(|item| {
                let name = item
                    .pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match serde_json::from_value::<Cleaner>(item) {
                    Ok(cleaner) => Some(cleaner),
                    Err(e) => {
                        warn!(cleaner = %name, error = %e, "Undecodable cleaner, skipping");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Validated, immutable set of selectors one task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    selectors: Vec<ResourceSelector>,
    aggregated_selection: Option<String>,
    action: Action,
}

impl Policy {
    pub fn new(
        selectors: Vec<ResourceSelector>,
        aggregated_selection: Option<String>,
    ) -> Result<Self, PolicyError> {
        if selectors.is_empty() {
            return Err(PolicyError::NoSelectors);
        }
        for (index, selector) in selectors.iter().enumerate() {
            if selector.kind.trim().is_empty() {
                return Err(PolicyError::EmptyField { index, field: "kind" });
            }
            if selector.version.trim().is_empty() {
                return Err(PolicyError::EmptyField {
                    index,
                    field: "version",
                });
            }
        }

        Ok(Self {
            selectors,
            aggregated_selection: aggregated_selection.filter(|s| !s.trim().is_empty()),
            action: Action::default(),
        })
    }

    pub fn from_spec(spec: &CleanerSpec) -> Result<Self, PolicyError> {
        let set = &spec.resource_policy_set;
        let mut policy = Self::new(
            set.resource_selectors.clone(),
            set.aggregated_selection.clone(),
        )?;
        policy.action = spec.action;
        Ok(policy)
    }

    pub fn selectors(&self) -> &[ResourceSelector] {
        &self.selectors
    }

    pub fn aggregated_selection(&self) -> Option<&str> {
        self.aggregated_selection.as_deref()
    }

    pub fn action(&self) -> Action {
        self.action
    }
}

/// One cluster object fetched before predicate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Full object content
    pub object: Arc<Value>,
}

impl Candidate {
    /// Build a candidate from listed object content
    ///
    /// List responses omit `apiVersion`/`kind` per item, so both are injected
    /// into the object before it is exposed to predicate scripts.
    pub fn from_object(api_version: &str, kind: &str, mut object: Value) -> Self {
        if let Value::Object(ref mut map) = object {
            map.insert(
                "apiVersion".to_string(),
                Value::String(api_version.to_string()),
            );
            map.insert("kind".to_string(), Value::String(kind.to_string()));
        }

        let metadata = object.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(String::from);

        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace,
            name,
            object: Arc::new(object),
        }
    }

    /// Human-readable identity, e.g. `ConfigMap ns-a/tmp-1`
    pub fn identity(&self) -> String {
        self.to_string()
    }

    /// Identity key of arbitrary object content (as returned by scripts)
    pub(crate) fn key_of(object: &Value) -> Option<(String, Option<String>, String)> {
        let kind = object.get("kind")?.as_str()?.to_string();
        let metadata = object.get("metadata")?;
        let name = metadata.get("name")?.as_str()?.to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(String::from);
        Some((kind, namespace, name))
    }

    pub(crate) fn key(&self) -> (String, Option<String>, String) {
        (self.kind.clone(), self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Verdict of a selector predicate on one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub candidate: Candidate,
    pub matched: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MANIFEST: &str = r#"
apiVersion: cleany.wys1203.com/v1alpha1
kind: Cleaner
metadata:
  name: stale-configmaps
spec:
  schedule: "*/5 * * * *"
  action: Scan
  resourcePolicySet:
    resourceSelectors:
      - namespace: ns-a
        group: ""
        version: v1
        kind: ConfigMap
        labelFilters:
          - key: app
            operation: Equal
            value: demo
          - key: tier
            operation: Different
            value: prod
        evaluate: |
          function evaluate()
            return { matching = true }
          end
"#;

    fn selector(kind: &str, version: &str) -> ResourceSelector {
        ResourceSelector {
            kind: kind.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_manifest() {
        let cleaner = Cleaner::from_yaml(MANIFEST).unwrap();
        assert_eq!(cleaner.name(), "stale-configmaps");
        assert_eq!(cleaner.spec.action, Action::Scan);

        let selectors = &cleaner.spec.resource_policy_set.resource_selectors;
        assert_eq!(selectors.len(), 1);
        assert_eq!(selectors[0].namespace.as_deref(), Some("ns-a"));
        assert_eq!(selectors[0].group, "");
        assert_eq!(selectors[0].label_filters.len(), 2);
        assert_eq!(selectors[0].label_filters[1].operation, Operation::Different);
        assert!(selectors[0].script().is_some());
    }

    #[test]
    fn test_action_defaults_to_delete() {
        let spec: CleanerSpec = serde_json::from_value(json!({
            "resourcePolicySet": {
                "resourceSelectors": [{"version": "v1", "kind": "Pod"}]
            },
            "schedule": "@hourly"
        }))
        .unwrap();
        assert_eq!(spec.action, Action::Delete);
        assert!(spec.resource_policy_set.aggregated_selection.is_none());
    }

    #[test]
    fn test_decode_all_skips_undecodable_cleaners() {
        let cleaners = Cleaner::decode_all(vec![
            json!({
                "metadata": {"name": "good"},
                "spec": {"resourcePolicySet": {"resourceSelectors": [{"version": "v1", "kind": "Pod"}]}}
            }),
            json!({
                "metadata": {"name": "bad"},
                "spec": {"resourcePolicySet": {"resourceSelectors": "not-a-list"}}
            }),
        ]);
        assert_eq!(cleaners.len(), 1);
        assert_eq!(cleaners[0].name(), "good");
    }

    #[test]
    fn test_policy_requires_selector() {
        assert_eq!(Policy::new(vec![], None), Err(PolicyError::NoSelectors));
    }

    #[test]
    fn test_policy_rejects_empty_kind_and_version() {
        let err = Policy::new(vec![selector("Pod", "v1"), selector("", "v1")], None).unwrap_err();
        assert_eq!(err, PolicyError::EmptyField { index: 1, field: "kind" });

        let err = Policy::new(vec![selector("Pod", " ")], None).unwrap_err();
        assert_eq!(
            err,
            PolicyError::EmptyField {
                index: 0,
                field: "version"
            }
        );
    }

    #[test]
    fn test_policy_from_spec_keeps_action() {
        let cleaner = Cleaner::from_yaml(MANIFEST).unwrap();
        let policy = Policy::from_spec(&cleaner.spec).unwrap();
        assert_eq!(policy.action(), Action::Scan);
        assert_eq!(policy.selectors().len(), 1);
    }

    #[test]
    fn test_blank_scripts_are_absent() {
        let mut sel = selector("Pod", "v1");
        sel.evaluate = Some("   \n".to_string());
        assert!(sel.script().is_none());

        let policy = Policy::new(vec![sel], Some(String::new())).unwrap();
        assert!(policy.aggregated_selection().is_none());
    }

    #[test]
    fn test_candidate_from_object_injects_type() {
        let candidate = Candidate::from_object(
            "v1",
            "ConfigMap",
            json!({"metadata": {"name": "tmp-1", "namespace": "ns-a"}}),
        );
        assert_eq!(candidate.name, "tmp-1");
        assert_eq!(candidate.namespace.as_deref(), Some("ns-a"));
        assert_eq!(candidate.object["kind"], "ConfigMap");
        assert_eq!(candidate.object["apiVersion"], "v1");
        assert_eq!(candidate.identity(), "ConfigMap ns-a/tmp-1");
    }

    #[test]
    fn test_cluster_scoped_identity() {
        let candidate =
            Candidate::from_object("v1", "Namespace", json!({"metadata": {"name": "ns-a"}}));
        assert!(candidate.namespace.is_none());
        assert_eq!(candidate.identity(), "Namespace ns-a");
        assert_eq!(
            Candidate::key_of(&candidate.object),
            Some(candidate.key())
        );
    }
}
