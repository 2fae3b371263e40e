//! In-memory cluster used by pipeline and scheduler tests

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::discovery::{ResourceInfo, ResourceRegistry, build_core_registry};
use super::label_selectors::LabelSelector;
use super::{ApiFilters, ClusterApi, NamespaceInfo};
use crate::policy::Candidate;

#[derive(Default)]
pub struct FakeCluster {
    objects: Vec<Candidate>,
    namespaces: Vec<NamespaceInfo>,
    failing_kinds: HashSet<String>,
    hanging_kinds: HashSet<String>,
    namespaces_forbidden: bool,
    list_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, name: &str, labels: &[(&str, &str)]) -> Self {
        self.namespaces.push(NamespaceInfo {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self
    }

    pub fn with_object(
        mut self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Self {
        let labels: BTreeMap<_, _> = labels.iter().copied().collect();
        let mut metadata = json!({ "name": name, "labels": labels });
        if let Some(ns) = namespace {
            metadata["namespace"] = Value::String(ns.to_string());
        }
        self.objects.push(Candidate::from_object(
            api_version,
            kind,
            json!({ "metadata": metadata }),
        ));
        self
    }

    pub fn with_configmap(self, namespace: &str, name: &str) -> Self {
        self.with_object("v1", "ConfigMap", Some(namespace), name, &[])
    }

    /// List calls for `kind` fail
    pub fn failing(mut self, kind: &str) -> Self {
        self.failing_kinds.insert(kind.to_string());
        self
    }

    /// List calls for `kind` never return
    pub fn hanging(mut self, kind: &str) -> Self {
        self.hanging_kinds.insert(kind.to_string());
        self
    }

    /// Namespace listing fails
    pub fn namespaces_forbidden(mut self) -> Self {
        self.namespaces_forbidden = true;
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn discover(&self) -> Result<ResourceRegistry> {
        Ok(build_core_registry())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        if self.namespaces_forbidden {
            bail!("namespaces is forbidden");
        }
        Ok(self.namespaces.clone())
    }

    async fn list(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        filters: &ApiFilters,
    ) -> Result<Vec<Candidate>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if self.hanging_kinds.contains(resource.kind()) {
            std::future::pending::<()>().await;
        }
        if self.failing_kinds.contains(resource.kind()) {
            bail!("{} is forbidden", resource.plural());
        }

        let selector: LabelSelector = filters.label_selector.as_deref().unwrap_or("").parse()?;
        Ok(self
            .objects
            .iter()
            .filter(|c| c.kind == resource.kind())
            .filter(|c| namespace.is_none() || c.namespace.as_deref() == namespace)
            .filter(|c| selector.matches(&labels_of(&c.object)))
            .cloned()
            .collect())
    }
}
