mod client;
pub mod discovery;
#[cfg(test)]
pub(crate) mod fake;
pub mod label_selectors;

pub use client::KubeCluster;
pub use discovery::{ResourceInfo, ResourceRegistry};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::policy::Candidate;

/// Parameters to push down to the Kubernetes API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiFilters {
    /// Label selector string (e.g., "app=nginx,version!=v1")
    pub label_selector: Option<String>,
}

/// A namespace that is not being deleted, with its labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Cluster operations the selection pipeline depends on
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Build the REST-mapping registry from the discovery document
    async fn discover(&self) -> Result<ResourceRegistry>;

    /// List namespaces, skipping those marked for deletion
    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>>;

    /// List objects of one resource type, scoped to `namespace` when given
    async fn list(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        filters: &ApiFilters,
    ) -> Result<Vec<Candidate>>;
}
