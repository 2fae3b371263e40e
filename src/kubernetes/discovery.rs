// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Resource discovery for Kubernetes clusters.
//!
//! Maps (group, version, kind) triples to the listable resource the API
//! server exposes. Built-in types are seeded from k8s-openapi metadata and the
//! live discovery document (including CRDs) is merged on top.

use anyhow::Result;
use kube::Client;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use std::collections::HashMap;

/// Information about a discovered Kubernetes resource
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// The API resource definition
    pub api_resource: ApiResource,
    /// API capabilities (verbs, scope, etc.)
    pub capabilities: ApiCapabilities,
    /// API group (empty string for core v1)
    pub group: String,
    /// API version
    pub version: String,
}

impl ResourceInfo {
    /// Check if this resource is namespace-scoped
    pub fn is_namespaced(&self) -> bool {
        self.capabilities.scope == Scope::Namespaced
    }

    /// Get the full API group/version string
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn kind(&self) -> &str {
        &self.api_resource.kind
    }

    /// Plural resource name used in API paths (e.g., "configmaps")
    pub fn plural(&self) -> &str {
        &self.api_resource.plural
    }
}

/// Registry key: group, version and lowercase kind
type MappingKey = (String, String, String);

fn mapping_key(group: &str, version: &str, kind: &str) -> MappingKey {
    (group.to_string(), version.to_string(), kind.to_lowercase())
}

/// REST-mapping table for one cluster
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    by_gvk: HashMap<MappingKey, ResourceInfo>,
}

impl ResourceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource to the registry, replacing any previous mapping
    pub fn add(&mut self, info: ResourceInfo) {
        let key = mapping_key(&info.group, &info.version, &info.api_resource.kind);
        self.by_gvk.insert(key, info);
    }

    /// Map a (group, version, kind) triple to its listable resource
    ///
    /// Kind matching is case-insensitive. `None` means the cluster does not
    /// serve this type.
    pub fn resolve(&self, group: &str, version: &str, kind: &str) -> Option<&ResourceInfo> {
        self.by_gvk.get(&mapping_key(group, version, kind))
    }

    pub fn len(&self) -> usize {
        self.by_gvk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gvk.is_empty()
    }

    /// Merge another registry into this one
    pub fn merge(&mut self, other: ResourceRegistry) {
        self.by_gvk.extend(other.by_gvk);
    }
}

/// Build a registry with just core resources using k8s-openapi types (no discovery)
///
/// This uses compile-time type information from k8s-openapi, so it automatically
/// stays in sync with the Kubernetes API version we're building against.
pub fn build_core_registry() -> ResourceRegistry {
    use k8s_openapi::api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        autoscaling::v2::HorizontalPodAutoscaler,
        batch::v1::{CronJob, Job},
        core::v1::{
            ConfigMap, Event, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod,
            Secret, Service, ServiceAccount,
        },
        networking::v1::{Ingress, NetworkPolicy},
        policy::v1::PodDisruptionBudget,
        rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
        storage::v1::StorageClass,
    };
    use kube::Resource;

    let mut registry = ResourceRegistry::new();

    // The Resource trait's Scope is an associated type, so scope is spelled out
    macro_rules! add_resource {
        ($type:ty, namespaced) => {{
            add_resource!(@inner $type, Scope::Namespaced)
        }};
        ($type:ty, cluster) => {{
            add_resource!(@inner $type, Scope::Cluster)
        }};
        (@inner $type:ty, $scope:expr) => {{
            let ar = ApiResource {
                group: <$type>::group(&()).to_string(),
                version: <$type>::version(&()).to_string(),
                api_version: <$type>::api_version(&()).to_string(),
                kind: <$type>::kind(&()).to_string(),
                plural: <$type>::plural(&()).to_string(),
            };
            let caps = ApiCapabilities {
                scope: $scope,
                subresources: vec![],
                operations: vec![],
            };
            registry.add(ResourceInfo {
                group: ar.group.clone(),
                version: ar.version.clone(),
                api_resource: ar,
                capabilities: caps,
            });
        }};
    }

    // Core API (v1)
    add_resource!(Pod, namespaced);
    add_resource!(Service, namespaced);
    add_resource!(ConfigMap, namespaced);
    add_resource!(Secret, namespaced);
    add_resource!(Event, namespaced);
    add_resource!(ServiceAccount, namespaced);
    add_resource!(PersistentVolumeClaim, namespaced);
    add_resource!(Node, cluster);
    add_resource!(Namespace, cluster);
    add_resource!(PersistentVolume, cluster);

    // Apps API (apps/v1)
    add_resource!(Deployment, namespaced);
    add_resource!(StatefulSet, namespaced);
    add_resource!(DaemonSet, namespaced);
    add_resource!(ReplicaSet, namespaced);

    // Batch API (batch/v1)
    add_resource!(Job, namespaced);
    add_resource!(CronJob, namespaced);

    add_resource!(Ingress, namespaced);
    add_resource!(NetworkPolicy, namespaced);
    add_resource!(HorizontalPodAutoscaler, namespaced);
    add_resource!(PodDisruptionBudget, namespaced);
    add_resource!(StorageClass, cluster);

    // RBAC API (rbac.authorization.k8s.io/v1)
    add_resource!(Role, namespaced);
    add_resource!(RoleBinding, namespaced);
    add_resource!(ClusterRole, cluster);
    add_resource!(ClusterRoleBinding, cluster);

    registry
}

/// Discover all resources served by a cluster (including CRDs), in every served version
pub async fn discover_resources(client: &Client) -> Result<ResourceRegistry> {
    let mut registry = ResourceRegistry::new();

    let discovery = Discovery::new(client.clone()).run().await?;

    for group in discovery.groups() {
        for version in group.versions() {
            for (ar, caps) in group.versioned_resources(version) {
                // Skip subresources (e.g., pods/log, pods/exec)
                if ar.plural.contains('/') {
                    continue;
                }
                registry.add(ResourceInfo {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    api_resource: ar,
                    capabilities: caps,
                });
            }
        }
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_registry_resolves_configmap() {
        let registry = build_core_registry();
        let info = registry.resolve("", "v1", "ConfigMap").unwrap();
        assert_eq!(info.plural(), "configmaps");
        assert_eq!(info.api_version(), "v1");
        assert!(info.is_namespaced());
    }

    #[test]
    fn test_resolve_is_case_insensitive_on_kind() {
        let registry = build_core_registry();
        assert!(registry.resolve("apps", "v1", "deployment").is_some());
        assert!(registry.resolve("apps", "v1", "DEPLOYMENT").is_some());
    }

    #[test]
    fn test_resolve_miss() {
        let registry = build_core_registry();
        assert!(registry.resolve("apps", "v1beta1", "Deployment").is_none());
        assert!(registry.resolve("example.com", "v1", "Widget").is_none());
        assert!(registry.resolve("apps", "v1", "ConfigMap").is_none());
    }

    #[test]
    fn test_cluster_scoped_resources() {
        let registry = build_core_registry();
        let ns = registry.resolve("", "v1", "Namespace").unwrap();
        assert!(!ns.is_namespaced());
        let crb = registry
            .resolve("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding")
            .unwrap();
        assert_eq!(crb.api_version(), "rbac.authorization.k8s.io/v1");
    }

    #[test]
    fn test_merge_adds_custom_resources() {
        let mut registry = build_core_registry();
        let before = registry.len();

        let mut custom = ResourceRegistry::new();
        let ar = ApiResource {
            group: "example.com".to_string(),
            version: "v1".to_string(),
            api_version: "example.com/v1".to_string(),
            kind: "Widget".to_string(),
            plural: "widgets".to_string(),
        };
        custom.add(ResourceInfo {
            group: ar.group.clone(),
            version: ar.version.clone(),
            api_resource: ar,
            capabilities: ApiCapabilities {
                scope: Scope::Namespaced,
                subresources: vec![],
                operations: vec![],
            },
        });

        registry.merge(custom);
        assert_eq!(registry.len(), before + 1);
        assert_eq!(
            registry.resolve("example.com", "v1", "widget").unwrap().plural(),
            "widgets"
        );
    }
}
