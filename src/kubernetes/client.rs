// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ApiResource, DynamicObject, ListParams, ObjectList};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use super::discovery::{self, ResourceInfo, ResourceRegistry};
use super::{ApiFilters, ClusterApi, NamespaceInfo};
use crate::policy::{CLEANER_GROUP, CLEANER_KIND, CLEANER_VERSION, Candidate, Cleaner};

/// How long to reuse a discovery document before fetching it again
const REGISTRY_TTL: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for connecting to K8s API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reading K8s API responses
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for paginated list requests
/// Smaller pages reduce memory pressure and allow faster initial response
const PAGE_SIZE: u32 = 500;

/// Cached registry with timestamp
struct CachedRegistry {
    registry: ResourceRegistry,
    discovered_at: Instant,
}

impl CachedRegistry {
    fn new(registry: ResourceRegistry) -> Self {
        Self {
            registry,
            discovered_at: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.discovered_at.elapsed() > REGISTRY_TTL
    }
}

/// [`ClusterApi`] backed by a live Kubernetes API server
pub struct KubeCluster {
    client: Client,
    registry: RwLock<Option<CachedRegistry>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registry: RwLock::new(None),
        }
    }

    /// Connect using a kubeconfig context, or in-cluster/default inference when `None`
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let mut config = match context {
            Some(context) => {
                let kubeconfig = Kubeconfig::read().context("Failed to read kubeconfig")?;
                if !kubeconfig.contexts.iter().any(|c| c.name == context) {
                    return Err(anyhow!("Context '{}' not found in kubeconfig", context));
                }
                Config::from_custom_kubeconfig(
                    kubeconfig,
                    &KubeConfigOptions {
                        context: Some(context.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("Failed to load kubeconfig for context '{}'", context))?
            }
            None => Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?,
        };

        // Set timeouts for reliability
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        info!(cluster = %cluster_url, "Connected to Kubernetes API");

        Ok(Self::new(client))
    }

    /// List Cleaner objects defined in the cluster
    pub async fn list_cleaners(&self) -> Result<Vec<Cleaner>> {
        let ar = ApiResource {
            group: CLEANER_GROUP.to_string(),
            version: CLEANER_VERSION.to_string(),
            api_version: format!("{}/{}", CLEANER_GROUP, CLEANER_VERSION),
            kind: CLEANER_KIND.to_string(),
            plural: "cleaners".to_string(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let items = self
            .list_all_pages(&api, &ListParams::default(), &ar.plural)
            .await
            .context("Failed to list Cleaner objects")?;

        let values = items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to encode Cleaner objects")?;
        Ok(Cleaner::decode_all(values))
    }

    /// List resources with pagination
    /// Uses continue tokens to fetch all pages
    async fn list_all_pages(
        &self,
        api: &Api<DynamicObject>,
        base_params: &ListParams,
        plural: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut all_items: Vec<DynamicObject> = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut page_count = 0u32;

        loop {
            let mut params = base_params.clone().limit(PAGE_SIZE);
            if let Some(ref token) = continue_token {
                params = params.continue_token(token);
            }

            let list: ObjectList<DynamicObject> = api
                .list(&params)
                .await
                .with_context(|| format!("K8s API error listing {}", plural))?;

            let items_count = list.items.len();
            all_items.extend(list.items);
            page_count += 1;

            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    debug!(
                        resource = %plural,
                        page = page_count,
                        items_this_page = items_count,
                        total_so_far = all_items.len(),
                        "Fetched page, continuing"
                    );
                    continue_token = Some(token);
                }
                _ => break,
            }
        }

        Ok(all_items)
    }

    /// Build ListParams from API filters
    fn build_list_params(filters: &ApiFilters) -> ListParams {
        let mut params = ListParams::default();

        if let Some(ref label_sel) = filters.label_selector {
            params = params.labels(label_sel);
        }

        trace!(label_selector = ?filters.label_selector, "Built ListParams");

        params
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn discover(&self) -> Result<ResourceRegistry> {
        {
            let cached = self.registry.read().await;
            if let Some(cached) = cached.as_ref()
                && !cached.is_expired()
            {
                return Ok(cached.registry.clone());
            }
        }

        let start = Instant::now();
        let mut registry = discovery::build_core_registry();
        let discovered = discovery::discover_resources(&self.client)
            .await
            .context("Failed to run API discovery")?;
        if discovered.is_empty() {
            warn!("API discovery returned no resources, using built-in types only");
        }
        registry.merge(discovered);

        debug!(
            resources = registry.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Discovery complete"
        );

        *self.registry.write().await = Some(CachedRegistry::new(registry.clone()));
        Ok(registry)
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list namespaces")?;

        Ok(list
            .items
            .into_iter()
            .filter(|ns| ns.metadata.deletion_timestamp.is_none())
            .map(|ns| NamespaceInfo {
                name: ns.metadata.name.unwrap_or_default(),
                labels: ns.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn list(
        &self,
        resource: &ResourceInfo,
        namespace: Option<&str>,
        filters: &ApiFilters,
    ) -> Result<Vec<Candidate>> {
        let ar = &resource.api_resource;
        let (api, scope): (Api<DynamicObject>, &str) = match namespace {
            Some(ns) if resource.is_namespaced() => (
                Api::namespaced_with(self.client.clone(), ns, ar),
                "namespaced",
            ),
            _ => (Api::all_with(self.client.clone(), ar), "cluster-wide"),
        };

        debug!(
            group = %resource.group,
            version = %resource.version,
            kind = %ar.kind,
            namespace = ?namespace,
            scope = %scope,
            "Fetching K8s resource"
        );

        let params = Self::build_list_params(filters);
        let items = self.list_all_pages(&api, &params, &ar.plural).await?;

        let api_version = resource.api_version();
        items
            .into_iter()
            .map(|item| {
                let value = serde_json::to_value(item)
                    .with_context(|| format!("Failed to encode {} object", ar.kind))?;
                Ok(Candidate::from_object(&api_version, &ar.kind, value))
            })
            .collect()
    }
}
