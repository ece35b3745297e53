use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::{Discovery, Scope};
use kube::{Api, Client, Config};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::model::{ContextCatalogRow, ListOptions, NamespaceScope, ResourceKind, ViewQuery};

const LOG_TAIL_LINES: i64 = 500;

/// Resolved API coordinates of one kind.
#[derive(Debug, Clone)]
pub struct KindInfo {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// One listing, with the version a watch should resume from.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<Value>,
    pub resource_version: Option<String>,
}

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    context: String,
    cluster: String,
    user: String,
    default_namespace: String,
    kube_targets: Vec<KubeTarget>,
    kinds: Arc<RwLock<HashMap<String, KindInfo>>>,
}

#[derive(Debug, Clone)]
struct KubeTarget {
    context: String,
    cluster_name: String,
    user_name: Option<String>,
    namespace: Option<String>,
}

impl KubeGateway {
    pub async fn new(context: Option<String>) -> Result<Self> {
        Self::from_kube_selection(context).await
    }

    pub fn available_contexts(&self) -> Vec<String> {
        let mut contexts = self
            .kube_targets
            .iter()
            .map(|target| target.context.clone())
            .collect::<Vec<_>>();
        contexts.sort();
        contexts.dedup();
        contexts
    }

    pub fn context_catalog(&self) -> Vec<ContextCatalogRow> {
        self.kube_targets
            .iter()
            .map(|target| ContextCatalogRow {
                context: target.context.clone(),
                cluster: target.cluster_name.clone(),
                auth_info: target.user_name.clone().unwrap_or_else(|| "-".to_string()),
                namespace: target
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.default_namespace.clone()),
            })
            .collect()
    }

    /// Rebuilds the client for `context`. The kind cache starts over since
    /// another cluster may serve other kinds.
    pub async fn switch_context(&mut self, context: &str) -> Result<()> {
        if !self.kube_targets.is_empty()
            && !self.kube_targets.iter().any(|target| target.context == context)
        {
            anyhow::bail!("Context '{context}' was not found in kubeconfig");
        }
        let switched = Self::from_kube_selection(Some(context.to_string())).await?;
        *self = switched;
        Ok(())
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    async fn from_kube_selection(context: Option<String>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().ok();

        let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
            let options = KubeConfigOptions {
                context: context.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig_value, &options)
                .await
                .context("failed to infer Kubernetes configuration")?
        } else {
            if context.is_some() {
                anyhow::bail!(
                    "kubeconfig not found; context switching is unavailable in this environment"
                );
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let cluster_url = config.cluster_url.to_string();
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

        let kube_targets = kubeconfig
            .as_ref()
            .map(build_kube_targets)
            .unwrap_or_default();
        let active_context = context
            .or_else(|| {
                kubeconfig
                    .as_ref()
                    .and_then(|cfg| cfg.current_context.clone())
            })
            .unwrap_or_else(|| "in-cluster".to_string());
        let active_user = kube_targets
            .iter()
            .find(|target| target.context == active_context)
            .and_then(|target| target.user_name.clone())
            .unwrap_or_else(|| "-".to_string());

        Ok(Self {
            client,
            context: active_context,
            cluster: cluster_url,
            user: active_user,
            default_namespace,
            kube_targets,
            kinds: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Runs API discovery and fills the kind cache. Returns the resource
    /// names, sorted.
    pub async fn discover_kinds(&self) -> Result<Vec<String>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context("API discovery failed")?;

        let mut discovered = HashMap::new();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                let info = KindInfo {
                    namespaced: caps.scope == Scope::Namespaced,
                    resource,
                };
                let grouped = ResourceKind::new(&info.resource.plural)
                    .with_group(&info.resource.group)
                    .cache_key();
                let plain_taken = discovered
                    .get(&info.resource.plural)
                    .is_some_and(|existing: &KindInfo| existing.resource.group.is_empty());
                if !plain_taken {
                    discovered.insert(info.resource.plural.clone(), info.clone());
                }
                discovered.insert(grouped, info);
            }
        }

        let mut names = discovered
            .keys()
            .filter(|key| !key.contains('.'))
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        info!("discovered {} resource kinds", names.len());

        if let Ok(mut cache) = self.kinds.write() {
            cache.extend(discovered);
        }
        Ok(names)
    }

    /// Cached lookup; discovery runs once on the first miss.
    pub async fn kind_info(&self, kind: &ResourceKind) -> Result<KindInfo> {
        if let Some(info) = self.cached_kind(&kind.cache_key()) {
            return Ok(info);
        }

        let unversioned = ResourceKind {
            version: None,
            ..kind.clone()
        }
        .cache_key();
        let base = match self.cached_kind(&unversioned) {
            Some(info) => info,
            None => {
                self.discover_kinds().await?;
                self.cached_kind(&unversioned)
                    .with_context(|| format!("unknown resource kind '{kind}'"))?
            }
        };

        let info = match &kind.version {
            Some(version) if *version != base.resource.version => {
                let mut resource = base.resource.clone();
                resource.api_version = if resource.group.is_empty() {
                    version.clone()
                } else {
                    format!("{}/{version}", resource.group)
                };
                resource.version = version.clone();
                KindInfo {
                    resource,
                    namespaced: base.namespaced,
                }
            }
            _ => base,
        };

        debug!("resolved {kind} to {}", info.resource.api_version);
        if let Ok(mut cache) = self.kinds.write() {
            cache.insert(kind.cache_key(), info.clone());
        }
        Ok(info)
    }

    fn cached_kind(&self, key: &str) -> Option<KindInfo> {
        self.kinds
            .read()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }

    pub async fn is_namespaced(&self, kind: &ResourceKind) -> Result<bool> {
        if kind.is(ResourceKind::CONTAINERS) {
            return Ok(true);
        }
        if kind.is(ResourceKind::CONTEXTS) {
            return Ok(false);
        }
        Ok(self.kind_info(kind).await?.namespaced)
    }

    pub fn dynamic_api(&self, info: &KindInfo, scope: &NamespaceScope) -> Api<DynamicObject> {
        match scope.namespace() {
            Some(namespace) if info.namespaced => {
                Api::namespaced_with(self.client.clone(), namespace, &info.resource)
            }
            _ => Api::all_with(self.client.clone(), &info.resource),
        }
    }

    /// One-shot listing of `query`. Containers are derived from their pod.
    pub async fn list(&self, query: &ViewQuery) -> Result<Listing> {
        if query.kind.is(ResourceKind::CONTAINERS) {
            let namespace = query
                .scope
                .namespace()
                .context("containers are listed within one namespace")?;
            let pod = query.owning_pod().context("containers need an owning pod")?;
            let raw = self.get(&ResourceKind::pods(), Some(namespace), pod).await?;
            return Ok(Listing {
                items: container_objects(&raw),
                resource_version: raw
                    .pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        let info = self.kind_info(&query.kind).await?;
        let api = self.dynamic_api(&info, &query.scope);
        let list = api
            .list(&list_params(&query.options))
            .await
            .with_context(|| format!("failed to list {}", query.kind))?;

        let items = list
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to convert listed objects")?;
        Ok(Listing {
            items,
            resource_version: list.metadata.resource_version,
        })
    }

    pub async fn get(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value> {
        let info = self.kind_info(kind).await?;
        let scope = namespace
            .map(|namespace| NamespaceScope::Named(namespace.to_string()))
            .unwrap_or(NamespaceScope::All);
        let object = self
            .dynamic_api(&info, &scope)
            .get(name)
            .await
            .with_context(|| format!("failed to get {kind} {name}"))?;
        serde_json::to_value(&object).context("failed to convert object")
    }

    /// YAML of one object; containers render their merged spec and status.
    pub async fn describe(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
        owning_pod: Option<&str>,
    ) -> Result<String> {
        if kind.is(ResourceKind::CONTAINERS) {
            let pod = owning_pod.context("containers need an owning pod")?;
            let raw = self.get(&ResourceKind::pods(), namespace, pod).await?;
            let container = container_objects(&raw)
                .into_iter()
                .find(|container| {
                    container.pointer("/metadata/name").and_then(Value::as_str) == Some(name)
                })
                .with_context(|| format!("container {name} not found in pod {pod}"))?;
            return Ok(yaml_detail(&container));
        }
        let raw = self.get(kind, namespace, name).await?;
        Ok(yaml_detail(&raw))
    }

    pub async fn pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
    ) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: container.map(str::to_string),
            tail_lines: Some(LOG_TAIL_LINES),
            timestamps: true,
            ..LogParams::default()
        };

        let logs = pods
            .logs(pod_name, &params)
            .await
            .with_context(|| format!("failed to load logs for {namespace}/{pod_name}"))?;

        Ok(logs)
    }

    pub async fn pod_container_names(&self, namespace: &str, pod_name: &str) -> Result<Vec<String>> {
        let raw = self
            .get(&ResourceKind::pods(), Some(namespace), pod_name)
            .await?;
        Ok(container_objects(&raw)
            .iter()
            .filter_map(|container| container.pointer("/metadata/name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

pub fn list_params(options: &ListOptions) -> ListParams {
    let mut params = ListParams::default();
    if let Some(fields) = &options.field_selector {
        params = params.fields(fields);
    }
    if let Some(labels) = &options.label_selector {
        params = params.labels(labels);
    }
    params
}

pub fn watch_params(options: &ListOptions) -> WatchParams {
    let mut params = WatchParams::default();
    if let Some(fields) = &options.field_selector {
        params = params.fields(fields);
    }
    if let Some(labels) = &options.label_selector {
        params = params.labels(labels);
    }
    params
}

/// One object per container of `pod`: its spec entry and matching status
/// under `spec`/`status`, named after the container.
pub fn container_objects(pod: &Value) -> Vec<Value> {
    let namespace = pod
        .pointer("/metadata/namespace")
        .cloned()
        .unwrap_or(Value::Null);
    let statuses = pod
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    pod.pointer("/spec/containers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
        .iter()
        .filter_map(|spec| {
            let name = spec.get("name")?.as_str()?;
            let status = statuses
                .iter()
                .find(|status| status.get("name").and_then(Value::as_str) == Some(name))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            Some(json!({
                "kind": "Container",
                "metadata": {"name": name, "namespace": namespace},
                "spec": spec,
                "status": status,
            }))
        })
        .collect()
}

fn build_kube_targets(kubeconfig: &Kubeconfig) -> Vec<KubeTarget> {
    let mut targets = kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let context = named.context.as_ref()?;
            Some(KubeTarget {
                context: named.name.clone(),
                cluster_name: context.cluster.clone(),
                user_name: context.user.clone(),
                namespace: context.namespace.clone(),
            })
        })
        .collect::<Vec<_>>();

    targets.sort_by(|left, right| {
        left.context
            .cmp(&right.context)
            .then_with(|| left.cluster_name.cmp(&right.cluster_name))
    });
    targets
}

pub fn yaml_detail<T>(value: &T) -> String
where
    T: Serialize,
{
    serde_yaml::to_string(value).unwrap_or_else(|error| format!("failed to format detail: {error}"))
}

pub fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}
