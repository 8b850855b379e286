//! kube-rs implementation of [`ClusterClientTrait`]

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{MachineConfigPoolState, PodSelector};
use crds::{NetworkNodeState, NetworkNodeStateStatus};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, EvictParams, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Attempts for one annotation read-modify-write before giving up on conflicts
const CONFLICT_RETRIES: usize = 5;

const MCO_GROUP: &str = "machineconfiguration.openshift.io";
const MCO_DESIRED_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredConfig";

/// Cluster client backed by a kube-rs [`Client`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wraps an existing client. `namespace` is where NetworkNodeStates live.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Builds a client from in-cluster config or the local kubeconfig
    pub async fn try_default(namespace: &str) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    /// The underlying kube client, for watchers
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn node_states(&self) -> Api<NetworkNodeState> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn machine_config_api(&self, kind: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(MCO_GROUP, "v1", kind);
        let resource = ApiResource::from_gvk(&gvk);
        Api::all_with(self.client.clone(), &resource)
    }
}

/// Applies the annotation change to `meta`. Returns false when nothing changed.
pub(crate) fn apply_annotation(meta: &mut ObjectMeta, key: &str, value: Option<&str>) -> bool {
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    match value {
        Some(v) => {
            if annotations.get(key).map(String::as_str) == Some(v) {
                return false;
            }
            annotations.insert(key.to_string(), v.to_string());
            true
        }
        None => annotations.remove(key).is_some(),
    }
}

/// Read-modify-write of one annotation guarded by `resourceVersion`.
///
/// A 409 means someone else wrote the object between our get and replace;
/// re-read and re-apply rather than overwrite their change.
async fn update_annotation<K>(
    api: &Api<K>,
    name: &str,
    key: &str,
    value: Option<&str>,
) -> Result<K, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    for attempt in 1..=CONFLICT_RETRIES {
        let mut obj = api.get(name).await?;
        if !apply_annotation(obj.meta_mut(), key, value) {
            return Ok(obj);
        }

        match api.replace(name, &PostParams::default(), &obj).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    "Conflict writing annotation {} on {} (attempt {}/{}), re-reading",
                    key, name, attempt, CONFLICT_RETRIES
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ClusterError::Conflict(format!(
        "annotation {key} on {name} still conflicting after {CONFLICT_RETRIES} attempts"
    )))
}

fn condition_is_true(pool: &DynamicObject, condition_type: &str) -> bool {
    pool.data["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions.iter().any(|c| {
                c["type"].as_str() == Some(condition_type) && c["status"].as_str() == Some("True")
            })
        })
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn get_node_state(&self, name: &str) -> Result<NetworkNodeState, ClusterError> {
        Ok(self.node_states().get(name).await?)
    }

    async fn update_node_state_status(
        &self,
        name: &str,
        status: &NetworkNodeStateStatus,
    ) -> Result<NetworkNodeState, ClusterError> {
        // Merge patch: absent optionals must be sent as null to clear them
        let mut value = serde_json::to_value(status)?;
        if let Some(fields) = value.as_object_mut() {
            for key in ["syncStatus", "lastSyncError", "lastSyncTime"] {
                fields.entry(key).or_insert(serde_json::Value::Null);
            }
        }
        let patch = serde_json::json!({ "status": value });

        Ok(self
            .node_states()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn set_node_state_annotation(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<NetworkNodeState, ClusterError> {
        update_annotation(&self.node_states(), name, key, value).await
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        Ok(self.nodes().get(name).await?)
    }

    async fn set_node_annotation(&self, name: &str, key: &str, value: Option<&str>) -> Result<(), ClusterError> {
        update_annotation(&self.nodes(), name, key, value).await?;
        Ok(())
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<(), ClusterError> {
        if unschedulable {
            self.nodes().cordon(name).await?;
        } else {
            self.nodes().uncordon(name).await?;
        }
        Ok(())
    }

    async fn count_nodes(&self) -> Result<usize, ClusterError> {
        let nodes = self.nodes().list_metadata(&ListParams::default()).await?;
        Ok(nodes.items.len())
    }

    async fn list_pods(&self, selector: &PodSelector) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = match &selector.namespace {
            Some(ns) => self.pods(ns),
            None => Api::all(self.client.clone()),
        };

        let mut params = ListParams::default();
        if let Some(labels) = &selector.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &selector.field_selector {
            params = params.fields(fields);
        }

        Ok(api.list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.pods(namespace).evict(name, &EvictParams::default()).await?;
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), ClusterError> {
        let params = DeleteParams {
            grace_period_seconds,
            ..Default::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClusterError> {
        update_annotation(&self.pods(namespace), name, key, value).await?;
        Ok(())
    }

    async fn machine_config_pool_for_node(&self, node: &Node) -> Result<String, ClusterError> {
        let node_name = node.metadata.name.as_deref().unwrap_or("<unknown>");
        let rendered = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(MCO_DESIRED_CONFIG_ANNOTATION))
            .ok_or_else(|| {
                ClusterError::InvalidObject(format!(
                    "node {node_name} has no {MCO_DESIRED_CONFIG_ANNOTATION} annotation"
                ))
            })?;

        let config = self.machine_config_api("MachineConfig").get(rendered).await?;
        config
            .metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .find(|owner| owner.kind == "MachineConfigPool")
            .map(|owner| owner.name)
            .ok_or_else(|| {
                ClusterError::InvalidObject(format!(
                    "MachineConfig {rendered} for node {node_name} is not owned by a MachineConfigPool"
                ))
            })
    }

    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPoolState, ClusterError> {
        let pool = self.machine_config_api("MachineConfigPool").get(name).await?;
        Ok(MachineConfigPoolState {
            name: name.to_string(),
            paused: pool.data["spec"]["paused"].as_bool().unwrap_or(false),
            updating: condition_is_true(&pool, "Updating"),
            degraded: condition_is_true(&pool, "Degraded"),
        })
    }

    async fn set_machine_config_pool_paused(&self, name: &str, paused: bool) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "spec": { "paused": paused } });
        self.machine_config_api("MachineConfigPool")
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
