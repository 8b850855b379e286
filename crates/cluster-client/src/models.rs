//! Request and response types shared by the client and its mock

use k8s_openapi::api::core::v1::Pod;

/// Which pods to list
///
/// Selectors use the Kubernetes string syntax. Only equality terms
/// (`key=value`, comma separated) are understood by [`PodSelector::matches`],
/// which is what the daemon itself issues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSelector {
    /// Restrict to one namespace, `None` for all namespaces
    pub namespace: Option<String>,
    /// Label selector, e.g. `app=device-plugin`
    pub label_selector: Option<String>,
    /// Field selector, e.g. `spec.nodeName=worker-0`
    pub field_selector: Option<String>,
}

impl PodSelector {
    /// All pods scheduled on a node, in every namespace
    pub fn on_node(node_name: &str) -> Self {
        Self {
            namespace: None,
            label_selector: None,
            field_selector: Some(format!("spec.nodeName={node_name}")),
        }
    }

    /// Narrow to one namespace
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Add a label selector
    pub fn with_labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    /// Client-side evaluation of the selector against a pod
    pub fn matches(&self, pod: &Pod) -> bool {
        if let Some(ns) = &self.namespace {
            if pod.metadata.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }

        if let Some(labels) = &self.label_selector {
            let pod_labels = pod.metadata.labels.as_ref();
            for (key, value) in equality_terms(labels) {
                if pod_labels.and_then(|l| l.get(key)).map(String::as_str) != Some(value) {
                    return false;
                }
            }
        }

        if let Some(fields) = &self.field_selector {
            for (key, value) in equality_terms(fields) {
                let actual = match key {
                    "spec.nodeName" => pod.spec.as_ref().and_then(|s| s.node_name.as_deref()),
                    "metadata.name" => pod.metadata.name.as_deref(),
                    "metadata.namespace" => pod.metadata.namespace.as_deref(),
                    _ => None,
                };
                if actual != Some(value) {
                    return false;
                }
            }
        }

        true
    }
}

fn equality_terms(selector: &str) -> impl Iterator<Item = (&str, &str)> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim_start_matches('=').trim()))
}

/// The parts of an OpenShift MachineConfigPool the drain hooks care about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineConfigPoolState {
    pub name: String,
    /// `spec.paused`
    pub paused: bool,
    /// `Updating` condition is True
    pub updating: bool,
    /// `Degraded` condition is True
    pub degraded: bool,
}

impl MachineConfigPoolState {
    /// A pool can be paused safely only when it isn't rolling out a config
    pub fn is_settled(&self) -> bool {
        !self.updating && !self.degraded
    }
}
