//! Darkroom CRD types
//!
//! A `Darkroom` asks for one image-serving deployment: which image version to
//! run, where originals come from, and which domains front it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::source::{Source, SourceSpec};

/// Desired state of a Darkroom deployment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "deployments.gojek.io",
    version = "v1alpha1",
    kind = "Darkroom",
    plural = "darkrooms",
    shortname = "dr",
    namespaced,
    status = "DarkroomStatus",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.source.type"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.deployState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DarkroomSpec {
    /// Image tag of `gojektech/darkroom` to run
    ///
    /// Defaulted to `latest` at admission when empty.
    #[serde(default)]
    pub version: String,

    /// Backend the originals are fetched from
    #[schemars(with = "SourceSpec")]
    pub source: Source,

    /// Path prefix stripped before resolving an image against the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    /// Domains served by this deployment, in order
    #[schemars(length(min = 1))]
    pub domains: Vec<String>,
}

/// Rollout state reported by the reconciler
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeployState {
    /// Not reconciled yet
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Children have been applied
    Deploying,
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, ""),
            Self::Deploying => write!(f, "Deploying"),
        }
    }
}

/// Observed state of a Darkroom deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DarkroomStatus {
    /// Current rollout state
    #[serde(default)]
    pub deploy_state: DeployState,

    /// Domains from the last reconciled spec
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
}

impl DarkroomStatus {
    /// Status the reconciler reports once the children of `spec` are applied
    pub fn deploying(spec: &DarkroomSpec) -> Self {
        Self {
            deploy_state: DeployState::Deploying,
            domains: spec.domains.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WebFolderSource;
    use kube::CustomResourceExt;
    use serde_json::json;

    fn sample_spec() -> DarkroomSpec {
        DarkroomSpec {
            version: "0.1.0".to_string(),
            source: Source::WebFolder(WebFolderSource {
                base_url: "https://example.com".to_string(),
            }),
            path_prefix: None,
            domains: vec!["a.com".to_string(), "b.com".to_string()],
        }
    }

    #[test]
    fn crd_carries_group_kind_and_status_subresource() {
        let crd = Darkroom::crd();
        assert_eq!(crd.spec.group, "deployments.gojek.io");
        assert_eq!(crd.spec.names.kind, "Darkroom");
        assert_eq!(crd.spec.names.plural, "darkrooms");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }

    #[test]
    fn crd_schema_exposes_source_as_flat_object() {
        let crd = serde_json::to_value(Darkroom::crd()).unwrap();
        let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"];
        let source = &spec["properties"]["source"]["properties"];
        assert!(source.get("type").is_some());
        assert!(source.get("baseUrl").is_some());
        assert!(source.get("bucket").is_some());
        assert_eq!(spec["properties"]["domains"]["minItems"], json!(1));
    }

    #[test]
    fn spec_without_version_deserializes_empty() {
        let spec: DarkroomSpec = serde_json::from_value(json!({
            "source": {"type": "WebFolder", "baseUrl": "https://example.com"},
            "domains": ["a.com"]
        }))
        .unwrap();
        assert_eq!(spec.version, "");
        assert_eq!(spec.domains, vec!["a.com"]);
    }

    #[test]
    fn deploying_status_mirrors_domains_in_order() {
        let status = DarkroomStatus::deploying(&sample_spec());
        assert_eq!(status.deploy_state, DeployState::Deploying);
        assert_eq!(status.domains, vec!["a.com", "b.com"]);

        let wire = serde_json::to_value(&status).unwrap();
        assert_eq!(
            wire,
            json!({"deployState": "Deploying", "domains": ["a.com", "b.com"]})
        );
    }

    #[test]
    fn default_status_has_empty_deploy_state() {
        let wire = serde_json::to_value(DarkroomStatus::default()).unwrap();
        assert_eq!(wire, json!({"deployState": ""}));
    }
}
