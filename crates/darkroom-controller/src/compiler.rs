//! Desired-state synthesis
//!
//! Compiles a `Darkroom` into the three children that run it: a ConfigMap
//! holding the server's environment, a Deployment running the image, and a
//! ClusterIP Service in front of it. Children share the parent's name and
//! namespace and carry a controller owner reference, so deleting the Darkroom
//! garbage-collects them.
//!
//! Compilation is pure: the same object always yields the same children.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use darkroom_common::crd::Darkroom;
use darkroom_common::{Error, DARKROOM_IMAGE, DARKROOM_LABEL_KEY};

/// Port the darkroom server listens on inside the container
pub const CONTAINER_PORT: i32 = 3000;

/// Port exposed by the Service
pub const SERVICE_PORT: i32 = 8080;

const PORT_NAME: &str = "http";
const CONTAINER_NAME: &str = "darkroom";

// Server settings that do not depend on the spec.
const STATIC_CONFIG: &[(&str, &str)] = &[
    ("DEBUG", "false"),
    ("LOG_LEVEL", "info"),
    ("PORT", "3000"),
    ("CACHE_TIME", "31536000"),
    ("SOURCE_HYSTRIX_TIMEOUT", "5000"),
    ("SOURCE_HYSTRIX_MAXCONCURRENTREQUESTS", "100"),
    ("SOURCE_HYSTRIX_REQUESTVOLUMETHRESHOLD", "10"),
    ("SOURCE_HYSTRIX_SLEEPWINDOW", "10"),
    ("SOURCE_HYSTRIX_ERRORPERCENTTHRESHOLD", "25"),
];

/// Children derived from one Darkroom, in apply order
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChildren {
    /// Environment for the darkroom server
    pub config_map: ConfigMap,
    /// Workload running the server, reading its env from `config_map`
    pub deployment: Deployment,
    /// ClusterIP endpoint in front of the workload
    pub service: Service,
}

/// Compile a Darkroom into its children
///
/// Fails when the object has no namespace or no uid, since neither the
/// children's identity nor their owner reference can be formed without them.
pub fn compile(darkroom: &Darkroom) -> Result<DesiredChildren, Error> {
    let name = darkroom.name_any();
    let namespace = darkroom
        .namespace()
        .ok_or_else(|| Error::synthesis(&name, "darkroom has no namespace"))?;
    let owner = darkroom
        .controller_owner_ref(&())
        .ok_or_else(|| Error::synthesis(&name, "darkroom has no uid to own its children"))?;

    let meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace),
        owner_references: Some(vec![owner]),
        ..Default::default()
    };

    let config_map = compile_config_map(darkroom, meta.clone());
    let config_map_name = config_map.metadata.name.clone().unwrap_or_default();
    let labels = BTreeMap::from([(DARKROOM_LABEL_KEY.to_string(), name)]);

    Ok(DesiredChildren {
        deployment: compile_deployment(darkroom, meta.clone(), &labels, config_map_name),
        service: compile_service(meta, labels),
        config_map,
    })
}

fn compile_config_map(darkroom: &Darkroom, metadata: ObjectMeta) -> ConfigMap {
    let source = &darkroom.spec.source;
    let kind = source.source_type().to_string();

    let mut data: BTreeMap<String, String> = STATIC_CONFIG
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    data.insert(
        "SOURCE_HYSTRIX_COMMANDNAME".to_string(),
        format!("{kind}_ADAPTER").to_uppercase(),
    );
    data.insert("SOURCE_BASEURL".to_string(), source.base_url().to_string());
    data.insert("SOURCE_KIND".to_string(), kind);

    ConfigMap {
        metadata,
        data: Some(data),
        ..Default::default()
    }
}

fn compile_deployment(
    darkroom: &Darkroom,
    metadata: ObjectMeta,
    labels: &BTreeMap<String, String>,
    config_map_name: String,
) -> Deployment {
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(format!("{}:{}", DARKROOM_IMAGE, darkroom.spec.version)),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: config_map_name,
                optional: None,
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: CONTAINER_PORT,
            name: Some(PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn compile_service(metadata: ObjectMeta, selector: BTreeMap<String, String>) -> Service {
    Service {
        metadata,
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port: SERVICE_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::String(PORT_NAME.to_string())),
                ..Default::default()
            }]),
            selector: Some(selector),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
