//! CRD registry and installation
//!
//! The registry is the single list of resource types this operator serves.
//! It is built once at startup and handed to whoever needs it: the installer,
//! and the `--crd` printer.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use darkroom_common::crd::Darkroom;
use darkroom_common::CONTROLLER_FIELD_MANAGER;

/// CRD definition with name and resource
#[derive(Clone, Debug)]
pub struct CrdDef {
    /// `<plural>.<group>`
    pub name: String,
    /// Full definition
    pub crd: CustomResourceDefinition,
}

impl CrdDef {
    fn of<K: CustomResourceExt>() -> Self {
        Self {
            name: K::crd_name().to_string(),
            crd: K::crd(),
        }
    }
}

/// Every resource type served by this operator
pub fn registry() -> Vec<CrdDef> {
    vec![CrdDef::of::<Darkroom>()]
}

/// Render the registry as a multi-document YAML stream
pub fn crd_yaml(crds: &[CrdDef]) -> anyhow::Result<String> {
    let docs = crds
        .iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// Install or update every CRD in `crds` using server-side apply
pub async fn ensure_crds_installed(client: &Client, crds: &[CrdDef]) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_FIELD_MANAGER).force();

    for def in crds {
        tracing::info!("Installing {} CRD...", def.name);
        api.patch(&def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("Darkroom CRDs installed/updated");
    Ok(())
}
