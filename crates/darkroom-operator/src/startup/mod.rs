//! Steps run once before the controller starts

pub mod crds;

pub use crds::{crd_yaml, ensure_crds_installed, registry, CrdDef};
