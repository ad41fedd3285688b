//! Common types for Darkroom: CRD, validation, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod leader_election;
pub mod metrics;
pub mod validation;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the Darkroom custom resource
pub const API_GROUP: &str = "deployments.gojek.io";

/// Field manager used by the reconciler for server-side apply
pub const CONTROLLER_FIELD_MANAGER: &str = "darkroom-controller";

/// Field manager used by the API server when creating resources
pub const API_SERVER_FIELD_MANAGER: &str = "api-server";

/// Label key that ties child pods back to their Darkroom
pub const DARKROOM_LABEL_KEY: &str = "darkroom";

/// Version used when a Darkroom does not name one
pub const DEFAULT_VERSION: &str = "latest";

/// Container image (without tag) run by every Darkroom workload
pub const DARKROOM_IMAGE: &str = "gojektech/darkroom";

/// Name of the lease used for controller leader election
pub const LEADER_ELECTION_ID: &str = "750f7516.gojek.io";
