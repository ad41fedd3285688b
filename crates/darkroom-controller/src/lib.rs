//! Darkroom controller: turns a Darkroom into its ConfigMap, Deployment and
//! Service and keeps them applied.

#![deny(missing_docs)]

pub mod compiler;
pub mod controller;

pub use compiler::{compile, DesiredChildren};
pub use controller::{error_policy, reconcile, Context, DarkroomKubeClient, DarkroomKubeClientImpl};
