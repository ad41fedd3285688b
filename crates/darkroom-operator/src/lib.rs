//! Darkroom operator: wiring for the controller and API server processes

#![deny(missing_docs)]

pub mod controller_runner;
pub mod health;
pub mod startup;
pub mod webhook;
