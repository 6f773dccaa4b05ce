//! Lolcow CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Lolcow controller.

pub mod lolcow;

pub use lolcow::*;
