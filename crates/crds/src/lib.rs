//! Widget CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Widget controller.

pub mod widget;

pub use widget::*;
