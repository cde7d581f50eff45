//! Widget CRD
//!
//! The resource mirrored between the reference and mirror clusters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "tutorial.kubebuilder.io",
    version = "v1alpha1",
    kind = "Widget",
    namespaced,
    status = "WidgetStatus",
    printcolumn = r#"{"name":"Foo","type":"string","jsonPath":".spec.foo"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSpec {
    /// Example field, carried through unchanged
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub foo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetStatus {
    /// `metadata.generation` the controller last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}
