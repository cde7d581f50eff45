//! APIExport virtual workspace discovery.
//!
//! When the reference server is a kcp server, Widgets are not served from
//! the workspace itself but from the virtual workspace of the APIExport
//! that publishes them. This module finds that endpoint.

use crate::error::ControllerError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIGroupList;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use tracing::info;

/// API group serving APIExports
pub const KCP_APIS_GROUP: &str = "apis.kcp.dev";
/// Version of the APIExport API
pub const KCP_APIS_VERSION: &str = "v1alpha1";

/// Returns `true` when the server offers the kcp APIs group.
pub async fn kcp_apis_present(client: &kube::Client) -> Result<bool, ControllerError> {
    let groups = client.list_api_groups().await?;
    Ok(has_group_version(&groups, KCP_APIS_GROUP, KCP_APIS_VERSION))
}

fn has_group_version(groups: &APIGroupList, group: &str, version: &str) -> bool {
    groups
        .groups
        .iter()
        .filter(|g| g.name == group)
        .any(|g| g.versions.iter().any(|v| v.version == version))
}

fn api_export_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(KCP_APIS_GROUP, KCP_APIS_VERSION, "APIExport"),
        "apiexports",
    )
}

/// URL of the first virtual workspace of an APIExport.
///
/// Looks up `name` when given, otherwise requires exactly one APIExport to
/// exist.
pub async fn virtual_workspace_url(
    client: &kube::Client,
    name: Option<&str>,
) -> Result<String, ControllerError> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &api_export_resource());

    let export = match name {
        Some(name) => api.get(name).await.map_err(|e| {
            ControllerError::ApiExport(format!("error getting APIExport {name:?}: {e}"))
        })?,
        None => {
            info!("API_EXPORT_NAME is empty - listing APIExports");
            let exports = api
                .list(&ListParams::default())
                .await
                .map_err(|e| ControllerError::ApiExport(format!("error listing APIExports: {e}")))?;
            single_export(exports.items)?
        }
    };

    first_virtual_workspace(&export)
}

fn single_export(mut exports: Vec<DynamicObject>) -> Result<DynamicObject, ControllerError> {
    match exports.len() {
        0 => Err(ControllerError::ApiExport("no APIExport found".to_string())),
        1 => Ok(exports.remove(0)),
        _ => Err(ControllerError::ApiExport(
            "more than one APIExport found".to_string(),
        )),
    }
}

fn first_virtual_workspace(export: &DynamicObject) -> Result<String, ControllerError> {
    export
        .data
        .pointer("/status/virtualWorkspaces/0/url")
        .and_then(serde_json::Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ControllerError::ApiExport(format!(
                "APIExport {:?} status.virtualWorkspaces is empty",
                export.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

/// Copy of `base` pointed at `url`.
pub fn virtual_workspace_config(
    base: &kube::Config,
    url: &str,
) -> Result<kube::Config, ControllerError> {
    let mut config = base.clone();
    config.cluster_url = url.parse().map_err(|e| {
        ControllerError::ApiExport(format!("invalid virtual workspace URL {url:?}: {e}"))
    })?;
    Ok(config)
}
