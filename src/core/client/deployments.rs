use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use crate::core::client::kube_resources::{Deployment, LabelSelector};
use crate::errors::AppError;

/// Fetch a single deployment by name and namespace
pub async fn fetch_deployment_by_name_and_namespace(
    client: &Client,
    namespace: &str,
    deployment_name: &str,
) -> Result<Deployment, AppError> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployment = deployments.get(deployment_name).await?;

    debug!("Fetched deployment: {}/{}", namespace, deployment_name);
    Ok(deployment)
}

/// Apply a JSON merge patch to a deployment
pub async fn patch_deployment(
    client: &Client,
    namespace: &str,
    deployment_name: &str,
    merge_patch: &Value,
) -> Result<Deployment, AppError> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployment = deployments
        .patch(deployment_name, &PatchParams::default(), &Patch::Merge(merge_patch))
        .await?;

    debug!("Patched deployment: {}/{}", namespace, deployment_name);
    Ok(deployment)
}

/// Render a label selector in list-query form,
/// e.g. `app=web,tier in (a,b),!canary`
///
/// An empty selector is rejected: it would match every pod in the namespace.
pub fn label_selector_to_string(selector: &LabelSelector) -> Result<String, AppError> {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        parts.extend(labels.iter().map(|(k, v)| format!("{k}={v}")));
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        let part = match expr.operator.as_str() {
            "In" => format!("{} in ({})", expr.key, values),
            "NotIn" => format!("{} notin ({})", expr.key, values),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(AppError::Validation(format!(
                    "unsupported label selector operator '{other}' for key '{}'",
                    expr.key
                )))
            }
        };
        parts.push(part);
    }

    if parts.is_empty() {
        return Err(AppError::Validation(
            "deployment has an empty pod selector".to_string(),
        ));
    }

    Ok(parts.join(","))
}
