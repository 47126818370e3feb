//! CRD loading and installation
//!
//! CRDs are read from files or directories of YAML/JSON manifests, applied
//! with server-side apply and awaited until the API server reports them
//! `Established`, so lookups issued right after start see the new kinds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, FIELD_MANAGER};

const CRD_API_VERSION: &str = "apiextensions.k8s.io/v1";
const CRD_KIND: &str = "CustomResourceDefinition";
const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

fn crd_error(msg: impl Into<String>) -> Error {
    Error::environment_with_context("crds", msg)
}

/// Read every CRD found under `paths`
///
/// Directories are scanned non-recursively for `*.yaml`, `*.yml` and
/// `*.json` files in name order. Documents that are not CRDs are skipped.
pub fn load_crds(
    paths: &[PathBuf],
    error_if_missing: bool,
) -> Result<Vec<CustomResourceDefinition>, Error> {
    let mut crds = Vec::new();

    for path in paths {
        if !path.exists() {
            if error_if_missing {
                return Err(crd_error(format!(
                    "CRD path {} does not exist",
                    path.display()
                )));
            }
            warn!(path = %path.display(), "CRD path does not exist, skipping");
            continue;
        }

        for file in manifest_files(path)? {
            let content = std::fs::read_to_string(&file)?;
            crds.extend(parse_crd_documents(&file, &content)?);
        }
    }

    Ok(crds)
}

fn manifest_files(path: &Path) -> Result<Vec<PathBuf>, Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Parse all CRDs out of one manifest file's content
pub fn parse_crd_documents(
    source: &Path,
    content: &str,
) -> Result<Vec<CustomResourceDefinition>, Error> {
    let is_json = source.extension().and_then(|e| e.to_str()) == Some("json");

    let documents: Vec<serde_json::Value> = if is_json {
        vec![serde_json::from_str(content).map_err(|e| {
            Error::serialization_for_kind(
                CRD_KIND,
                format!("{}: invalid JSON: {}", source.display(), e),
            )
        })?]
    } else {
        serde_yaml::Deserializer::from_str(content)
            .map(|doc| {
                serde_json::Value::deserialize(doc).map_err(|e| {
                    Error::serialization_for_kind(
                        CRD_KIND,
                        format!("{}: invalid YAML: {}", source.display(), e),
                    )
                })
            })
            .collect::<Result<_, _>>()?
    };

    let mut crds = Vec::new();
    for doc in documents {
        if doc.is_null() {
            continue;
        }
        let api_version = doc.get("apiVersion").and_then(|v| v.as_str());
        let kind = doc.get("kind").and_then(|v| v.as_str());
        if api_version != Some(CRD_API_VERSION) || kind != Some(CRD_KIND) {
            warn!(
                file = %source.display(),
                api_version = ?api_version,
                kind = ?kind,
                "skipping non-CRD document"
            );
            continue;
        }

        let crd: CustomResourceDefinition = serde_json::from_value(doc).map_err(|e| {
            Error::serialization_for_kind(CRD_KIND, format!("{}: {}", source.display(), e))
        })?;
        crds.push(crd);
    }
    Ok(crds)
}

/// Apply CRDs and wait for each to become established
///
/// Returns the names of the installed CRDs in apply order.
pub async fn install_crds(
    client: &Client,
    crds: &[CustomResourceDefinition],
    timeout: Duration,
) -> Result<Vec<String>, Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let mut names = Vec::with_capacity(crds.len());

    for crd in crds {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| crd_error("CustomResourceDefinition is missing metadata.name"))?;

        info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(crd))
            .await
            .map_err(|e| crd_error(format!("failed to apply CRD {}: {}", name, e)))?;
        names.push(name);
    }

    let waits = names.iter().map(|name| {
        let api = api.clone();
        async move {
            let established = await_condition(api, name, conditions::is_crd_established());
            match tokio::time::timeout(timeout, established).await {
                Ok(Ok(_)) => {
                    info!(crd = %name, "CRD established");
                    Ok(())
                }
                Ok(Err(e)) => Err(crd_error(format!(
                    "failed waiting for CRD {}: {}",
                    name, e
                ))),
                Err(_) => Err(Error::timeout(format!("establish CRD {}", name), timeout)),
            }
        }
    });
    futures::future::try_join_all(waits).await?;

    Ok(names)
}
