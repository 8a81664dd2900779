//! VPM repository manifest assembly.
//!
//! A repository manifest lists every released version of one package.  Each
//! version is the package's own `package.json` as of the release tag, with
//! `name` forced to the package id and `url` pointing at the release zip.

use std::collections::BTreeMap;

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::forge::{ForgeBackend, Release};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One version of a package.  Fields this service does not interpret are
/// carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageVersions {
    pub versions: BTreeMap<String, PackageManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoManifest {
    pub name: String,
    pub id: String,
    pub url: String,
    pub author: String,
    pub packages: BTreeMap<String, PackageVersions>,
}

/// Everything needed to build one repository manifest.
#[derive(Debug, Clone)]
pub struct ManifestRequest {
    pub owner: String,
    pub repo: String,
    /// Package id override.  Defaults to the `name` of the newest
    /// package manifest that could be fetched.
    pub package_id: Option<String>,
    pub package_manifest_path: String,
    pub id_prefix: String,
    /// Public URL of the manifest being generated.
    pub manifest_url: String,
}

/// None of a repository's releases yielded a usable package manifest.
#[derive(Debug, thiserror::Error)]
#[error("no package manifest could be fetched for {owner}/{repo}")]
pub struct NoPackageManifest {
    pub owner: String,
    pub repo: String,
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

#[instrument(skip(forge, request), fields(owner = %request.owner, repo = %request.repo))]
pub async fn build_repo_manifest(
    forge: &dyn ForgeBackend,
    request: &ManifestRequest,
) -> Result<RepoManifest> {
    let owner = request.owner.as_str();
    let repo = request.repo.as_str();

    let releases = forge.releases(owner, repo).await?;
    debug!(releases = releases.len(), "releases listed");

    let fetches = releases
        .iter()
        .map(|release| fetch_package_manifest(forge, request, release));
    let manifests: Vec<(&Release, PackageManifest)> = releases
        .iter()
        .zip(join_all(fetches).await)
        .filter_map(|(release, manifest)| Some((release, manifest?)))
        .collect();

    let Some((_, newest)) = manifests.first() else {
        return Err(NoPackageManifest {
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
        .into());
    };
    let package_id = request
        .package_id
        .clone()
        .unwrap_or_else(|| newest.name.clone());

    let mut versions = BTreeMap::new();
    for (release, mut manifest) in manifests {
        manifest.name = package_id.clone();
        manifest.url = Some(release.zip_url.clone());
        if let Some(previous) = versions.insert(manifest.version.clone(), manifest) {
            debug!(version = %previous.version, tag = %release.tag, "duplicate version replaced");
        }
    }

    Ok(RepoManifest {
        name: format!("{owner}/{repo}"),
        id: format!("{}.{owner}.{repo}", request.id_prefix),
        url: request.manifest_url.clone(),
        author: owner.to_string(),
        packages: BTreeMap::from([(package_id, PackageVersions { versions })]),
    })
}

/// Fetch and parse the package manifest at one release.  Failures are
/// logged and skipped.
async fn fetch_package_manifest(
    forge: &dyn ForgeBackend,
    request: &ManifestRequest,
    release: &Release,
) -> Option<PackageManifest> {
    let body = match forge
        .file_content(
            &request.owner,
            &request.repo,
            &release.tag,
            &request.package_manifest_path,
        )
        .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!(tag = %release.tag, error = %e, "failed to fetch package manifest");
            return None;
        }
    };

    match serde_json::from_str(&body) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(tag = %release.tag, error = %e, "invalid package manifest");
            None
        }
    }
}
