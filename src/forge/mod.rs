//! Upstream forge access.
//!
//! The manifest builder only needs two things from a forge: the list of
//! released tags with their download archives, and the contents of a file at
//! a tag.  [`ForgeBackend`] captures exactly that so the builder can be
//! exercised without the network.

pub mod github;
pub mod rate_limit;

use anyhow::Result;

/// A tagged release that ships a zip archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub tag: String,
    /// Download URL of the release's first `.zip` asset.
    pub zip_url: String,
}

/// Read-only view of the repositories on an upstream forge.
#[async_trait::async_trait]
pub trait ForgeBackend: Send + Sync {
    /// Tag names of a repository, in the order the forge lists them.
    async fn tags(&self, owner: &str, repo: &str) -> Result<Vec<String>>;

    /// Releases that carry a zip asset, newest first.
    async fn releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>>;

    /// Contents of `path` (which must start with `/`) at `git_ref`.
    async fn file_content(&self, owner: &str, repo: &str, git_ref: &str, path: &str)
        -> Result<String>;
}
