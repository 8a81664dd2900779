//! HTTP layer.
//!
//! Serves VPM repository manifests built from a GitHub repository's
//! releases, plus health and metrics endpoints.

pub mod handler;
pub mod logging;
