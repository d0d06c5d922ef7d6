//! Registry API client
//!
//! Manifest fetches and pushes plus cross-repository blob mounts against a
//! distribution (v2) registry.

pub mod auth;
pub mod client;
pub mod tls;

use crate::error::Result;
use crate::manifest::types::ImageManifest;
use crate::reference::Reference;
use async_trait::async_trait;

pub use client::RegistryClient;

/// Result of a cross-repository mount request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// The blob is now available in the target repository
    Mounted,
    /// The registry did not mount and opened a fresh upload instead
    CreatedNewBlob,
}

/// Registry operations used by the manifest commands
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// One image manifest with its platform; manifest lists are refused
    async fn get_manifest(&self, reference: &Reference) -> Result<ImageManifest>;

    /// Every platform manifest behind a reference; a plain manifest yields one
    async fn get_manifest_list(&self, reference: &Reference) -> Result<Vec<ImageManifest>>;

    /// Store a manifest under the reference's tag or digest and return its digest
    async fn put_manifest(&self, reference: &Reference, media_type: &str, payload: Vec<u8>) -> Result<String>;

    /// Mount the blob `source` (a digest reference) into `target`'s repository
    async fn mount_blob(&self, source: &Reference, target: &Reference) -> Result<MountOutcome>;
}
