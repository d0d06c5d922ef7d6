//! Manifest list assembly and push
//!
//! A push happens in three phases and in this order: every blob mount, then
//! every child manifest PUT, then the list itself.

use super::platform::validate_os_arch;
use super::types::{canonical_json, media_types, sha256_digest, Descriptor, ImageManifest, ManifestList, Platform};
use crate::error::{Result, StackError};
use crate::reference::Reference;
use crate::registry::{MountOutcome, RegistryApi};
use crate::stack::Output;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// What to do when a registry answers a mount by starting a fresh upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MountPolicy {
    /// Every blob must be mounted
    Strict,
    /// Foreign and non-distributable layers may be skipped
    #[default]
    TolerateForeignLayers,
    /// Never fail on an unmounted blob
    TolerateAll,
}

impl MountPolicy {
    fn tolerates(self, media_type: &str) -> bool {
        match self {
            MountPolicy::Strict => false,
            MountPolicy::TolerateForeignLayers => media_types::is_foreign_layer(media_type),
            MountPolicy::TolerateAll => true,
        }
    }
}

/// A blob to mount from a child's repository into the target repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMount {
    /// Source repository with the blob digest
    pub source: Reference,
    pub media_type: String,
}

/// A child manifest to store in the target repository by digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPut {
    pub reference: Reference,
    pub media_type: String,
    pub payload: Vec<u8>,
}

/// Everything needed to push one manifest list
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub target: Reference,
    pub list: ManifestList,
    pub mounts: Vec<BlobMount>,
    pub manifests: Vec<ManifestPut>,
}

/// Validate the children and plan the registry calls
pub fn build_push_request(target: &Reference, manifests: &[ImageManifest]) -> Result<PushRequest> {
    let target = target.clone().with_default_tag();
    let mut descriptors = Vec::with_capacity(manifests.len());
    let mut mounts = Vec::new();
    let mut puts = Vec::new();
    let mut mounted = HashSet::new();
    let mut stored = HashSet::new();

    for manifest in manifests {
        let source = Reference::parse(&manifest.reference)?;
        let descriptor = build_descriptor(manifest)?;
        if source.domain != target.domain {
            return Err(StackError::Validation(format!(
                "cannot use source images from a different registry than the target image: {} != {}",
                source.domain, target.domain
            )));
        }

        if source.path != target.path {
            for blob in manifest.blobs() {
                if !mounted.insert(blob.digest.clone()) {
                    continue;
                }
                mounts.push(BlobMount {
                    source: Reference {
                        tag: None,
                        digest: Some(blob.digest.clone()),
                        ..source.clone()
                    },
                    media_type: blob.media_type.clone(),
                });
            }
            if stored.insert(descriptor.digest.clone()) {
                let (media_type, payload) = manifest.payload()?;
                puts.push(ManifestPut {
                    reference: Reference {
                        tag: None,
                        digest: Some(descriptor.digest.clone()),
                        ..target.clone()
                    },
                    media_type,
                    payload,
                });
            }
        }
        descriptors.push(descriptor);
    }

    Ok(PushRequest {
        target,
        list: ManifestList::from_descriptors(descriptors),
        mounts,
        manifests: puts,
    })
}

/// List entry for one child
fn build_descriptor(manifest: &ImageManifest) -> Result<Descriptor> {
    let platform = manifest.platform();
    if platform.os.is_empty() || platform.architecture.is_empty() {
        return Err(StackError::Validation(format!(
            "manifest {} must have an OS and Architecture to be pushed to a registry",
            manifest.reference
        )));
    }
    manifest
        .descriptor
        .digest
        .parse::<oci_spec::image::Digest>()
        .map_err(|e| {
            StackError::Validation(format!(
                "invalid digest {:?} for {}: {}",
                manifest.descriptor.digest, manifest.reference, e
            ))
        })?;

    let (media_type, payload) = manifest.payload()?;
    if sha256_digest(&payload) != manifest.descriptor.digest {
        return Err(StackError::Validation(format!(
            "internal digest inconsistency for {}",
            manifest.reference
        )));
    }
    Ok(Descriptor {
        media_type,
        size: payload.len() as i64,
        digest: manifest.descriptor.digest.clone(),
        platform: Some(platform),
        ..Default::default()
    })
}

/// Run a planned push and print the digest of the list
pub async fn push(
    registry: &dyn RegistryApi,
    request: &PushRequest,
    policy: MountPolicy,
    output: &Output,
) -> Result<String> {
    for mount in &request.mounts {
        let outcome = registry
            .mount_blob(&mount.source, &request.target)
            .await
            .map_err(|e| {
                StackError::Http(format!(
                    "error mounting {} to {}: {}",
                    mount.source, request.target, e
                ))
            })?;
        if outcome == MountOutcome::CreatedNewBlob {
            if !policy.tolerates(&mount.media_type) {
                return Err(StackError::Http(format!(
                    "error mounting {} to {}: registry created a new blob instead of mounting",
                    mount.source, request.target
                )));
            }
            warn!(blob = %mount.source, "blob was not mounted");
        } else {
            debug!(blob = %mount.source, target = %request.target, "mounted blob");
        }
    }

    for manifest in &request.manifests {
        let digest = registry
            .put_manifest(&manifest.reference, &manifest.media_type, manifest.payload.clone())
            .await?;
        output.out(format!("Pushed ref {} with digest: {}", manifest.reference, digest));
    }

    let payload = canonical_json(&request.list)?;
    let digest = registry
        .put_manifest(&request.target, media_types::MANIFEST_LIST_V2, payload)
        .await?;
    output.out(&digest);
    Ok(digest)
}

/// YAML description of a list to push without the local store
#[derive(Debug, Clone, Deserialize)]
pub struct YamlList {
    pub image: String,
    pub manifests: Vec<YamlEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YamlEntry {
    pub image: String,
    #[serde(default)]
    pub platform: Platform,
}

impl YamlList {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Fetch every entry, apply its platform and plan the push
pub async fn build_yaml_push_request(registry: &dyn RegistryApi, list: &YamlList) -> Result<PushRequest> {
    let target = Reference::parse(&list.image)?;
    let mut manifests = Vec::with_capacity(list.manifests.len());
    for entry in &list.manifests {
        let reference = Reference::parse(&entry.image)?.with_default_tag();
        let mut manifest = registry.get_manifest(&reference).await?;
        validate_os_arch(&entry.platform.os, &entry.platform.architecture)?;
        manifest.descriptor.platform = Some(entry.platform.clone());
        manifests.push(manifest);
    }
    build_push_request(&target, &manifests)
}
