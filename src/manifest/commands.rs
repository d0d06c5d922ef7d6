//! `manifest` subcommands

use super::platform::validate_os_arch;
use super::push::{build_push_request, build_yaml_push_request, push, MountPolicy, YamlList};
use super::store::ManifestStore;
use super::types::{tab_indented, ImageManifest};
use crate::error::{Result, StackError};
use crate::reference::Reference;
use crate::registry::RegistryApi;
use crate::stack::Output;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Add to an existing local list instead of refusing
    pub amend: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotateOptions {
    pub os: Option<String>,
    pub arch: Option<String>,
    pub variant: Option<String>,
    pub os_version: Option<String>,
    pub os_features: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Remove the local list once the push succeeded
    pub purge: bool,
    pub mount_policy: MountPolicy,
}

fn named(reference: &str) -> Result<Reference> {
    Ok(Reference::parse(reference)?.with_default_tag())
}

/// Start or extend a local manifest list
pub async fn create(
    store: &ManifestStore,
    registry: &dyn RegistryApi,
    list: &str,
    images: &[String],
    opts: &CreateOptions,
    output: &Output,
) -> Result<()> {
    let list_ref = named(list)?;
    match store.get_list(&list_ref) {
        Ok(_) if !opts.amend => {
            return Err(StackError::Precondition(format!(
                "refusing to amend an existing manifest list with no --amend flag: {}",
                list_ref
            )))
        }
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }

    for image in images {
        let child = named(image)?;
        let manifests = match store.get(&list_ref, &child) {
            Ok(manifests) => manifests,
            Err(e) if e.is_not_found() => registry.get_manifest_list(&child).await?,
            Err(e) => return Err(e),
        };
        debug!(list = %list_ref, image = %child, count = manifests.len(), "adding manifests");
        store.save(&list_ref, &child, &manifests)?;
    }
    output.out(format!("Created manifest list {}", list_ref));
    Ok(())
}

/// Update the platform of one stored child
pub fn annotate(store: &ManifestStore, list: &str, image: &str, opts: &AnnotateOptions) -> Result<()> {
    let list_ref = named(list)?;
    let child = named(image)?;
    let mut manifests = store.get(&list_ref, &child).map_err(|e| {
        if e.is_not_found() {
            StackError::NotFound(format!(
                "manifest for image {} does not exist in {}",
                image, list
            ))
        } else {
            e
        }
    })?;
    if manifests.len() > 1 {
        return Err(StackError::Validation(format!(
            "{} holds {} platform manifests in {}; annotate a single-platform image instead",
            image,
            manifests.len(),
            list
        )));
    }

    let manifest = &mut manifests[0];
    let mut platform = manifest.platform();
    if let Some(os) = &opts.os {
        platform.os = os.clone();
    }
    if let Some(arch) = &opts.arch {
        platform.architecture = arch.clone();
    }
    if let Some(variant) = &opts.variant {
        platform.variant = variant.clone();
    }
    if let Some(os_version) = &opts.os_version {
        platform.os_version = os_version.clone();
    }
    for feature in &opts.os_features {
        if !platform.os_features.contains(feature) {
            platform.os_features.push(feature.clone());
        }
    }
    validate_os_arch(&platform.os, &platform.architecture)?;
    manifest.descriptor.platform = Some(platform);

    store.save(&list_ref, &child, &manifests)
}

/// Print a stored child, a stored list, or what the registry holds
pub async fn inspect(
    store: &ManifestStore,
    registry: &dyn RegistryApi,
    list: Option<&str>,
    image: &str,
    verbose: bool,
    output: &Output,
) -> Result<()> {
    let image_ref = named(image)?;

    if let Some(list) = list {
        let list_ref = named(list)?;
        for manifest in store.get(&list_ref, &image_ref)? {
            print_manifest(&manifest, verbose, output)?;
        }
        return Ok(());
    }

    match store.get_list(&image_ref) {
        Ok(manifests) if !manifests.is_empty() => {
            return print_list(&image_ref, &manifests, verbose, output);
        }
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }

    let manifests = registry.get_manifest_list(&image_ref).await?;
    match manifests.as_slice() {
        [single] if single.reference == image_ref.to_string() => print_manifest(single, verbose, output),
        _ => print_list(&image_ref, &manifests, verbose, output),
    }
}

fn print_manifest(manifest: &ImageManifest, verbose: bool, output: &Output) -> Result<()> {
    if verbose {
        output.out(tab_indented(manifest)?);
        return Ok(());
    }
    let (_, payload) = manifest.payload()?;
    let value: serde_json::Value = serde_json::from_slice(&payload)?;
    output.out(tab_indented(&value)?);
    Ok(())
}

fn print_list(
    list: &Reference,
    manifests: &[ImageManifest],
    verbose: bool,
    output: &Output,
) -> Result<()> {
    if verbose {
        output.out(tab_indented(&manifests)?);
        return Ok(());
    }
    let request = build_push_request(list, manifests)?;
    output.out(tab_indented(&request.list)?);
    Ok(())
}

/// Push a stored list
pub async fn push_list(
    store: &ManifestStore,
    registry: &dyn RegistryApi,
    list: &str,
    opts: &PushOptions,
    output: &Output,
) -> Result<()> {
    let list_ref = named(list)?;
    let manifests = store.get_list(&list_ref)?;
    if manifests.is_empty() {
        return Err(StackError::NotFound(format!("{} not found", list_ref)));
    }
    let request = build_push_request(&list_ref, &manifests)?;
    push(registry, &request, opts.mount_policy, output).await?;
    if opts.purge {
        store.remove(&list_ref)?;
    }
    Ok(())
}

/// Push a list described by a YAML file, bypassing the store
pub async fn push_file(registry: &dyn RegistryApi, path: &Path, opts: &PushOptions, output: &Output) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let list = YamlList::parse(&content)?;
    let request = build_yaml_push_request(registry, &list).await?;
    push(registry, &request, opts.mount_policy, output).await?;
    Ok(())
}

/// Delete local lists, reporting every one that does not exist
pub fn remove(store: &ManifestStore, lists: &[String]) -> Result<()> {
    let mut errors = Vec::new();
    for list in lists {
        let list_ref = named(list)?;
        match store.get_list(&list_ref) {
            Ok(_) => store.remove(&list_ref)?,
            Err(e) if e.is_not_found() => errors.push(format!("No such manifest: {}", list)),
            Err(e) => return Err(e),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StackError::Partial(errors))
    }
}
