//! Local manifest list store
//!
//! One directory per list under the store root, one JSON file per child
//! manifest. Names escape `:` as `-` and `/` as `_`. When several manifests
//! are saved for the same child, the second and later ones get `_2`, `_3`
//! suffixes.

use super::types::{sha256_digest, Descriptor, ImageManifest, Platform};
use crate::error::{Result, StackError};
use crate::reference::Reference;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem-backed manifest list store
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

/// On-disk form, including fields older versions wrote instead of `Descriptor`
#[derive(Deserialize)]
struct StoredManifest {
    #[serde(flatten)]
    manifest: ImageManifest,
    #[serde(rename = "Digest", default)]
    digest: String,
    #[serde(rename = "Platform", default)]
    platform: Option<Platform>,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn list_dir(&self, list: &Reference) -> PathBuf {
        self.root.join(escape(&list.to_string()))
    }

    fn child_path(&self, list: &Reference, child: &Reference, index: usize) -> PathBuf {
        let base = escape(&child.to_string());
        let name = if index == 0 {
            base
        } else {
            format!("{}_{}", base, index + 1)
        };
        self.list_dir(list).join(name)
    }

    /// Write the manifests of one child, replacing what was stored before
    pub fn save(&self, list: &Reference, child: &Reference, manifests: &[ImageManifest]) -> Result<()> {
        std::fs::create_dir_all(self.list_dir(list))?;
        for (index, manifest) in manifests.iter().enumerate() {
            let path = self.child_path(list, child, index);
            std::fs::write(&path, serde_json::to_vec(manifest)?)?;
            debug!(path = %path.display(), "saved manifest");
        }
        // Drop variants left over from a longer earlier save
        let mut index = manifests.len().max(1);
        loop {
            let stale = self.child_path(list, child, index);
            if !stale.exists() {
                break;
            }
            std::fs::remove_file(stale)?;
            index += 1;
        }
        Ok(())
    }

    /// Every stored variant of one child, in suffix order
    pub fn get(&self, list: &Reference, child: &Reference) -> Result<Vec<ImageManifest>> {
        let mut manifests = Vec::new();
        for index in 0.. {
            let path = self.child_path(list, child, index);
            match std::fs::read(&path) {
                Ok(bytes) => manifests.push(read_manifest(&path, &bytes)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        if manifests.is_empty() {
            return Err(not_found(child));
        }
        Ok(manifests)
    }

    /// Every manifest of a list
    pub fn get_list(&self, list: &Reference) -> Result<Vec<ImageManifest>> {
        let dir = self.list_dir(list);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(list)),
            Err(e) => return Err(e.into()),
        };
        let mut paths = entries
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        paths.sort();

        paths
            .iter()
            .map(|path| read_manifest(path, &std::fs::read(path)?))
            .collect()
    }

    pub fn remove(&self, list: &Reference) -> Result<()> {
        match std::fs::remove_dir_all(self.list_dir(list)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn not_found(reference: &Reference) -> StackError {
    StackError::NotFound(format!("No such manifest: {}", reference))
}

fn escape(reference: &str) -> String {
    reference.replace(':', "-").replace('/', "_")
}

fn read_manifest(path: &Path, bytes: &[u8]) -> Result<ImageManifest> {
    let stored: StoredManifest = serde_json::from_slice(bytes).map_err(|e| {
        StackError::Validation(format!("invalid manifest file {}: {}", path.display(), e))
    })?;
    let mut manifest = stored.manifest;
    if stored.digest.is_empty() {
        return Ok(manifest);
    }

    let (media_type, payload) = manifest.payload()?;
    let actual = sha256_digest(&payload);
    if actual != stored.digest {
        return Err(StackError::Validation(format!(
            "invalid manifest file {}: image manifest digest mismatch ({} != {})",
            path.display(),
            stored.digest,
            actual
        )));
    }
    manifest.descriptor = Descriptor {
        media_type,
        size: payload.len() as i64,
        digest: stored.digest,
        platform: stored.platform,
        ..Default::default()
    };
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::types::tests::sample;
    use serde_json::json;
    use tempfile::TempDir;

    fn reference(s: &str) -> Reference {
        Reference::parse(s).unwrap()
    }

    #[test]
    fn test_save_and_get() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let list = reference("example.com/list:v1");
        let child = reference("example.com/alpine:3.0");
        let manifest = sample("example.com/alpine:3.0", "linux", "amd64");

        store.save(&list, &child, &[manifest.clone()]).unwrap();
        assert!(dir
            .path()
            .join("example.com_list-v1")
            .join("example.com_alpine-3.0")
            .is_file());
        assert_eq!(store.get(&list, &child).unwrap(), vec![manifest.clone()]);
        assert_eq!(store.get_list(&list).unwrap(), vec![manifest]);
    }

    #[test]
    fn test_variants_get_suffixes() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let list = reference("example.com/list:v1");
        let child = reference("example.com/multi:1");
        let amd = sample("example.com/multi:1", "linux", "amd64");
        let arm = sample("example.com/multi:1", "linux", "arm64");
        let ppc = sample("example.com/multi:1", "linux", "ppc64le");

        store
            .save(&list, &child, &[amd.clone(), arm.clone(), ppc])
            .unwrap();
        let list_dir = dir.path().join("example.com_list-v1");
        assert!(list_dir.join("example.com_multi-1_2").is_file());
        assert!(list_dir.join("example.com_multi-1_3").is_file());
        assert_eq!(store.get(&list, &child).unwrap().len(), 3);

        // A shorter save removes the leftovers
        store.save(&list, &child, &[amd.clone(), arm.clone()]).unwrap();
        assert!(!list_dir.join("example.com_multi-1_3").exists());
        assert_eq!(store.get(&list, &child).unwrap(), vec![amd, arm]);
    }

    #[test]
    fn test_missing_list_and_child() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let list = reference("example.com/list:v1");

        let err = store.get_list(&list).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "No such manifest: example.com/list:v1");

        let err = store
            .get(&list, &reference("example.com/alpine:3.0"))
            .unwrap_err();
        assert!(err.is_not_found());

        // Removing a missing list is not an error
        store.remove(&list).unwrap();
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let list = reference("example.com/list:v1");
        let child = reference("example.com/alpine:3.0");
        store
            .save(&list, &child, &[sample("example.com/alpine:3.0", "linux", "amd64")])
            .unwrap();
        store.remove(&list).unwrap();
        assert!(store.get_list(&list).unwrap_err().is_not_found());
    }

    fn write_legacy(dir: &Path, digest: &str) -> ManifestStore {
        let manifest = sample("example.com/alpine:3.0", "linux", "arm");
        let legacy = json!({
            "Ref": manifest.reference,
            "Digest": digest,
            "SchemaV2Manifest": manifest.schema_v2,
            "Platform": {"architecture": "arm", "os": "linux", "variant": "v7"},
        });
        let list_dir = dir.join("example.com_list-v1");
        std::fs::create_dir_all(&list_dir).unwrap();
        std::fs::write(
            list_dir.join("example.com_alpine-3.0"),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();
        ManifestStore::new(dir)
    }

    #[test]
    fn test_legacy_descriptor_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let expected = sample("example.com/alpine:3.0", "linux", "arm");
        let store = write_legacy(dir.path(), &expected.descriptor.digest);

        let manifests = store.get_list(&reference("example.com/list:v1")).unwrap();
        let descriptor = &manifests[0].descriptor;
        assert_eq!(descriptor.digest, expected.descriptor.digest);
        assert_eq!(descriptor.size, expected.descriptor.size);
        assert_eq!(descriptor.media_type, expected.descriptor.media_type);
        assert_eq!(descriptor.platform.as_ref().unwrap().variant, "v7");
    }

    #[test]
    fn test_legacy_digest_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let store = write_legacy(dir.path(), &format!("sha256:{}", "0".repeat(64)));
        let err = store
            .get_list(&reference("example.com/list:v1"))
            .unwrap_err();
        assert!(err.to_string().contains("image manifest digest mismatch"));
    }
}
