//! Image manifest and manifest list types

use crate::error::{Result, StackError};
use crate::reference::Reference;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;

/// Media types of registry manifests
pub mod media_types {
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const FOREIGN_LAYER: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
    pub const OCI_NONDISTRIBUTABLE_LAYER: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

    /// Accepted when fetching manifests
    pub const ACCEPT: [&str; 4] = [MANIFEST_V2, MANIFEST_LIST_V2, OCI_MANIFEST, OCI_INDEX];

    pub fn is_list(media_type: &str) -> bool {
        media_type == MANIFEST_LIST_V2 || media_type == OCI_INDEX
    }

    pub fn is_foreign_layer(media_type: &str) -> bool {
        media_type == FOREIGN_LAYER || media_type == OCI_NONDISTRIBUTABLE_LAYER
    }
}

/// Platform an image runs on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

/// Content descriptor
///
/// Field order follows the registry's own encoding so re-serialized
/// manifests keep their digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Schema 2 or OCI image manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl V2Manifest {
    /// Config blob first, then layers
    pub fn references(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Multi-platform manifest list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    pub fn from_descriptors(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: media_types::MANIFEST_LIST_V2.to_string(),
            manifests,
        }
    }
}

/// One image manifest as kept in the local store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "Ref")]
    pub reference: String,
    #[serde(rename = "Descriptor", default)]
    pub descriptor: Descriptor,
    /// Payload exactly as the registry served it
    #[serde(rename = "Raw", default, with = "raw_bytes", skip_serializing_if = "Vec::is_empty")]
    pub raw: Vec<u8>,
    #[serde(rename = "SchemaV2Manifest", default, skip_serializing_if = "Option::is_none")]
    pub schema_v2: Option<V2Manifest>,
    #[serde(rename = "OCIManifest", default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<V2Manifest>,
}

impl ImageManifest {
    /// Manifest fetched from a registry
    pub fn from_payload(
        reference: &Reference,
        media_type: &str,
        raw: Vec<u8>,
        platform: Option<Platform>,
    ) -> Result<Self> {
        let parsed: V2Manifest = serde_json::from_slice(&raw).map_err(|e| {
            StackError::Validation(format!("invalid manifest for {}: {}", reference, e))
        })?;
        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            size: raw.len() as i64,
            digest: sha256_digest(&raw),
            platform,
            ..Default::default()
        };
        let (schema_v2, oci) = if media_type == media_types::OCI_MANIFEST {
            (None, Some(parsed))
        } else {
            (Some(parsed), None)
        };
        Ok(Self {
            reference: reference.to_string(),
            descriptor,
            raw,
            schema_v2,
            oci,
        })
    }

    fn parsed(&self) -> Option<(&str, &V2Manifest)> {
        match (&self.oci, &self.schema_v2) {
            (Some(oci), _) => Some((media_types::OCI_MANIFEST, oci)),
            (None, Some(v2)) => Some((media_types::MANIFEST_V2, v2)),
            (None, None) => None,
        }
    }

    /// Media type and bytes to send to a registry
    ///
    /// Without a preserved raw payload the manifest is re-encoded with three
    /// space indentation, the layout registries produce.
    pub fn payload(&self) -> Result<(String, Vec<u8>)> {
        let Some((default_type, manifest)) = self.parsed() else {
            return Err(StackError::Validation(format!(
                "{} has no image manifest",
                self.reference
            )));
        };
        let media_type = if self.descriptor.media_type.is_empty() {
            default_type.to_string()
        } else {
            self.descriptor.media_type.clone()
        };
        if !self.raw.is_empty() {
            return Ok((media_type, self.raw.clone()));
        }
        Ok((media_type, canonical_json(manifest)?))
    }

    /// Digests of every blob the manifest references
    pub fn blobs(&self) -> Vec<&Descriptor> {
        self.parsed()
            .map(|(_, m)| m.references().collect())
            .unwrap_or_default()
    }

    pub fn platform(&self) -> Platform {
        self.descriptor.platform.clone().unwrap_or_default()
    }
}

/// JSON with three space indentation
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"   ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// Tab-indented JSON for terminal output
pub fn tab_indented<T: Serialize>(value: &T) -> Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

mod raw_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A schema 2 manifest with one layer, stored without its raw payload
    pub(crate) fn sample(reference: &str, os: &str, arch: &str) -> ImageManifest {
        let manifest = V2Manifest {
            schema_version: 2,
            media_type: media_types::MANIFEST_V2.to_string(),
            config: Descriptor {
                media_type: "application/vnd.docker.container.image.v1+json".to_string(),
                size: 1469,
                digest: format!("sha256:{}", "c".repeat(64)),
                ..Default::default()
            },
            layers: vec![Descriptor {
                media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
                size: 2789669,
                digest: format!("sha256:{}", "a".repeat(64)),
                ..Default::default()
            }],
        };
        let payload = canonical_json(&manifest).unwrap();
        ImageManifest {
            reference: Reference::parse(reference).unwrap().to_string(),
            descriptor: Descriptor {
                media_type: media_types::MANIFEST_V2.to_string(),
                size: payload.len() as i64,
                digest: sha256_digest(&payload),
                platform: Some(Platform {
                    architecture: arch.to_string(),
                    os: os.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            raw: Vec::new(),
            schema_v2: Some(manifest),
            oci: None,
        }
    }

    #[test]
    fn test_canonical_payload_matches_digest() {
        let manifest = sample("example.com/alpine:3.0", "linux", "amd64");
        let (media_type, payload) = manifest.payload().unwrap();
        assert_eq!(media_type, media_types::MANIFEST_V2);
        assert_eq!(sha256_digest(&payload), manifest.descriptor.digest);
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("{\n   \"schemaVersion\": 2,\n   \"mediaType\""));
    }

    #[test]
    fn test_raw_payload_wins() {
        let reference = Reference::parse("example.com/alpine:3.0").unwrap();
        let raw = br#"{"schemaVersion":2,"config":{"mediaType":"x","size":1,"digest":"sha256:00"},"layers":[]}"#.to_vec();
        let manifest =
            ImageManifest::from_payload(&reference, media_types::OCI_MANIFEST, raw.clone(), None)
                .unwrap();
        assert!(manifest.oci.is_some());
        assert_eq!(manifest.descriptor.size, raw.len() as i64);
        assert_eq!(manifest.payload().unwrap(), (media_types::OCI_MANIFEST.to_string(), raw));
        assert_eq!(manifest.blobs().len(), 1);
    }

    #[test]
    fn test_stored_form() {
        let mut manifest = sample("example.com/alpine:3.0", "linux", "arm");
        manifest.raw = b"{}".to_vec();
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["Ref"], "example.com/alpine:3.0");
        assert_eq!(json["Raw"], "e30=");
        assert_eq!(json["Descriptor"]["platform"]["architecture"], "arm");
        let back: ImageManifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, manifest);
    }
}
