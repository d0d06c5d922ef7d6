//! Registry TLS material from `certs.d` directories
//!
//! `*.crt` files are extra root CAs, added on top of the system roots.
//! `*.cert` and `*.key` files with the same stem form a client certificate;
//! either half without the other is an error.

use crate::error::{Result, StackError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// PEM files found in one directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub roots: Vec<PathBuf>,
    /// Certificate and key path pairs
    pub identities: Vec<(PathBuf, PathBuf)>,
}

impl TlsFiles {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.identities.is_empty()
    }
}

/// Collect the TLS files of a directory; a missing directory is empty
pub fn scan_cert_dir(dir: &Path) -> Result<TlsFiles> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TlsFiles::default()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();

    let mut files = TlsFiles::default();
    for path in &paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".crt") {
            debug!(path = %path.display(), "adding registry CA");
            files.roots.push(path.clone());
        } else if let Some(stem) = name.strip_suffix(".cert") {
            let key = dir.join(format!("{}.key", stem));
            if !key.exists() {
                return Err(StackError::Validation(format!(
                    "missing key {} for client certificate {}. CA certificates must use the extension .crt",
                    key.display(),
                    path.display()
                )));
            }
            debug!(cert = %path.display(), key = %key.display(), "adding registry client certificate");
            files.identities.push((path.clone(), key));
        } else if let Some(stem) = name.strip_suffix(".key") {
            let cert = dir.join(format!("{}.cert", stem));
            if !cert.exists() {
                return Err(StackError::Validation(format!(
                    "missing client certificate {} for key {}",
                    cert.display(),
                    path.display()
                )));
            }
        }
    }
    Ok(files)
}

/// Apply the TLS files to a client builder
pub fn configure(mut builder: reqwest::ClientBuilder, files: &TlsFiles) -> Result<reqwest::ClientBuilder> {
    for path in &files.roots {
        let pem = std::fs::read(path)?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            StackError::Validation(format!("invalid CA certificate {}: {}", path.display(), e))
        })?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some((cert_path, key_path)) = files.identities.first() {
        let cert = std::fs::read(cert_path)?;
        let key = std::fs::read(key_path)?;
        let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key).map_err(|e| {
            StackError::Validation(format!(
                "invalid client certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        builder = builder.identity(identity);
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_pairs_and_roots() {
        let dir = TempDir::new().unwrap();
        for name in ["ca.crt", "client.cert", "client.key", "notes.txt"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let files = scan_cert_dir(dir.path()).unwrap();
        assert_eq!(files.roots, vec![dir.path().join("ca.crt")]);
        assert_eq!(
            files.identities,
            vec![(dir.path().join("client.cert"), dir.path().join("client.key"))]
        );
    }

    #[test]
    fn test_cert_without_key() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("client.cert"), "x").unwrap();
        let err = scan_cert_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing key"));
    }

    #[test]
    fn test_key_without_cert() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("client.key"), "x").unwrap();
        let err = scan_cert_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing client certificate"));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(scan_cert_dir(&dir.path().join("nope")).unwrap().is_empty());
    }
}
