//! Image reference parsing
//!
//! Normalizes references the way the engine does: a missing registry means
//! `docker.io`, single-component Hub repositories live under `library/`.

use crate::error::{Result, StackError};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Default registry domain
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Key used for Docker Hub credentials in the client config file
pub const INDEX_SERVER: &str = "https://index.docker.io/v1/";

/// Host actually serving the Docker Hub registry API
pub const HUB_REGISTRY_HOST: &str = "registry-1.docker.io";

fn path_component() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*$").expect("valid regex")
    })
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("valid regex"))
}

/// A parsed, normalized image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry host, possibly with a port
    pub domain: String,
    /// Repository path within the registry
    pub path: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest, if any
    pub digest: Option<String>,
}

impl Reference {
    /// Parse and normalize a reference
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(StackError::Validation("invalid reference format".to_string()));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                digest.parse::<oci_spec::image::Digest>().map_err(|e| {
                    StackError::Validation(format!(
                        "invalid reference format: invalid digest {}: {}",
                        digest, e
                    ))
                })?;
                (name, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // A tag separator is a colon after the last slash
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let at = last_slash + i;
                (&rest[..at], Some(rest[at + 1..].to_string()))
            }
            None => (rest, None),
        };

        if let Some(tag) = &tag {
            if !tag_pattern().is_match(tag) {
                return Err(StackError::Validation(format!(
                    "invalid reference format: invalid tag {:?}",
                    tag
                )));
            }
        }

        let (domain, path) = split_domain(name);
        if path.is_empty() {
            return Err(StackError::Validation("invalid reference format".to_string()));
        }
        for component in path.split('/') {
            if !path_component().is_match(component) {
                if component.chars().any(|c| c.is_ascii_uppercase()) {
                    return Err(StackError::Validation(format!(
                        "invalid reference format: repository name ({}) must be lowercase",
                        path
                    )));
                }
                return Err(StackError::Validation(format!(
                    "invalid reference format: {}",
                    input
                )));
            }
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// `domain/path` without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Short form as users usually write it (`alpine`, `example.com/app`)
    pub fn familiar_name(&self) -> String {
        if self.domain == DEFAULT_DOMAIN {
            self.path
                .strip_prefix("library/")
                .unwrap_or(&self.path)
                .to_string()
        } else {
            self.name()
        }
    }

    /// Familiar form including the tag or digest
    pub fn familiar_string(&self) -> String {
        let mut out = self.familiar_name();
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Apply `latest` when neither tag nor digest is present
    pub fn with_default_tag(mut self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some("latest".to_string());
        }
        self
    }

    /// Tag or digest used for registry manifest requests
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    /// Host the registry API is served from
    pub fn registry_host(&self) -> &str {
        if self.domain == DEFAULT_DOMAIN {
            HUB_REGISTRY_HOST
        } else {
            &self.domain
        }
    }

    /// Key under which credentials for this registry are stored
    pub fn index_server(&self) -> String {
        index_server_for(&self.domain)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Credential key for a registry domain
pub fn index_server_for(domain: &str) -> String {
    if domain == DEFAULT_DOMAIN || domain == "index.docker.io" || domain == HUB_REGISTRY_HOST {
        INDEX_SERVER.to_string()
    } else {
        domain.to_string()
    }
}

fn split_domain(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            let domain = if first == "index.docker.io" {
                DEFAULT_DOMAIN
            } else {
                first
            };
            let path = if domain == DEFAULT_DOMAIN && !rest.contains('/') {
                format!("library/{}", rest)
            } else {
                rest.to_string()
            };
            (domain.to_string(), path)
        }
        Some(_) => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        None => (DEFAULT_DOMAIN.to_string(), format!("library/{}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hub_short_name() {
        let r = Reference::parse("alpine").unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.path, "library/alpine");
        assert_eq!(r.tag, None);
        assert_eq!(r.familiar_name(), "alpine");
        assert_eq!(r.registry_host(), "registry-1.docker.io");
        assert_eq!(r.index_server(), INDEX_SERVER);
    }

    #[test]
    fn test_parse_registry_with_port_and_tag() {
        let r = Reference::parse("localhost:5000/team/app:1.2").unwrap();
        assert_eq!(r.domain, "localhost:5000");
        assert_eq!(r.path, "team/app");
        assert_eq!(r.tag.as_deref(), Some("1.2"));
        assert_eq!(r.to_string(), "localhost:5000/team/app:1.2");
    }

    #[test]
    fn test_parse_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = Reference::parse(&format!("example.com/alpine:3.0@{}", digest)).unwrap();
        assert_eq!(r.tag.as_deref(), Some("3.0"));
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(r.reference(), digest);
    }

    #[test]
    fn test_reject_uppercase_and_bad_digest() {
        assert!(Reference::parse("Example/App").is_err());
        assert!(Reference::parse("alpine@sha256:xyz").is_err());
        assert!(Reference::parse("").is_err());
    }

    #[test]
    fn test_default_tag() {
        let r = Reference::parse("example.com/list").unwrap().with_default_tag();
        assert_eq!(r.to_string(), "example.com/list:latest");
    }
}
