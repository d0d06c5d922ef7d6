//! Client configuration
//!
//! Reads the Docker-style client config file, resolves the engine endpoint
//! and parses `.env` files.

use crate::error::{Result, StackError};
use crate::reference::{index_server_for, Reference};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the client config file
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Default engine socket
pub const DEFAULT_ENGINE_HOST: &str = "unix:///var/run/docker.sock";

/// System-wide registry certificate directory
pub const SYSTEM_CERTS_DIR: &str = "/etc/docker/certs.d";

/// Credentials for one registry as stored in `auths`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthEntry {
    /// base64 of `user:password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registrytoken: Option<String>,
}

/// Decoded registry credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serveraddress: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identitytoken: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registrytoken: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

/// Client configuration loaded from `config.json`
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    dir: PathBuf,
    auths: HashMap<String, AuthEntry>,
}

impl CliConfig {
    /// Directory holding the client configuration
    pub fn default_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".docker")
    }

    /// Load from the default directory
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_dir())
    }

    /// Load from a directory; a missing file yields an empty configuration
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let file: ConfigFile = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StackError::Validation(format!("loading config file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no client config file");
                ConfigFile::default()
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(store) = &file.creds_store {
            debug!(store = %store, "credential helpers are not consulted");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            auths: file.auths,
        })
    }

    /// Configuration directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Root of the local manifest list store
    pub fn manifest_store_root(&self) -> PathBuf {
        self.dir.join("manifests")
    }

    /// Certificate directories for a registry host, most specific first
    pub fn cert_dirs(&self, host: &str) -> Vec<PathBuf> {
        vec![
            self.dir.join("certs.d").join(host),
            Path::new(SYSTEM_CERTS_DIR).join(host),
        ]
    }

    /// Credentials stored for a registry domain
    pub fn credentials_for(&self, domain: &str) -> Result<Credentials> {
        let key = index_server_for(domain);
        let entry = self.auths.get(&key).or_else(|| {
            // entries are sometimes written with a scheme
            self.auths.iter().find_map(|(k, v)| {
                let host = k
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/');
                (host == key).then_some(v)
            })
        });

        let Some(entry) = entry else {
            return Ok(Credentials {
                serveraddress: key,
                ..Default::default()
            });
        };

        let mut creds = Credentials {
            username: entry.username.clone().unwrap_or_default(),
            password: entry.password.clone().unwrap_or_default(),
            serveraddress: key,
            identitytoken: entry.identitytoken.clone().unwrap_or_default(),
            registrytoken: entry.registrytoken.clone().unwrap_or_default(),
        };

        if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD
                .decode(auth)
                .map_err(|e| StackError::Validation(format!("invalid auth entry: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| StackError::Validation(format!("invalid auth entry: {}", e)))?;
            let (user, password) = decoded.split_once(':').ok_or_else(|| {
                StackError::Validation("invalid auth entry: missing ':'".to_string())
            })?;
            creds.username = user.to_string();
            creds.password = password.trim_end_matches('\0').to_string();
        }

        Ok(creds)
    }

    /// Encoded credentials for the registry serving `image`, as sent in `X-Registry-Auth`
    pub fn encode_auth_for_image(&self, image: &str) -> Result<String> {
        let reference = Reference::parse(image)?;
        let creds = self.credentials_for(&reference.domain)?;
        encode_auth(&creds)
    }
}

/// base64url-encode credentials as JSON
pub fn encode_auth(creds: &Credentials) -> Result<String> {
    let json = serde_json::to_vec(creds)?;
    Ok(URL_SAFE.encode(json))
}

/// Engine endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEndpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl EngineEndpoint {
    /// Parse `unix:///path`, `tcp://host:port` or a bare socket path
    pub fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(StackError::Usage(format!("invalid host: {}", host)));
            }
            return Ok(EngineEndpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
        {
            let addr = addr.trim_end_matches('/');
            if addr.is_empty() {
                return Err(StackError::Usage(format!("invalid host: {}", host)));
            }
            let addr = if addr.contains(':') {
                addr.to_string()
            } else {
                format!("{}:2375", addr)
            };
            return Ok(EngineEndpoint::Tcp(addr));
        }
        if host.starts_with('/') {
            return Ok(EngineEndpoint::Unix(PathBuf::from(host)));
        }
        Err(StackError::Usage(format!(
            "invalid host {}: unsupported protocol",
            host
        )))
    }

    /// `-H` flag, then `DOCKER_HOST`, then the default socket
    pub fn resolve(flag: Option<&str>) -> Result<Self> {
        if let Some(host) = flag {
            return Self::parse(host);
        }
        match std::env::var("DOCKER_HOST") {
            Ok(host) if !host.is_empty() => Self::parse(&host),
            _ => Self::parse(DEFAULT_ENGINE_HOST),
        }
    }
}

impl std::fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            EngineEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Parse the contents of a `.env` file
pub fn parse_env_file(content: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (line, ""),
        };
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(StackError::Validation(format!(
                "invalid variable name {:?} on line {}",
                key,
                idx + 1
            )));
        }

        vars.insert(key.to_string(), unquote(value).to_string());
    }

    Ok(vars)
}

/// Read a `.env` file; a missing file is empty
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_env_file(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Interpolation environment: `.env` in the working directory overlaid by the shell
pub fn load_environment(working_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut env = read_env_file(&working_dir.join(".env"))?;
    overlay_environment(&mut env, std::env::vars_os());
    Ok(env)
}

/// Overlay process variables, skipping any that are not valid UTF-8
fn overlay_environment<I>(env: &mut BTreeMap<String, String>, vars: I)
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    for (key, value) in vars {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                env.insert(key, value);
            }
            (key, _) => {
                debug!(variable = ?key, "Skipping environment variable that is not valid UTF-8");
            }
        }
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    // inline comments only apply to unquoted values
    match value.find(" #") {
        Some(i) => value[..i].trim_end(),
        None => value,
    }
}
