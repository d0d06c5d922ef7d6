//! HTTP registry client
//!
//! Each registry host is pinged once at `/v2/` to learn its scheme and
//! authentication challenges. Bearer tokens are cached per host and scope
//! set for the lifetime of the client.

use super::auth::{basic_authorization, parse_challenges, scope, Action, Challenge, TokenResponse};
use super::{tls, MountOutcome, RegistryApi};
use crate::config::{CliConfig, Credentials};
use crate::error::{Result, StackError};
use crate::manifest::types::{media_types, sha256_digest, ImageManifest, ManifestList, Platform};
use crate::reference::Reference;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("stackyard/", env!("CARGO_PKG_VERSION"));

/// Client id sent when exchanging a refresh token
const CLIENT_ID: &str = "stackyard";

/// Header carrying the digest of a stored manifest
const CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// A reachable registry host
#[derive(Debug)]
struct Endpoint {
    client: reqwest::Client,
    base: String,
    challenges: Vec<Challenge>,
}

/// Registry client backed by reqwest
pub struct RegistryClient {
    config: CliConfig,
    insecure: bool,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// `insecure` allows plain HTTP and unverified certificates for every host
    pub fn new(config: CliConfig, insecure: bool) -> Self {
        Self {
            config,
            insecure,
            endpoints: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    async fn endpoint(&self, host: &str) -> Result<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(host) {
            return Ok(endpoint.clone());
        }

        let insecure = self.insecure || is_local(host);
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(insecure);
        for dir in self.config.cert_dirs(host) {
            builder = tls::configure(builder, &tls::scan_cert_dir(&dir)?)?;
        }
        let client = builder.build()?;

        let schemes: &[&str] = if insecure { &["https", "http"] } else { &["https"] };
        let mut last_error = None;
        for scheme in schemes {
            let base = format!("{}://{}", scheme, host);
            match client.get(format!("{}/v2/", base)).send().await {
                Ok(response) => {
                    let challenges = if response.status() == StatusCode::UNAUTHORIZED {
                        response
                            .headers()
                            .get_all(WWW_AUTHENTICATE)
                            .iter()
                            .filter_map(|v| v.to_str().ok())
                            .flat_map(parse_challenges)
                            .collect()
                    } else {
                        Vec::new()
                    };
                    debug!(host = %host, base = %base, challenges = ?challenges, "registry endpoint");
                    let endpoint = Arc::new(Endpoint {
                        client: client.clone(),
                        base,
                        challenges,
                    });
                    endpoints.insert(host.to_string(), endpoint.clone());
                    return Ok(endpoint);
                }
                Err(e) => {
                    debug!(host = %host, scheme = %scheme, error = %e, "registry ping failed");
                    last_error = Some(e);
                }
            }
        }
        Err(StackError::Http(format!(
            "cannot reach registry {}: {}",
            host,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn authorization(
        &self,
        host: &str,
        endpoint: &Endpoint,
        scopes: &[String],
    ) -> Result<Option<String>> {
        let creds = self.config.credentials_for(host)?;
        if !creds.registrytoken.is_empty() {
            return Ok(Some(format!("Bearer {}", creds.registrytoken)));
        }

        for challenge in &endpoint.challenges {
            match challenge {
                Challenge::Bearer { realm, service } => {
                    let key = format!("{}|{}", host, scopes.join(" "));
                    if let Some(token) = self.tokens.lock().await.get(&key) {
                        return Ok(Some(format!("Bearer {}", token)));
                    }
                    let token = fetch_token(endpoint, realm, service.as_deref(), scopes, &creds).await?;
                    self.tokens.lock().await.insert(key, token.clone());
                    return Ok(Some(format!("Bearer {}", token)));
                }
                Challenge::Basic { .. } => {
                    if let Some(header) = basic_authorization(&creds) {
                        return Ok(Some(header));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn send(
        &self,
        host: &str,
        scopes: &[String],
        method: Method,
        path: &str,
        configure: impl FnOnce(RequestBuilder) -> RequestBuilder + Send,
    ) -> Result<Response> {
        let endpoint = self.endpoint(host).await?;
        let authorization = self.authorization(host, &endpoint, scopes).await?;
        let url = format!("{}{}", endpoint.base, path);
        debug!(method = %method, url = %url, "registry request");

        let mut request = configure(endpoint.client.request(method, url));
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        Ok(request.send().await?)
    }

    /// Media type and payload of a manifest or manifest list
    async fn fetch_manifest(&self, reference: &Reference) -> Result<(String, Vec<u8>)> {
        let scopes = [scope(&reference.path, &[Action::Pull])];
        let path = format!("/v2/{}/manifests/{}", reference.path, reference.reference());
        let response = self
            .send(reference.registry_host(), &scopes, Method::GET, &path, |r| {
                r.header(ACCEPT, media_types::ACCEPT.join(", "))
            })
            .await?;
        let response = check(response).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        let payload = response.bytes().await?.to_vec();

        if let Some(digest) = &reference.digest {
            let actual = sha256_digest(&payload);
            if &actual != digest {
                return Err(StackError::Validation(format!(
                    "manifest digest mismatch for {}: got {}",
                    reference, actual
                )));
            }
        }

        let media_type = if content_type.is_empty() || content_type == "application/json" {
            embedded_media_type(&payload)
        } else {
            content_type
        };
        Ok((media_type, payload))
    }

    /// Platform recorded in an image's config blob
    async fn image_platform(&self, reference: &Reference, manifest: &ImageManifest) -> Result<Platform> {
        let Some(config) = manifest.blobs().first().map(|d| d.digest.clone()) else {
            return Ok(Platform::default());
        };
        let scopes = [scope(&reference.path, &[Action::Pull])];
        let path = format!("/v2/{}/blobs/{}", reference.path, config);
        let response = self
            .send(reference.registry_host(), &scopes, Method::GET, &path, |r| r)
            .await?;
        let bytes = check(response).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StackError::Validation(format!("invalid image config for {}: {}", reference, e))
        })
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn get_manifest(&self, reference: &Reference) -> Result<ImageManifest> {
        let (media_type, payload) = self.fetch_manifest(reference).await?;
        if media_types::is_list(&media_type) {
            return Err(StackError::Validation(format!(
                "{} is a manifest list",
                reference
            )));
        }
        let mut manifest = ImageManifest::from_payload(reference, &media_type, payload, None)?;
        let platform = self.image_platform(reference, &manifest).await?;
        manifest.descriptor.platform = Some(platform);
        Ok(manifest)
    }

    async fn get_manifest_list(&self, reference: &Reference) -> Result<Vec<ImageManifest>> {
        let (media_type, payload) = self.fetch_manifest(reference).await?;
        if !media_types::is_list(&media_type) {
            let mut manifest = ImageManifest::from_payload(reference, &media_type, payload, None)?;
            let platform = self.image_platform(reference, &manifest).await?;
            manifest.descriptor.platform = Some(platform);
            return Ok(vec![manifest]);
        }

        let list: ManifestList = serde_json::from_slice(&payload).map_err(|e| {
            StackError::Validation(format!("invalid manifest list for {}: {}", reference, e))
        })?;
        let mut manifests = Vec::with_capacity(list.manifests.len());
        for entry in list.manifests {
            let child = Reference {
                tag: None,
                digest: Some(entry.digest.clone()),
                ..reference.clone()
            };
            let (child_type, child_payload) = self.fetch_manifest(&child).await?;
            if media_types::is_list(&child_type) {
                debug!(reference = %child, "skipping nested manifest list");
                continue;
            }
            manifests.push(ImageManifest::from_payload(
                &child,
                &child_type,
                child_payload,
                entry.platform,
            )?);
        }
        Ok(manifests)
    }

    async fn put_manifest(&self, reference: &Reference, media_type: &str, payload: Vec<u8>) -> Result<String> {
        let scopes = [scope(&reference.path, &[Action::Pull, Action::Push])];
        let path = format!("/v2/{}/manifests/{}", reference.path, reference.reference());
        let computed = sha256_digest(&payload);
        let media_type = media_type.to_string();
        let response = self
            .send(reference.registry_host(), &scopes, Method::PUT, &path, move |r| {
                r.header(CONTENT_TYPE, media_type).body(payload)
            })
            .await?;
        let response = check(response).await?;

        let digest = response
            .headers()
            .get(CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(computed);
        info!(reference = %reference, digest = %digest, "stored manifest");
        Ok(digest)
    }

    async fn mount_blob(&self, source: &Reference, target: &Reference) -> Result<MountOutcome> {
        let digest = source.digest.clone().ok_or_else(|| {
            StackError::Validation(format!("blob reference {} has no digest", source))
        })?;
        let scopes = [
            scope(&target.path, &[Action::Pull, Action::Push]),
            scope(&source.path, &[Action::Pull]),
        ];
        let path = format!("/v2/{}/blobs/uploads/", target.path);
        let from = source.path.clone();
        let response = self
            .send(target.registry_host(), &scopes, Method::POST, &path, move |r| {
                r.query(&[("mount", digest.as_str()), ("from", from.as_str())])
            })
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(MountOutcome::Mounted),
            StatusCode::ACCEPTED => {
                // the abandoned upload session expires on the registry side
                debug!(source = %source, target = %target, "registry started an upload instead of mounting");
                Ok(MountOutcome::CreatedNewBlob)
            }
            _ => Err(check(response).await.err().unwrap_or_else(|| {
                StackError::Http(format!("unexpected response mounting {}", source))
            })),
        }
    }
}

async fn fetch_token(
    endpoint: &Endpoint,
    realm: &str,
    service: Option<&str>,
    scopes: &[String],
    creds: &Credentials,
) -> Result<String> {
    let response = if !creds.identitytoken.is_empty() {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", creds.identitytoken.clone()),
            ("client_id", CLIENT_ID.to_string()),
        ];
        if let Some(service) = service {
            form.push(("service", service.to_string()));
        }
        form.push(("scope", scopes.join(" ")));
        endpoint.client.post(realm).form(&form).send().await?
    } else {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = service {
            query.push(("service", service));
        }
        for scope in scopes {
            query.push(("scope", scope.as_str()));
        }
        let mut request = endpoint.client.get(realm).query(&query);
        if !creds.username.is_empty() {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        request.send().await?
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StackError::Http(format!(
            "getting registry token from {}: {} {}",
            realm,
            status,
            body.trim()
        )));
    }
    let token: TokenResponse = response.json().await?;
    token
        .into_token()
        .ok_or_else(|| StackError::Http(format!("no token in response from {}", realm)))
}

/// Pass successful responses through, turn the rest into errors
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await?;
    Err(registry_error(status, &body))
}

fn registry_error(status: StatusCode, body: &[u8]) -> StackError {
    #[derive(Deserialize)]
    struct Errors {
        #[serde(default)]
        errors: Vec<ErrorEntry>,
    }
    #[derive(Deserialize)]
    struct ErrorEntry {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    }

    let message = match serde_json::from_slice::<Errors>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code.to_lowercase().replace('_', " "), e.message))
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::from_utf8_lossy(body).trim().to_string(),
    };
    if status == StatusCode::NOT_FOUND {
        StackError::NotFound(message)
    } else {
        StackError::Http(format!("registry responded {}: {}", status, message))
    }
}

fn embedded_media_type(payload: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "mediaType", default)]
        media_type: String,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }
    match serde_json::from_slice::<Probe>(payload) {
        Ok(probe) if !probe.media_type.is_empty() => probe.media_type,
        Ok(probe) if probe.manifests.is_some() => media_types::OCI_INDEX.to_string(),
        _ => media_types::OCI_MANIFEST.to_string(),
    }
}

/// Hosts that get plain HTTP without asking
fn is_local(host: &str) -> bool {
    let name = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or(v6),
        None => host.split(':').next().unwrap_or(host),
    };
    name == "localhost" || name == "::1" || name.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType":"application/vnd.docker.container.image.v1+json","size":2,"digest":"sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc"},"layers":[]}"#;

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        uri: String,
        authorization: String,
    }

    /// A registry that wants a bearer token for everything under /v2/
    async fn fake_registry() -> (String, Arc<StdMutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let realm = format!("http://{}/token", host);

        let recorded = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                let realm = realm.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let recorded = recorded.clone();
                        let realm = realm.clone();
                        async move {
                            let method = req.method().to_string();
                            let uri = req.uri().to_string();
                            let authorization = req
                                .headers()
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string();
                            let _ = req.into_body().collect().await;
                            recorded.lock().unwrap().push(Seen {
                                method: method.clone(),
                                uri: uri.clone(),
                                authorization: authorization.clone(),
                            });

                            let builder = hyper::Response::builder();
                            let response = if uri.starts_with("/token") {
                                builder.body(Full::new(Bytes::from(r#"{"token":"tok"}"#)))
                            } else if uri == "/v2/" || authorization != "Bearer tok" {
                                builder
                                    .status(401)
                                    .header(
                                        "www-authenticate",
                                        format!(r#"Bearer realm="{}",service="test""#, realm),
                                    )
                                    .body(Full::new(Bytes::new()))
                            } else if uri == "/v2/team/app/manifests/1.0" {
                                builder
                                    .header("content-type", media_types::MANIFEST_V2)
                                    .body(Full::new(Bytes::from(MANIFEST)))
                            } else if uri.starts_with("/v2/team/app/blobs/sha256:ccc") {
                                builder.body(Full::new(Bytes::from(
                                    r#"{"architecture":"arm64","os":"linux","variant":"v8","rootfs":{}}"#,
                                )))
                            } else if method == "PUT" {
                                builder
                                    .status(201)
                                    .header(CONTENT_DIGEST, "sha256:from-registry")
                                    .body(Full::new(Bytes::new()))
                            } else if uri.contains("mount=") {
                                builder.status(201).body(Full::new(Bytes::new()))
                            } else {
                                builder.status(404).body(Full::new(Bytes::from(
                                    r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
                                )))
                            };
                            Ok::<_, std::convert::Infallible>(response.unwrap())
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (host, seen)
    }

    fn client_with_login(host: &str) -> (TempDir, RegistryClient) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            format!(r#"{{"auths":{{"{}":{{"auth":"dXNlcjpwYXNz"}}}}}}"#, host),
        )
        .unwrap();
        let config = CliConfig::load_from(dir.path()).unwrap();
        (dir, RegistryClient::new(config, false))
    }

    #[tokio::test]
    async fn test_get_manifest_with_bearer_token() {
        let (host, seen) = fake_registry().await;
        let (_dir, client) = client_with_login(&host);
        let reference = Reference::parse(&format!("{}/team/app:1.0", host)).unwrap();

        let manifest = client.get_manifest(&reference).await.unwrap();
        assert_eq!(manifest.raw, MANIFEST.as_bytes());
        assert_eq!(manifest.descriptor.digest, sha256_digest(MANIFEST.as_bytes()));
        let platform = manifest.platform();
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.variant, "v8");

        let seen = seen.lock().unwrap().clone();
        let token = seen.iter().find(|s| s.uri.starts_with("/token")).unwrap();
        assert!(token.uri.contains("service=test"));
        assert!(token.uri.contains("scope=repository%3Ateam%2Fapp%3Apull"));
        assert_eq!(token.authorization, "Basic dXNlcjpwYXNz");
        // the token is fetched once and reused for the config blob
        assert_eq!(seen.iter().filter(|s| s.uri.starts_with("/token")).count(), 1);
    }

    #[tokio::test]
    async fn test_put_and_mount() {
        let (host, seen) = fake_registry().await;
        let (_dir, client) = client_with_login(&host);
        let target = Reference::parse(&format!("{}/team/list:v1", host)).unwrap();

        let digest = client
            .put_manifest(&target, media_types::MANIFEST_LIST_V2, b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(digest, "sha256:from-registry");

        let source = Reference::parse(&format!(
            "{}/team/app@sha256:{}",
            host,
            "a".repeat(64)
        ))
        .unwrap();
        let outcome = client.mount_blob(&source, &target).await.unwrap();
        assert_eq!(outcome, MountOutcome::Mounted);

        let seen = seen.lock().unwrap().clone();
        let mount = seen.iter().find(|s| s.method == "POST").unwrap();
        assert!(mount.uri.starts_with("/v2/team/list/blobs/uploads/?mount=sha256%3A"));
        assert!(mount.uri.ends_with("from=team%2Fapp"));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let (host, _seen) = fake_registry().await;
        let (_dir, client) = client_with_login(&host);
        let reference = Reference::parse(&format!("{}/team/app:2.0", host)).unwrap();
        let err = client.get_manifest(&reference).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "manifest unknown: manifest unknown");
    }

    #[test]
    fn test_local_hosts() {
        assert!(is_local("localhost:5000"));
        assert!(is_local("127.0.0.1:5000"));
        assert!(is_local("[::1]:5000"));
        assert!(!is_local("registry.example.com"));
    }

    #[test]
    fn test_registry_error_message() {
        let err = registry_error(
            StatusCode::UNAUTHORIZED,
            br#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#,
        );
        assert_eq!(
            err.to_string(),
            "HTTP error: registry responded 401 Unauthorized: unauthorized: authentication required"
        );
    }

    #[test]
    fn test_embedded_media_type() {
        assert_eq!(embedded_media_type(MANIFEST.as_bytes()), media_types::MANIFEST_V2);
        assert_eq!(embedded_media_type(br#"{"manifests":[]}"#), media_types::OCI_INDEX);
    }
}
