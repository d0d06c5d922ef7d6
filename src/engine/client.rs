//! HTTP client for the Docker Engine API

use super::transport::send_request;
use super::{
    EngineApi, Filters, ServiceCreateOptions, ServiceListOptions, ServiceUpdateOptions,
    DEFAULT_API_VERSION,
};
use crate::config::EngineEndpoint;
use crate::error::{Result, StackError};
use crate::reference::Reference;
use crate::swarm::config::IdResponse;
use crate::swarm::network::NetworkCreateResponse;
use crate::swarm::node::version_less_than;
use crate::swarm::service::{ServiceCreateResponse, ServiceUpdateResponse};
use crate::swarm::{
    Config, ConfigSpec, NetworkCreate, NetworkResource, Node, ObjectVersion, Secret, SecretSpec,
    ServerVersion, Service, ServiceSpec, SystemInfo, Task,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Header carrying base64 registry credentials
pub const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Docker Engine API client
#[derive(Debug, Clone)]
pub struct EngineClient {
    endpoint: EngineEndpoint,
    api_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DistributionInspect {
    descriptor: DistributionDescriptor,
}

#[derive(Debug, Deserialize)]
struct DistributionDescriptor {
    digest: String,
}

impl EngineClient {
    /// Client pinned to an API version
    pub fn new(endpoint: EngineEndpoint, api_version: impl Into<String>) -> Self {
        Self {
            endpoint,
            api_version: api_version.into(),
        }
    }

    /// Connect and negotiate the API version with the daemon
    pub async fn connect(endpoint: EngineEndpoint) -> Result<Self> {
        let mut client = Self::new(endpoint, DEFAULT_API_VERSION);
        let version: ServerVersion = client.get_unversioned("/version").await?;
        if !version.api_version.is_empty()
            && version_less_than(&version.api_version, DEFAULT_API_VERSION)
        {
            client.api_version = version.api_version;
        }
        debug!(
            endpoint = %client.endpoint,
            api_version = %client.api_version,
            "negotiated engine API version"
        );
        Ok(client)
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    fn versioned(&self, path: &str) -> String {
        format!("/v{}{}", self.api_version, path)
    }

    async fn call(
        &self,
        method: Method,
        path_and_query: String,
        body: Option<Vec<u8>>,
        registry_auth: Option<&str>,
    ) -> Result<Bytes> {
        debug!(method = %method, path = %path_and_query, "engine request");
        let mut builder = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(header::HOST, "docker")
            .header(header::USER_AGENT, concat!("stackyard/", env!("CARGO_PKG_VERSION")));
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        if let Some(auth) = registry_auth.filter(|a| !a.is_empty()) {
            builder = builder.header(REGISTRY_AUTH_HEADER, auth);
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| StackError::Http(format!("failed to build request: {}", e)))?;

        let response = send_request(&self.endpoint, request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(StackError::remote(status.as_u16(), &bytes));
        }
        Ok(bytes)
    }

    async fn get_unversioned<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.call(Method::GET, path.to_string(), None, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let bytes = self
            .call(Method::GET, with_query(&self.versioned(path), query), None, None)
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
        registry_auth: Option<&str>,
    ) -> Result<T> {
        let bytes = self
            .call(
                Method::POST,
                with_query(&self.versioned(path), query),
                Some(serde_json::to_vec(body)?),
                registry_auth,
            )
            .await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post_no_content<B: Serialize>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<()> {
        self.call(
            Method::POST,
            with_query(&self.versioned(path), query),
            Some(serde_json::to_vec(body)?),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call(Method::DELETE, self.versioned(path), None, None)
            .await?;
        Ok(())
    }

    /// Pin the image to the digest the registry reports
    ///
    /// Failures only produce a warning; nodes then resolve the tag on their own.
    async fn resolve_image_digest(
        &self,
        spec: &mut ServiceSpec,
        registry_auth: Option<&str>,
        warnings: &mut Vec<String>,
    ) {
        let Some(container) = spec.task_template.container_spec.as_mut() else {
            return;
        };
        let image = container.image.clone();
        match self.distribution_digest(&image, registry_auth).await {
            Ok(Some(pinned)) => {
                debug!(image = %image, pinned = %pinned, "resolved image digest");
                container.image = pinned;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(image = %image, error = %e, "digest resolution failed");
                warnings.push(format!(
                    "image {} could not be accessed on a registry to record\nits digest. \
                     Each node will access {} independently,\npossibly leading to different \
                     nodes running different\nversions of the image.\n",
                    image, image
                ));
            }
        }
    }

    async fn distribution_digest(
        &self,
        image: &str,
        registry_auth: Option<&str>,
    ) -> Result<Option<String>> {
        let reference = Reference::parse(image)?;
        if reference.digest.is_some() {
            return Ok(None);
        }
        let path = self.versioned(&format!("/distribution/{}/json", image));
        let bytes = self.call(Method::GET, path, None, registry_auth).await?;
        let inspect: DistributionInspect = serde_json::from_slice(&bytes)?;
        let pinned = Reference {
            digest: Some(inspect.descriptor.digest),
            ..reference
        };
        Ok(Some(pinned.familiar_string()))
    }
}

/// Append URL-encoded query pairs, skipping empty values
fn with_query(path: &str, query: &[(&str, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (key, value) in query {
        if !value.is_empty() {
            serializer.append_pair(key, value);
            any = true;
        }
    }
    if any {
        format!("{}?{}", path, serializer.finish())
    } else {
        path.to_string()
    }
}

fn filters_query(filters: &Filters) -> Vec<(&'static str, String)> {
    if filters.is_empty() {
        Vec::new()
    } else {
        vec![("filters", filters.to_json())]
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn server_version(&self) -> Result<ServerVersion> {
        self.get("/version", &[]).await
    }

    async fn info(&self) -> Result<SystemInfo> {
        self.get("/info", &[]).await
    }

    async fn service_list(&self, options: &ServiceListOptions) -> Result<Vec<Service>> {
        let mut query = filters_query(&options.filters);
        if options.status {
            query.push(("status", "true".to_string()));
        }
        let services: Option<Vec<Service>> = self.get("/services", &query).await?;
        Ok(services.unwrap_or_default())
    }

    async fn service_inspect(&self, id: &str) -> Result<Service> {
        self.get(&format!("/services/{}", id), &[("insertDefaults", "true".to_string())])
            .await
    }

    async fn service_create(
        &self,
        spec: &ServiceSpec,
        options: &ServiceCreateOptions,
    ) -> Result<ServiceCreateResponse> {
        let auth = options.encoded_registry_auth.as_deref();
        let mut spec = spec.clone();
        let mut warnings = Vec::new();
        if options.query_registry {
            self.resolve_image_digest(&mut spec, auth, &mut warnings).await;
        }
        let mut response: ServiceCreateResponse =
            self.post("/services/create", &[], &spec, auth).await?;
        warnings.append(&mut response.warnings);
        response.warnings = warnings;
        Ok(response)
    }

    async fn service_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &ServiceSpec,
        options: &ServiceUpdateOptions,
    ) -> Result<ServiceUpdateResponse> {
        let auth = options.encoded_registry_auth.as_deref();
        let mut spec = spec.clone();
        let mut warnings = Vec::new();
        if options.query_registry {
            self.resolve_image_digest(&mut spec, auth, &mut warnings).await;
        }
        let query = [
            ("version", version.index.to_string()),
            (
                "registryAuthFrom",
                options.registry_auth_from.clone().unwrap_or_default(),
            ),
        ];
        let response: Option<ServiceUpdateResponse> = self
            .post(&format!("/services/{}/update", id), &query, &spec, auth)
            .await?;
        let mut response = response.unwrap_or_default();
        warnings.append(&mut response.warnings);
        response.warnings = warnings;
        Ok(response)
    }

    async fn service_remove(&self, id: &str) -> Result<()> {
        self.delete(&format!("/services/{}", id)).await
    }

    async fn network_list(&self, filters: &Filters) -> Result<Vec<NetworkResource>> {
        let networks: Option<Vec<NetworkResource>> =
            self.get("/networks", &filters_query(filters)).await?;
        Ok(networks.unwrap_or_default())
    }

    async fn network_inspect(&self, id: &str) -> Result<NetworkResource> {
        self.get(&format!("/networks/{}", id), &[]).await
    }

    async fn network_create(&self, request: &NetworkCreate) -> Result<NetworkCreateResponse> {
        self.post("/networks/create", &[], request, None).await
    }

    async fn network_remove(&self, id: &str) -> Result<()> {
        self.delete(&format!("/networks/{}", id)).await
    }

    async fn secret_list(&self, filters: &Filters) -> Result<Vec<Secret>> {
        let secrets: Option<Vec<Secret>> = self.get("/secrets", &filters_query(filters)).await?;
        Ok(secrets.unwrap_or_default())
    }

    async fn secret_inspect(&self, id: &str) -> Result<Secret> {
        self.get(&format!("/secrets/{}", id), &[]).await
    }

    async fn secret_create(&self, spec: &SecretSpec) -> Result<IdResponse> {
        self.post("/secrets/create", &[], spec, None).await
    }

    async fn secret_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &SecretSpec,
    ) -> Result<()> {
        self.post_no_content(
            &format!("/secrets/{}/update", id),
            &[("version", version.index.to_string())],
            spec,
        )
        .await
    }

    async fn secret_remove(&self, id: &str) -> Result<()> {
        self.delete(&format!("/secrets/{}", id)).await
    }

    async fn config_list(&self, filters: &Filters) -> Result<Vec<Config>> {
        let configs: Option<Vec<Config>> = self.get("/configs", &filters_query(filters)).await?;
        Ok(configs.unwrap_or_default())
    }

    async fn config_inspect(&self, id: &str) -> Result<Config> {
        self.get(&format!("/configs/{}", id), &[]).await
    }

    async fn config_create(&self, spec: &ConfigSpec) -> Result<IdResponse> {
        self.post("/configs/create", &[], spec, None).await
    }

    async fn config_update(
        &self,
        id: &str,
        version: ObjectVersion,
        spec: &ConfigSpec,
    ) -> Result<()> {
        self.post_no_content(
            &format!("/configs/{}/update", id),
            &[("version", version.index.to_string())],
            spec,
        )
        .await
    }

    async fn config_remove(&self, id: &str) -> Result<()> {
        self.delete(&format!("/configs/{}", id)).await
    }

    async fn task_list(&self, filters: &Filters) -> Result<Vec<Task>> {
        let tasks: Option<Vec<Task>> = self.get("/tasks", &filters_query(filters)).await?;
        Ok(tasks.unwrap_or_default())
    }

    async fn node_list(&self, filters: &Filters) -> Result<Vec<Node>> {
        let nodes: Option<Vec<Node>> = self.get("/nodes", &filters_query(filters)).await?;
        Ok(nodes.unwrap_or_default())
    }

    async fn node_inspect(&self, id: &str) -> Result<Node> {
        self.get(&format!("/nodes/{}", id), &[]).await
    }
}
