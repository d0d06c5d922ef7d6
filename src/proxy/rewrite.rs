//! Request and response rewriters
//!
//! Each rewriter does one thing. Routes stack them: requests pass through a
//! route's rewriters in order, successful JSON responses in reverse order.

use super::scoper::Scoper;
use crate::engine::Filters;
use crate::error::{Result, StackError};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Method, Uri};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Engine object families the proxy scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Container,
    Volume,
    Network,
    Service,
    Secret,
    Config,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::Container,
        ObjectKind::Volume,
        ObjectKind::Network,
        ObjectKind::Service,
        ObjectKind::Secret,
        ObjectKind::Config,
    ];

    /// First path segment of the object's endpoints
    pub fn collection(self) -> &'static str {
        match self {
            ObjectKind::Container => "containers",
            ObjectKind::Volume => "volumes",
            ObjectKind::Network => "networks",
            ObjectKind::Service => "services",
            ObjectKind::Secret => "secrets",
            ObjectKind::Config => "configs",
        }
    }

    /// Unversioned inspect path
    pub fn inspect_path(self, name: &str) -> String {
        match self {
            ObjectKind::Container => format!("/containers/{}/json", name),
            _ => format!("/{}/{}", self.collection(), name),
        }
    }

    /// Field wrapping the array in list responses, if any
    fn list_field(self) -> Option<&'static str> {
        match self {
            ObjectKind::Volume => Some("Volumes"),
            _ => None,
        }
    }

    /// Labels of an inspected object
    pub fn labels(self, object: &Value) -> BTreeMap<String, String> {
        let pointer = match self {
            ObjectKind::Container => "/Config/Labels",
            ObjectKind::Service | ObjectKind::Secret | ObjectKind::Config => "/Spec/Labels",
            ObjectKind::Volume | ObjectKind::Network => "/Labels",
        };
        string_map(object.pointer(pointer))
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Inspects objects on the upstream engine
#[async_trait]
pub trait Lookup: Send + Sync {
    /// `None` when the engine has no such object
    async fn inspect(&self, kind: ObjectKind, name: &str) -> Result<Option<Value>>;
}

/// What a rewriter can reach while it runs
pub struct RewriteContext<'a> {
    pub scoper: &'a dyn Scoper,
    pub lookup: &'a dyn Lookup,
}

/// A request as the proxy edits it
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// `/v1.47` or empty
    pub version_prefix: String,
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    /// Buffered body, present only when a rewriter asked for it
    pub body: Option<Bytes>,
    /// Index of the segment holding the object name
    pub name_index: Option<usize>,
}

impl ProxyRequest {
    pub fn parse(method: Method, uri: &Uri) -> Self {
        let path = uri.path();
        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let version_prefix = match segments.first() {
            Some(first) if is_version_segment(first) => format!("/{}", segments.remove(0)),
            _ => String::new(),
        };
        let query = uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self {
            method,
            version_prefix,
            segments,
            query,
            body: None,
            name_index: None,
        }
    }

    /// Attach and exec start take over the connection for a raw stream
    pub fn hijacks(&self) -> bool {
        if self.method != Method::POST {
            return false;
        }
        matches!(
            self.segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
            ["containers", _, "attach"] | ["exec", _, "start"]
        )
    }

    /// Path without the version prefix
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn path_and_query(&self) -> String {
        let mut out = format!("{}{}", self.version_prefix, self.path());
        if !self.query.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.query.iter())
                .finish();
            out.push('?');
            out.push_str(&query);
        }
        out
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first value of `key`, or append it
    pub fn set_query(&mut self, key: &str, value: String) {
        match self.query.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value,
            None => self.query.push((key.to_string(), value)),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name_index
            .and_then(|i| self.segments.get(i))
            .map(String::as_str)
    }

    pub fn set_name(&mut self, name: String) {
        if let Some(segment) = self.name_index.and_then(|i| self.segments.get_mut(i)) {
            *segment = name;
        }
    }
}

fn is_version_segment(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

/// One step of a route
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// The request body must be buffered before [`Rewriter::request`] runs
    fn needs_body(&self) -> bool {
        false
    }

    /// The response body is parsed and passed to [`Rewriter::response`]
    fn rewrites_response(&self) -> bool {
        false
    }

    async fn request(&self, _request: &mut ProxyRequest, _ctx: &RewriteContext<'_>) -> Result<()> {
        Ok(())
    }

    fn response(&self, _body: &mut Value, _scoper: &dyn Scoper) -> Result<()> {
        Ok(())
    }
}

/// Restricts the `filters` query argument to the project
pub struct FilterRewriter;

#[async_trait]
impl Rewriter for FilterRewriter {
    async fn request(&self, request: &mut ProxyRequest, ctx: &RewriteContext<'_>) -> Result<()> {
        let mut filters = Filters::from_json(request.query_value("filters").unwrap_or(""))
            .map_err(|e| StackError::Usage(format!("invalid filters: {}", e)))?;
        ctx.scoper.update_filter(&mut filters);
        request.set_query("filters", filters.to_json());
        Ok(())
    }
}

/// Descopes the names of every object in a list response
pub struct DescopeList(pub ObjectKind);

#[async_trait]
impl Rewriter for DescopeList {
    fn rewrites_response(&self) -> bool {
        true
    }

    fn response(&self, body: &mut Value, scoper: &dyn Scoper) -> Result<()> {
        let list = match self.0.list_field() {
            Some(field) => body.get_mut(field),
            None => Some(body),
        };
        if let Some(Value::Array(objects)) = list {
            for object in objects {
                descope_object(object, scoper);
            }
        }
        Ok(())
    }
}

/// Descopes the name of an inspected object
pub struct DescopeObject;

#[async_trait]
impl Rewriter for DescopeObject {
    fn rewrites_response(&self) -> bool {
        true
    }

    fn response(&self, body: &mut Value, scoper: &dyn Scoper) -> Result<()> {
        descope_object(body, scoper);
        Ok(())
    }
}

/// Descope `Name`, `Names` and `Spec.Name` in place
pub fn descope_object(object: &mut Value, scoper: &dyn Scoper) {
    if let Some(name) = object.get_mut("Name") {
        descope_value(name, scoper);
    }
    if let Some(Value::Array(names)) = object.get_mut("Names") {
        for name in names {
            descope_value(name, scoper);
        }
    }
    if let Some(name) = object.pointer_mut("/Spec/Name") {
        descope_value(name, scoper);
    }
}

/// Container names carry a leading slash
fn descope_value(value: &mut Value, scoper: &dyn Scoper) {
    if let Value::String(name) = value {
        *name = match name.strip_prefix('/') {
            Some(bare) => format!("/{}", scoper.descope_name(bare)),
            None => scoper.descope_name(name),
        };
    }
}

/// Resolves the object name in the path through the engine
pub struct ResolvePath(pub ObjectKind);

#[async_trait]
impl Rewriter for ResolvePath {
    async fn request(&self, request: &mut ProxyRequest, ctx: &RewriteContext<'_>) -> Result<()> {
        let Some(name) = request.name().map(str::to_string) else {
            return Ok(());
        };
        let resolved = resolve_name(ctx, self.0, &name).await?;
        request.set_name(resolved);
        Ok(())
    }
}

/// Engine name for a client-supplied name or ID
///
/// An in-scope match on the value as given wins unless the value is already
/// scoped. Otherwise the scoped name is used; it is refused when it belongs
/// to another project.
pub async fn resolve_name(ctx: &RewriteContext<'_>, kind: ObjectKind, name: &str) -> Result<String> {
    let already_scoped = ctx.scoper.descope_name(name) != name;
    if !already_scoped {
        if let Some(object) = ctx.lookup.inspect(kind, name).await? {
            if ctx.scoper.is_in_scope(&kind.labels(&object)) {
                return Ok(name.to_string());
            }
        }
    }

    let scoped = ctx.scoper.scope_name(name);
    match ctx.lookup.inspect(kind, &scoped).await? {
        Some(object) if !ctx.scoper.is_in_scope(&kind.labels(&object)) => Err(StackError::Remote {
            status: 404,
            message: format!("\"{}\" not found", name),
        }),
        _ => Ok(scoped),
    }
}

/// Scopes the new object's name and labels it as part of the project
pub struct ScopeCreate(pub ObjectKind);

#[async_trait]
impl Rewriter for ScopeCreate {
    fn needs_body(&self) -> bool {
        true
    }

    async fn request(&self, request: &mut ProxyRequest, ctx: &RewriteContext<'_>) -> Result<()> {
        let scoper = ctx.scoper;
        if self.0 == ObjectKind::Container {
            if let Some(name) = request.query_value("name").filter(|n| !n.is_empty()) {
                let scoped = scoper.scope_name(name);
                request.set_query("name", scoped);
            }
        }

        let raw = request.body.clone().unwrap_or_default();
        let mut body: Value = if raw.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&raw)
                .map_err(|e| StackError::Usage(format!("invalid JSON body: {}", e)))?
        };
        let Value::Object(fields) = &mut body else {
            return Err(StackError::Usage("request body must be a JSON object".to_string()));
        };

        if self.0 != ObjectKind::Container {
            if let Some(Value::String(name)) = fields.get_mut("Name") {
                *name = scoper.scope_name(name);
            }
        }
        let mut labels = string_map(fields.get("Labels"));
        scoper.add_labels(&mut labels);
        fields.insert("Labels".to_string(), serde_json::to_value(labels)?);

        request.body = Some(Bytes::from(serde_json::to_vec(&body)?));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::scoper::{LabelScoper, PROJECT_LABEL};
    use serde_json::json;
    use std::sync::Mutex;

    /// Lookup answering from a fixed table
    #[derive(Default)]
    pub(crate) struct TableLookup {
        pub objects: BTreeMap<String, Value>,
        pub asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Lookup for TableLookup {
        async fn inspect(&self, _kind: ObjectKind, name: &str) -> Result<Option<Value>> {
            self.asked.lock().unwrap().push(name.to_string());
            Ok(self.objects.get(name).cloned())
        }
    }

    fn request(method: Method, uri: &str) -> ProxyRequest {
        ProxyRequest::parse(method, &uri.parse::<Uri>().unwrap())
    }

    fn network(project: &str) -> Value {
        let mut labels = Map::new();
        labels.insert(PROJECT_LABEL.to_string(), json!(project));
        json!({"Name": "x", "Labels": labels})
    }

    #[test]
    fn test_parse_request() {
        let req = request(Method::GET, "/v1.47/volumes?filters=%7B%7D&x=1");
        assert_eq!(req.version_prefix, "/v1.47");
        assert_eq!(req.path(), "/volumes");
        assert_eq!(req.query_value("filters"), Some("{}"));
        assert_eq!(req.path_and_query(), "/v1.47/volumes?filters=%7B%7D&x=1");

        let bare = request(Method::GET, "/volumes");
        assert_eq!(bare.version_prefix, "");
        assert_eq!(bare.path_and_query(), "/volumes");

        let named = request(Method::GET, "/volumes/v1");
        assert_eq!(named.version_prefix, "");
        assert_eq!(named.segments, vec!["volumes", "v1"]);
    }

    #[test]
    fn test_hijacking_endpoints() {
        assert!(request(Method::POST, "/v1.47/containers/web/attach?stream=1").hijacks());
        assert!(request(Method::POST, "/exec/abc123/start").hijacks());
        assert!(!request(Method::POST, "/containers/web/exec").hijacks());
        assert!(!request(Method::GET, "/containers/web/attach").hijacks());
        assert!(!request(Method::GET, "/containers/web/logs").hijacks());
    }

    #[tokio::test]
    async fn test_filter_and_descope_list() {
        let scoper = LabelScoper::new("myproject", PROJECT_LABEL);
        let lookup = TableLookup::default();
        let ctx = RewriteContext {
            scoper: &scoper,
            lookup: &lookup,
        };
        let mut req = request(
            Method::GET,
            "/v1.47/volumes?filters=%7B%22name%22%3A%5B%22foo%22%5D%7D",
        );
        FilterRewriter.request(&mut req, &ctx).await.unwrap();
        assert_eq!(
            req.query_value("filters"),
            Some(r#"{"label":["com.docker.project.id=myproject"],"name":["myproject_foo"]}"#)
        );

        let mut body = json!({"Volumes": [{"Name": "myproject_foo"}], "Warnings": null});
        DescopeList(ObjectKind::Volume)
            .response(&mut body, &scoper)
            .unwrap();
        assert_eq!(body["Volumes"][0]["Name"], "foo");

        let mut containers = json!([{"Names": ["/myproject_web"]}]);
        DescopeList(ObjectKind::Container)
            .response(&mut containers, &scoper)
            .unwrap();
        assert_eq!(containers[0]["Names"][0], "/web");

        let mut service = json!({"ID": "abc", "Spec": {"Name": "myproject_api"}});
        DescopeObject.response(&mut service, &scoper).unwrap();
        assert_eq!(service["Spec"]["Name"], "api");
    }

    #[tokio::test]
    async fn test_name_resolution() {
        let scoper = LabelScoper::new("myproject", PROJECT_LABEL);
        let mut lookup = TableLookup::default();
        lookup.objects.insert("abc123".to_string(), network("myproject"));
        lookup.objects.insert("myproject_db".to_string(), network("myproject"));
        lookup.objects.insert("myproject_theirs".to_string(), network("other"));
        let ctx = RewriteContext {
            scoper: &scoper,
            lookup: &lookup,
        };

        // In-scope ID passes unchanged
        assert_eq!(
            resolve_name(&ctx, ObjectKind::Network, "abc123").await.unwrap(),
            "abc123"
        );
        // Client name maps to the scoped object
        assert_eq!(
            resolve_name(&ctx, ObjectKind::Network, "db").await.unwrap(),
            "myproject_db"
        );
        // Scoped name belonging to another project is hidden
        let err = resolve_name(&ctx, ObjectKind::Network, "theirs")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("\"theirs\" not found"));
        // Unknown names are scoped and left for the engine to reject
        assert_eq!(
            resolve_name(&ctx, ObjectKind::Network, "missing").await.unwrap(),
            "myproject_missing"
        );
        // Already scoped values skip the first lookup
        lookup.asked.lock().unwrap().clear();
        resolve_name(&ctx, ObjectKind::Network, "myproject_db")
            .await
            .unwrap();
        assert_eq!(
            *lookup.asked.lock().unwrap(),
            vec!["myproject_myproject_db".to_string()]
        );
    }

    #[tokio::test]
    async fn test_resolve_path_rewrites_segment() {
        let scoper = LabelScoper::new("p", PROJECT_LABEL);
        let lookup = TableLookup::default();
        let ctx = RewriteContext {
            scoper: &scoper,
            lookup: &lookup,
        };
        let mut req = request(Method::DELETE, "/v1.47/networks/front");
        req.name_index = Some(1);
        ResolvePath(ObjectKind::Network)
            .request(&mut req, &ctx)
            .await
            .unwrap();
        assert_eq!(req.path_and_query(), "/v1.47/networks/p_front");
    }

    #[tokio::test]
    async fn test_scope_create() {
        let scoper = LabelScoper::new("p", PROJECT_LABEL);
        let lookup = TableLookup::default();
        let ctx = RewriteContext {
            scoper: &scoper,
            lookup: &lookup,
        };

        let mut req = request(Method::POST, "/networks/create");
        req.body = Some(Bytes::from_static(br#"{"Name":"front","Labels":{"a":"b"}}"#));
        ScopeCreate(ObjectKind::Network)
            .request(&mut req, &ctx)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["Name"], "p_front");
        assert_eq!(body["Labels"]["a"], "b");
        assert_eq!(body["Labels"][PROJECT_LABEL], "p");

        let mut req = request(Method::POST, "/containers/create?name=web");
        req.body = Some(Bytes::from_static(br#"{"Image":"nginx"}"#));
        ScopeCreate(ObjectKind::Container)
            .request(&mut req, &ctx)
            .await
            .unwrap();
        assert_eq!(req.query_value("name"), Some("p_web"));
        let body: Value = serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["Image"], "nginx");
        assert_eq!(body["Labels"][PROJECT_LABEL], "p");
    }
}
