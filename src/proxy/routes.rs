//! Route table of the namespace proxy
//!
//! Built once at startup and shared read-only by every connection.

use super::rewrite::{
    DescopeList, DescopeObject, FilterRewriter, ObjectKind, ProxyRequest, ResolvePath,
    Rewriter, ScopeCreate,
};
use hyper::Method;
use std::sync::Arc;

/// Path pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// The object name
    Name,
    /// One or more segments of anything
    Rest,
}

/// Path pattern such as `/containers/{name}/json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "{name}" => Segment::Name,
                "{*}" => Segment::Rest,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// Index of the name segment when `path` matches
    fn matches(&self, path: &[String]) -> Option<Option<usize>> {
        let rest = self.segments.iter().position(|s| *s == Segment::Rest);
        let (head, tail) = match rest {
            Some(i) => {
                let tail_len = self.segments.len() - i - 1;
                if path.len() < i + 1 + tail_len {
                    return None;
                }
                (
                    (&self.segments[..i], &path[..i]),
                    (&self.segments[i + 1..], &path[path.len() - tail_len..]),
                )
            }
            None => {
                if path.len() != self.segments.len() {
                    return None;
                }
                ((&self.segments[..], path), (&[][..], &[][..]))
            }
        };

        let mut name_index = None;
        for (offset, (pattern, actual)) in [head, tail].into_iter().enumerate() {
            let base = if offset == 0 { 0 } else { path.len() - tail.1.len() };
            for (i, (segment, value)) in pattern.iter().zip(actual).enumerate() {
                match segment {
                    Segment::Literal(literal) if literal != value => return None,
                    Segment::Name => name_index = Some(base + i),
                    _ => {}
                }
            }
        }
        Some(name_index)
    }
}

/// One proxied endpoint
pub struct Route {
    pub method: Method,
    pub pattern: PathPattern,
    pub rewriters: Vec<Arc<dyn Rewriter>>,
    /// Client disconnects are forwarded to the engine as a half-close
    pub cancellable: bool,
}

impl Route {
    fn new(method: Method, pattern: &str, rewriters: Vec<Arc<dyn Rewriter>>) -> Self {
        Self {
            method,
            pattern: PathPattern::parse(pattern),
            rewriters,
            cancellable: false,
        }
    }

    fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn needs_body(&self) -> bool {
        self.rewriters.iter().any(|r| r.needs_body())
    }

    pub fn rewrites_response(&self) -> bool {
        self.rewriters.iter().any(|r| r.rewrites_response())
    }
}

/// Every route the proxy knows, matched in declaration order
pub struct RouteRegistry {
    routes: Vec<Route>,
}

const CONTAINER_ACTIONS: &[(&str, &str)] = &[
    ("POST", "start"),
    ("POST", "stop"),
    ("POST", "restart"),
    ("POST", "kill"),
    ("POST", "pause"),
    ("POST", "unpause"),
    ("POST", "wait"),
    ("POST", "rename"),
    ("POST", "update"),
    ("POST", "resize"),
    ("POST", "attach"),
    ("POST", "exec"),
    ("GET", "top"),
    ("GET", "changes"),
    ("GET", "export"),
    ("GET", "archive"),
    ("PUT", "archive"),
    ("HEAD", "archive"),
];

impl RouteRegistry {
    /// Registry with the standard route families
    pub fn standard() -> Self {
        let mut routes = Vec::new();
        for kind in ObjectKind::ALL {
            let collection = kind.collection();
            let list_path = match kind {
                ObjectKind::Container => "/containers/json".to_string(),
                _ => format!("/{}", collection),
            };
            routes.push(Route::new(
                Method::GET,
                &list_path,
                vec![Arc::new(FilterRewriter), Arc::new(DescopeList(kind))],
            ));
            routes.push(Route::new(
                Method::POST,
                &format!("/{}/create", collection),
                vec![Arc::new(ScopeCreate(kind))],
            ));
            routes.push(Route::new(
                Method::GET,
                &kind.inspect_path("{name}"),
                vec![Arc::new(ResolvePath(kind)), Arc::new(DescopeObject)],
            ));
            routes.push(Route::new(
                Method::DELETE,
                &format!("/{}/{{name}}", collection),
                vec![Arc::new(ResolvePath(kind))],
            ));
            if matches!(
                kind,
                ObjectKind::Container | ObjectKind::Volume | ObjectKind::Network
            ) {
                routes.push(Route::new(
                    Method::POST,
                    &format!("/{}/prune", collection),
                    vec![Arc::new(FilterRewriter)],
                ));
            }
        }

        for (method, action) in CONTAINER_ACTIONS {
            let method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::POST);
            routes.push(scoped(method, &format!("/containers/{{name}}/{}", action), ObjectKind::Container));
        }
        routes.push(scoped(Method::GET, "/containers/{name}/logs", ObjectKind::Container).cancellable());
        routes.push(scoped(Method::GET, "/containers/{name}/stats", ObjectKind::Container).cancellable());
        routes.push(scoped(Method::POST, "/networks/{name}/connect", ObjectKind::Network));
        routes.push(scoped(Method::POST, "/networks/{name}/disconnect", ObjectKind::Network));
        routes.push(scoped(Method::POST, "/services/{name}/update", ObjectKind::Service));
        routes.push(scoped(Method::GET, "/services/{name}/logs", ObjectKind::Service).cancellable());
        routes.push(scoped(Method::POST, "/secrets/{name}/update", ObjectKind::Secret));
        routes.push(scoped(Method::POST, "/configs/{name}/update", ObjectKind::Config));

        for (method, pattern) in [
            (Method::POST, "/build"),
            (Method::POST, "/images/create"),
            (Method::POST, "/images/{*}/push"),
            (Method::GET, "/events"),
            (Method::POST, "/plugins/pull"),
            (Method::POST, "/plugins/{*}/push"),
        ] {
            routes.push(Route::new(method, pattern, Vec::new()).cancellable());
        }

        Self { routes }
    }

    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// First route matching the request; records the name segment on a match
    pub fn find(&self, request: &mut ProxyRequest) -> Option<&Route> {
        for route in &self.routes {
            if route.method != request.method {
                continue;
            }
            if let Some(name_index) = route.pattern.matches(&request.segments) {
                request.name_index = name_index;
                return Some(route);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn scoped(method: Method, pattern: &str, kind: ObjectKind) -> Route {
    Route::new(method, pattern, vec![Arc::new(ResolvePath(kind))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Uri;

    fn find<'a>(registry: &'a RouteRegistry, method: Method, uri: &str) -> Option<(&'a Route, ProxyRequest)> {
        let mut request = ProxyRequest::parse(method, &uri.parse::<Uri>().unwrap());
        let route = registry.find(&mut request)?;
        Some((route, request))
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = PathPattern::parse("/containers/{name}/json");
        let path = |p: &str| p.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect::<Vec<_>>();
        assert_eq!(pattern.matches(&path("/containers/web/json")), Some(Some(1)));
        assert_eq!(pattern.matches(&path("/containers/web/logs")), None);
        assert_eq!(pattern.matches(&path("/containers/json")), None);

        let rest = PathPattern::parse("/images/{*}/push");
        assert_eq!(rest.matches(&path("/images/library/nginx/push")), Some(None));
        assert_eq!(rest.matches(&path("/images/push")), None);
    }

    #[test]
    fn test_standard_routes() {
        let registry = RouteRegistry::standard();
        assert!(!registry.is_empty());

        let (route, request) = find(&registry, Method::GET, "/v1.47/volumes?filters=%7B%7D").unwrap();
        assert!(route.rewrites_response());
        assert!(!route.needs_body());
        assert_eq!(request.name(), None);

        let (route, request) = find(&registry, Method::GET, "/v1.47/containers/web/json").unwrap();
        assert_eq!(request.name(), Some("web"));
        assert!(route.rewrites_response());

        let (route, _) = find(&registry, Method::POST, "/networks/create").unwrap();
        assert!(route.needs_body());

        let (route, request) = find(&registry, Method::GET, "/containers/web/logs?follow=1").unwrap();
        assert!(route.cancellable);
        assert_eq!(request.name(), Some("web"));

        let (route, _) = find(&registry, Method::POST, "/v1.47/images/library/nginx/push").unwrap();
        assert!(route.cancellable);
        assert!(route.rewriters.is_empty());

        assert!(find(&registry, Method::GET, "/_ping").is_none());
        assert!(find(&registry, Method::PATCH, "/volumes").is_none());
    }
}
