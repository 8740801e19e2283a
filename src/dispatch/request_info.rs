//! Request classification against the Kubernetes API path layout.
//!
//! Mirrors the apiserver's request-info resolution: `/api/{version}/...` for
//! the core group, `/apis/{group}/{version}/...` for named groups, namespace
//! scoping, subresources, the legacy `/watch/` prefix, and `?watch=true`
//! promotion of list requests. Anything outside the two API prefixes is a
//! non-resource request classified by its lower-cased method.

use http::{Method, Uri};

/// Subresources of `namespaces` that do not start a nested resource path.
const NAMESPACE_SUBRESOURCES: &[&str] = &["status", "finalize"];

/// Verbs addressing whole collections rather than single objects.
const SPECIAL_VERBS_NO_SUBRESOURCES: &[&str] = &["proxy", "watch"];

/// Classification of one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub is_resource_request: bool,
    pub verb: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
    /// Path segments from the resource onward.
    pub parts: Vec<String>,
    pub path: String,
}

impl RequestInfo {
    /// Classify a request by method, path, and query.
    pub fn parse(method: &Method, uri: &Uri) -> Self {
        let path = uri.path().to_string();
        let mut info = Self {
            verb: method.as_str().to_ascii_lowercase(),
            path: path.clone(),
            ..Default::default()
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        // A resource path is at least /api/{version} or /apis/{group}/{version}.
        let rest: &[&str] = match segments.split_first() {
            Some((&"api", rest)) if !rest.is_empty() => {
                info.api_version = rest[0].to_string();
                &rest[1..]
            }
            Some((&"apis", rest)) if rest.len() >= 2 => {
                info.api_group = rest[0].to_string();
                info.api_version = rest[1].to_string();
                &rest[2..]
            }
            _ => return info,
        };
        if rest.is_empty() {
            // Discovery request for the group/version itself.
            return info;
        }

        info.is_resource_request = true;
        info.verb = match *method {
            Method::GET | Method::HEAD => "get",
            Method::POST => "create",
            Method::PUT => "update",
            Method::PATCH => "patch",
            Method::DELETE => "delete",
            _ => "",
        }
        .to_string();

        let mut current: &[&str] = rest;
        if current[0] == "watch" {
            // Legacy watch prefix: /api/v1/watch/namespaces/ns/pods
            info.verb = "watch".to_string();
            current = &current[1..];
            if current.is_empty() {
                info.is_resource_request = false;
                info.verb = method.as_str().to_ascii_lowercase();
                return info;
            }
        }

        if current[0] == "namespaces" {
            if current.len() > 1 {
                info.namespace = current[1].to_string();
                if current.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&current[2]) {
                    current = &current[2..];
                }
            }
        }

        info.parts = current.iter().map(|s| s.to_string()).collect();
        if info.parts.len() >= 3 && !SPECIAL_VERBS_NO_SUBRESOURCES.contains(&info.verb.as_str()) {
            info.subresource = info.parts[2].clone();
        }
        if info.parts.len() >= 2 {
            info.name = info.parts[1].clone();
        }
        if !info.parts.is_empty() {
            info.resource = info.parts[0].clone();
        }

        // No object name on a get means the collection was addressed.
        if info.name.is_empty() && info.verb == "get" {
            info.verb = if wants_watch(uri) {
                "watch".to_string()
            } else {
                "list".to_string()
            };
        }
        if info.name.is_empty() && info.verb == "delete" {
            info.verb = "deletecollection".to_string();
        }

        info
    }

    /// Long-running requests hold their admission permit for their full
    /// lifetime and bypass any inactivity handling.
    pub fn is_long_running(&self) -> bool {
        if !self.is_resource_request {
            return false;
        }
        matches!(self.verb.as_str(), "watch" | "proxy")
            || matches!(
                self.subresource.as_str(),
                "attach" | "exec" | "proxy" | "log" | "portforward"
            )
    }
}

fn wants_watch(uri: &Uri) -> bool {
    let Some(query) = uri.query() else {
        return false;
    };
    query.split('&').any(|pair| {
        let mut kv = pair.splitn(2, '=');
        kv.next() == Some("watch")
            && matches!(kv.next(), Some("true") | Some("1") | None | Some(""))
    })
}
