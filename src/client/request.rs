//! Builders for api server requests. URIs are origin-form (path + query);
//! the connection layer adds `Host`, `User-Agent` and `Authorization`.

use crate::client::Error;
use crate::k8s_types::K8sType;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::form_urlencoded;

const APPLY_CONTENT_TYPE: &str = "application/apply-patch+yaml";
const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";
const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

pub(crate) fn list_request(
    k8s_type: &K8sType,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let path = resource_path(k8s_type, namespace, None);
    let req = Request::get(path).body(Body::empty()).unwrap();
    Ok(req)
}

pub(crate) fn get_request(
    k8s_type: &K8sType,
    namespace: &str,
    name: &str,
) -> Result<Request<Body>, Error> {
    let path = resource_path(k8s_type, Some(namespace), Some(name));
    let req = Request::get(path).body(Body::empty()).unwrap();
    Ok(req)
}

pub(crate) fn create_request(k8s_type: &K8sType, resource: &Value) -> Result<Request<Body>, Error> {
    let namespace = resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str);
    let path = resource_path(k8s_type, namespace, None);
    let body = serde_json::to_vec(resource)?;
    let req = Request::post(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    Ok(req)
}

pub(crate) fn update_request(
    k8s_type: &K8sType,
    namespace: &str,
    name: &str,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let path = resource_path(k8s_type, Some(namespace), Some(name));
    let body = serde_json::to_vec(resource)?;
    let req = Request::put(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    Ok(req)
}

/// Server-side apply. The api server rejects bodies carrying
/// `metadata.managedFields`, so it is stripped here. `force=true` takes
/// field ownership from any previous manager.
pub(crate) fn apply_request(
    k8s_type: &K8sType,
    namespace: &str,
    name: &str,
    resource: &Value,
    field_manager: &str,
) -> Result<Request<Body>, Error> {
    let mut resource = resource.clone();
    if let Some(metadata) = resource
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
    {
        metadata.remove("managedFields");
    }

    let query: String = form_urlencoded::Serializer::new(String::new())
        .append_pair("fieldManager", field_manager)
        .append_pair("fieldValidation", "Strict")
        .append_pair("force", "true")
        .finish();
    let path = format!(
        "{}?{}",
        resource_path(k8s_type, Some(namespace), Some(name)),
        query
    );
    let body = serde_json::to_vec(&resource)?;
    let req = Request::patch(path)
        .header(header::CONTENT_TYPE, APPLY_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap();
    Ok(req)
}

pub(crate) fn merge_patch_request(
    k8s_type: &K8sType,
    namespace: &str,
    name: &str,
    subresource: Option<&str>,
    patch: &Value,
) -> Result<Request<Body>, Error> {
    let mut path = resource_path(k8s_type, Some(namespace), Some(name));
    if let Some(subresource) = subresource {
        path.push('/');
        path.push_str(subresource);
    }
    let body = serde_json::to_vec(patch)?;
    let req = Request::patch(path)
        .header(header::CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap();
    Ok(req)
}

pub(crate) fn json_patch_request(
    k8s_type: &K8sType,
    namespace: &str,
    name: &str,
    operations: &Value,
) -> Result<Request<Body>, Error> {
    let path = resource_path(k8s_type, Some(namespace), Some(name));
    let body = serde_json::to_vec(operations)?;
    let req = Request::patch(path)
        .header(header::CONTENT_TYPE, JSON_PATCH_CONTENT_TYPE)
        .body(Body::from(body))
        .unwrap();
    Ok(req)
}

pub(crate) fn delete_request(
    k8s_type: &K8sType,
    namespace: &str,
    name: &str,
) -> Result<Request<Body>, Error> {
    let path = resource_path(k8s_type, Some(namespace), Some(name));
    let req = Request::builder()
        .method(Method::DELETE)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    Ok(req)
}

pub(crate) fn watch_request(
    k8s_type: &K8sType,
    namespace: Option<&str>,
    resource_version: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("watch", "1");
    query.append_pair("allowWatchBookmarks", "true");
    if let Some(version) = resource_version {
        query.append_pair("resourceVersion", version);
    }
    let path = format!(
        "{}?{}",
        resource_path(k8s_type, namespace, None),
        query.finish()
    );
    let req = Request::get(path).body(Body::empty()).unwrap();
    Ok(req)
}

fn resource_path(k8s_type: &K8sType, namespace: Option<&str>, name: Option<&str>) -> String {
    let mut path = String::with_capacity(64);
    if k8s_type.group.is_empty() {
        path.push_str("/api");
    } else {
        path.push_str("/apis/");
        path.push_str(k8s_type.group);
    }
    path.push('/');
    path.push_str(k8s_type.version);
    if let Some(namespace) = namespace {
        path.push_str("/namespaces/");
        path.push_str(namespace);
    }
    path.push('/');
    path.push_str(k8s_type.plural_kind);
    if let Some(name) = name {
        path.push('/');
        path.push_str(name);
    }
    path
}
