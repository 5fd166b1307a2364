//! Deterministic naming and labelling of engine objects

use paygate_common::ResourceType;
use std::collections::HashMap;

/// Present on every container and image this service owns. Listing filters
/// on it so unrelated containers on the host are never touched.
pub const MANAGED_LABEL: &str = "paygate.managed";
pub const RESOURCE_ID_LABEL: &str = "paygate.resource-id";
pub const RESOURCE_TYPE_LABEL: &str = "paygate.resource-type";
pub const PORT_LABEL: &str = "paygate.port";

pub fn container_name(resource_id: &str) -> String {
    format!("paygate-{}", resource_id)
}

pub fn image_tag(resource_id: &str) -> String {
    format!("paygate-resource-{}:latest", resource_id)
}

/// Labels stamped on a resource image
pub fn image_labels(resource_id: &str, resource_type: ResourceType) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (RESOURCE_ID_LABEL.to_string(), resource_id.to_string()),
        (RESOURCE_TYPE_LABEL.to_string(), resource_type.to_string()),
    ])
}

/// Labels that let the reverse proxy route `https://{id}.{base_domain}` to
/// the container's internal port without per-deploy proxy configuration.
pub fn routing_labels(
    resource_id: &str,
    resource_type: ResourceType,
    port: u16,
    base_domain: &str,
) -> HashMap<String, String> {
    let router = container_name(resource_id);
    let host = format!("{}.{}", resource_id, base_domain.trim_matches('.'));

    let mut labels = image_labels(resource_id, resource_type);
    labels.insert(PORT_LABEL.to_string(), port.to_string());
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.routers.{}.rule", router),
        format!("Host(`{}`)", host),
    );
    labels.insert(
        format!("traefik.http.routers.{}.entrypoints", router),
        "websecure".to_string(),
    );
    labels.insert(
        format!("traefik.http.routers.{}.tls.certresolver", router),
        "letsencrypt".to_string(),
    );
    labels.insert(
        format!("traefik.http.services.{}.loadbalancer.server.port", router),
        port.to_string(),
    );
    labels
}
