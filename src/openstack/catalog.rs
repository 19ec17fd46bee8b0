//! Service catalog and endpoint resolution
//!
//! Keystone hands out the catalog at login. Every operation looks its base
//! URL up here, so resolution is a pure in-memory scan.

use super::error::ServiceKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Endpoint visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    #[default]
    Public,
    Internal,
    Admin,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interface::Public => "public",
            Interface::Internal => "internal",
            Interface::Admin => "admin",
        })
    }
}

impl FromStr for Interface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Interface::Public),
            "internal" => Ok(Interface::Internal),
            "admin" => Ok(Interface::Admin),
            other => Err(format!("unknown endpoint interface '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub region: Option<String>,
    pub interface: Interface,
    pub url: String,
    #[serde(default)]
    pub region_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCatalogEntry {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

/// Block storage registers under several type names depending on release.
pub const VOLUME_SERVICE_TYPES: &[&str] = &["volumev3", "volumev2", "volume"];

/// Resolve the base URL for `service_type`.
///
/// Picks the first endpoint with the requested interface (and region, when
/// given). If no endpoint in that region exists, any endpoint with the right
/// interface is used. Trailing slashes are stripped.
pub fn resolve_endpoint(
    catalog: &[ServiceCatalogEntry],
    service_type: &str,
    interface: Interface,
    region: Option<&str>,
) -> Option<String> {
    let service = catalog.iter().find(|s| s.service_type == service_type)?;

    let by_region = |e: &&ServiceEndpoint| match region {
        Some(r) => e.region.as_deref() == Some(r) || e.region_id.as_deref() == Some(r),
        None => true,
    };

    let endpoint = service
        .endpoints
        .iter()
        .filter(|e| e.interface == interface)
        .find(by_region)
        .or_else(|| {
            region?;
            service.endpoints.iter().find(|e| e.interface == interface)
        })?;

    Some(endpoint.url.trim_end_matches('/').to_string())
}

/// Resolve the block storage endpoint, newest API type first.
pub fn resolve_volume_endpoint(
    catalog: &[ServiceCatalogEntry],
    interface: Interface,
    region: Option<&str>,
) -> Option<String> {
    VOLUME_SERVICE_TYPES
        .iter()
        .find_map(|t| resolve_endpoint(catalog, t, interface, region))
}

/// Interface and region preference applied to every lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSelector {
    pub interface: Interface,
    pub region: Option<String>,
}

impl EndpointSelector {
    pub fn resolve(&self, catalog: &[ServiceCatalogEntry], kind: ServiceKind) -> Option<String> {
        let region = self.region.as_deref();
        match kind {
            ServiceKind::Compute => resolve_endpoint(catalog, "compute", self.interface, region),
            ServiceKind::Volume => resolve_volume_endpoint(catalog, self.interface, region),
            ServiceKind::Network => resolve_endpoint(catalog, "network", self.interface, region),
            ServiceKind::Image => resolve_endpoint(catalog, "image", self.interface, region),
            ServiceKind::Identity => resolve_endpoint(catalog, "identity", self.interface, region),
        }
    }
}

/// Join a resource path onto a service base URL, inserting the API version
/// segment unless the base already ends with it.
///
/// `http://host/network` + `v2.0` + `networks` -> `http://host/network/v2.0/networks`
/// `http://host/network/v2.0` + `v2.0` + `networks` -> same
pub fn build_service_path(base_url: &str, version_segment: &str, resource_path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let resource = resource_path.trim_start_matches('/');
    if base.ends_with(&format!("/{}", version_segment)) {
        format!("{}/{}", base, resource)
    } else {
        format!("{}/{}/{}", base, version_segment, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(interface: Interface, region: &str, url: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            id: format!("ep-{}-{}", interface, region),
            region: Some(region.to_string()),
            interface,
            url: url.to_string(),
            region_id: Some(region.to_string()),
        }
    }

    fn entry(service_type: &str, endpoints: Vec<ServiceEndpoint>) -> ServiceCatalogEntry {
        ServiceCatalogEntry {
            id: format!("cat-{}", service_type),
            service_type: service_type.to_string(),
            name: service_type.to_string(),
            endpoints,
        }
    }

    #[test]
    fn test_resolve_strips_trailing_slash() {
        let catalog = vec![entry(
            "compute",
            vec![endpoint(
                Interface::Public,
                "RegionOne",
                "https://nova.example.com/v2.1/proj/",
            )],
        )];
        assert_eq!(
            resolve_endpoint(&catalog, "compute", Interface::Public, None).as_deref(),
            Some("https://nova.example.com/v2.1/proj")
        );
    }

    #[test]
    fn test_resolve_absent_service_type() {
        let catalog = vec![entry(
            "compute",
            vec![endpoint(Interface::Public, "RegionOne", "https://nova")],
        )];
        assert_eq!(resolve_endpoint(&catalog, "network", Interface::Public, None), None);
        assert_eq!(resolve_endpoint(&[], "compute", Interface::Public, None), None);
    }

    #[test]
    fn test_resolve_no_matching_interface() {
        let catalog = vec![entry(
            "compute",
            vec![endpoint(Interface::Internal, "RegionOne", "http://nova.internal")],
        )];
        assert_eq!(resolve_endpoint(&catalog, "compute", Interface::Public, None), None);
        assert_eq!(
            resolve_endpoint(&catalog, "compute", Interface::Public, Some("RegionOne")),
            None
        );
    }

    #[test]
    fn test_resolve_prefers_region_match() {
        let catalog = vec![entry(
            "network",
            vec![
                endpoint(Interface::Public, "RegionOne", "https://one.example.com:9696"),
                endpoint(Interface::Public, "RegionTwo", "https://two.example.com:9696"),
                endpoint(Interface::Internal, "RegionTwo", "http://two.internal:9696"),
            ],
        )];
        assert_eq!(
            resolve_endpoint(&catalog, "network", Interface::Public, Some("RegionTwo")).as_deref(),
            Some("https://two.example.com:9696")
        );
        assert_eq!(
            resolve_endpoint(&catalog, "network", Interface::Internal, Some("RegionTwo"))
                .as_deref(),
            Some("http://two.internal:9696")
        );
    }

    #[test]
    fn test_resolve_falls_back_when_region_missing() {
        let catalog = vec![entry(
            "image",
            vec![
                endpoint(Interface::Admin, "RegionOne", "http://glance.admin"),
                endpoint(Interface::Public, "RegionOne", "https://glance.example.com/"),
            ],
        )];
        assert_eq!(
            resolve_endpoint(&catalog, "image", Interface::Public, Some("Nowhere")).as_deref(),
            Some("https://glance.example.com")
        );
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let catalog = vec![entry(
            "compute",
            vec![
                endpoint(Interface::Public, "RegionOne", "https://first"),
                endpoint(Interface::Public, "RegionOne", "https://second"),
            ],
        )];
        assert_eq!(
            resolve_endpoint(&catalog, "compute", Interface::Public, None).as_deref(),
            Some("https://first")
        );
    }

    #[test]
    fn test_volume_endpoint_fallback_order() {
        let catalog = vec![
            entry("volume", vec![endpoint(Interface::Public, "R", "https://v1")]),
            entry("volumev2", vec![endpoint(Interface::Public, "R", "https://v2")]),
        ];
        assert_eq!(
            resolve_volume_endpoint(&catalog, Interface::Public, None).as_deref(),
            Some("https://v2")
        );

        let catalog = vec![
            entry("volumev2", vec![endpoint(Interface::Public, "R", "https://v2")]),
            entry("volumev3", vec![endpoint(Interface::Public, "R", "https://v3/")]),
        ];
        assert_eq!(
            resolve_volume_endpoint(&catalog, Interface::Public, None).as_deref(),
            Some("https://v3")
        );
    }

    #[test]
    fn test_build_service_path_inserts_version() {
        assert_eq!(
            build_service_path("http://host/network", "v2.0", "networks"),
            "http://host/network/v2.0/networks"
        );
        assert_eq!(
            build_service_path("http://host:9292", "v2", "/images"),
            "http://host:9292/v2/images"
        );
    }

    #[test]
    fn test_build_service_path_no_duplicate_version() {
        assert_eq!(
            build_service_path("http://host/network/v2.0", "v2.0", "floatingips/fip-1"),
            "http://host/network/v2.0/floatingips/fip-1"
        );
        assert_eq!(
            build_service_path("http://host/identity/v3", "v3", "users"),
            "http://host/identity/v3/users"
        );
    }

    #[test]
    fn test_selector_resolves_by_kind() {
        let catalog = vec![
            entry("volumev2", vec![endpoint(Interface::Internal, "R2", "http://cinder.internal")]),
            entry("identity", vec![endpoint(Interface::Public, "R1", "https://keystone/v3")]),
        ];
        let selector = EndpointSelector {
            interface: Interface::Internal,
            region: Some("R2".to_string()),
        };
        assert_eq!(
            selector.resolve(&catalog, ServiceKind::Volume).as_deref(),
            Some("http://cinder.internal")
        );
        assert_eq!(selector.resolve(&catalog, ServiceKind::Identity), None);
        assert_eq!(
            EndpointSelector::default()
                .resolve(&catalog, ServiceKind::Identity)
                .as_deref(),
            Some("https://keystone/v3")
        );
    }

    #[test]
    fn test_interface_parse() {
        assert_eq!("Internal".parse::<Interface>(), Ok(Interface::Internal));
        assert!("private".parse::<Interface>().is_err());
    }

    #[test]
    fn test_catalog_deserializes_keystone_shape() {
        let raw = serde_json::json!({
            "id": "abc",
            "type": "compute",
            "name": "nova",
            "endpoints": [
                {"id": "e1", "interface": "public", "region": "RegionOne",
                 "region_id": "RegionOne", "url": "https://nova.example.com/v2.1"}
            ]
        });
        let entry: ServiceCatalogEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(entry.service_type, "compute");
        assert_eq!(entry.endpoints[0].interface, Interface::Public);
    }
}
