//! The operation set shared by the remote and mock backends.
//!
//! Every method takes the bearer token and the already-resolved base URL of
//! its service. Nothing here validates input; failures come from the backend.

use super::catalog::{EndpointSelector, ServiceCatalogEntry};
use super::error::Result;
use super::model::{
    ConsoleInfo, Flavor, FloatingIp, Image, Instance, InstanceAction, KeyPair, KeystoneDomain,
    KeystoneUser, Network, Port, Quota, Router, SecurityGroup, SecurityGroupRule, Subnet, Volume,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootType {
    Soft,
    Hard,
}

/// Power actions sent through the server action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Reboot(RebootType),
}

impl PowerAction {
    pub fn action_body(&self) -> Value {
        match self {
            PowerAction::Start => json!({ "os-start": null }),
            PowerAction::Stop => json!({ "os-stop": null }),
            PowerAction::Reboot(RebootType::Soft) => json!({ "reboot": { "type": "SOFT" } }),
            PowerAction::Reboot(RebootType::Hard) => json!({ "reboot": { "type": "HARD" } }),
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Reboot(RebootType::Soft) => "reboot",
            PowerAction::Reboot(RebootType::Hard) => "hard reboot",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleType {
    #[default]
    NoVnc,
    SpiceHtml5,
    Serial,
}

impl ConsoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleType::NoVnc => "novnc",
            ConsoleType::SpiceHtml5 => "spice-html5",
            ConsoleType::Serial => "serial",
        }
    }

    pub fn action_body(&self) -> Value {
        match self {
            ConsoleType::NoVnc => json!({ "os-getVNCConsole": { "type": "novnc" } }),
            ConsoleType::SpiceHtml5 => json!({ "os-getSPICEConsole": { "type": "spice-html5" } }),
            ConsoleType::Serial => json!({ "os-getSerialConsole": { "type": "serial" } }),
        }
    }
}

impl fmt::Display for ConsoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsoleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "novnc" | "vnc" => Ok(ConsoleType::NoVnc),
            "spice-html5" | "spice" => Ok(ConsoleType::SpiceHtml5),
            "serial" => Ok(ConsoleType::Serial),
            other => Err(format!("Unsupported console type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchInstanceParams {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub key_pair: Option<String>,
    /// Security group names.
    pub security_groups: Vec<String>,
    /// Empty means automatic network allocation.
    pub network_ids: Vec<String>,
}

impl LaunchInstanceParams {
    pub fn request_body(&self) -> Value {
        let networks: Vec<Value> = if self.network_ids.is_empty() {
            vec![json!({ "uuid": "auto" })]
        } else {
            self.network_ids.iter().map(|id| json!({ "uuid": id })).collect()
        };

        let mut server = json!({
            "name": self.name,
            "imageRef": self.image_id,
            "flavorRef": self.flavor_id,
            "networks": networks,
        });
        if let Some(key) = &self.key_pair {
            server["key_name"] = json!(key);
        }
        if !self.security_groups.is_empty() {
            server["security_groups"] = self
                .security_groups
                .iter()
                .map(|name| json!({ "name": name }))
                .collect();
        }
        json!({ "server": server })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateVolumeParams {
    pub name: String,
    /// GB.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

/// Neutron port filters. Unset fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortQuery {
    pub device_id: Option<String>,
    pub network_id: Option<String>,
    pub device_owner: Option<String>,
}

impl PortQuery {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        [
            ("device_id", &self.device_id),
            ("network_id", &self.network_id),
            ("device_owner", &self.device_owner),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.clone().map(|v| (k, v)))
        .collect()
    }

    pub fn matches(&self, port: &Port) -> bool {
        self.device_id.as_ref().map_or(true, |d| &port.device_id == d)
            && self.network_id.as_ref().map_or(true, |n| &port.network_id == n)
            && self
                .device_owner
                .as_ref()
                .map_or(true, |o| &port.device_owner == o)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NewSecurityGroupRule {
    pub security_group_id: String,
    /// "ingress" or "egress".
    pub direction: String,
    /// "IPv4" or "IPv6".
    pub ethertype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_group_id: Option<String>,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct CreateUserRequest {
    pub name: String,
    pub domain_id: String,
    pub password: Option<Zeroizing<String>>,
    pub enabled: bool,
    pub description: Option<String>,
    pub email: Option<String>,
}

impl fmt::Debug for CreateUserRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateUserRequest")
            .field("name", &self.name)
            .field("domain_id", &self.domain_id)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("enabled", &self.enabled)
            .field("description", &self.description)
            .field("email", &self.email)
            .finish()
    }
}

impl CreateUserRequest {
    pub fn request_body(&self) -> Value {
        let mut user = json!({
            "name": self.name,
            "domain_id": self.domain_id,
            "enabled": self.enabled,
        });
        if let Some(password) = &self.password {
            user["password"] = json!(password.as_str());
        }
        if let Some(description) = &self.description {
            user["description"] = json!(description);
        }
        if let Some(email) = &self.email {
            user["email"] = json!(email);
        }
        json!({ "user": user })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One implementation talks to OpenStack, the other to an in-memory store.
#[async_trait]
pub trait CloudOperations: Send + Sync {
    /// Short name for logs.
    fn backend_name(&self) -> &'static str;

    // Compute
    async fn list_instances(&self, token: &str, compute_url: &str) -> Result<Vec<Instance>>;
    async fn get_instance(&self, token: &str, compute_url: &str, instance_id: &str)
        -> Result<Instance>;
    async fn launch_instance(
        &self,
        token: &str,
        compute_url: &str,
        params: &LaunchInstanceParams,
    ) -> Result<Instance>;
    async fn terminate_instance(&self, token: &str, compute_url: &str, instance_id: &str)
        -> Result<()>;
    async fn control_instance_power(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        action: PowerAction,
    ) -> Result<()>;
    async fn get_console_url(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        console_type: ConsoleType,
    ) -> Result<ConsoleInfo>;
    async fn shelve_instance(&self, token: &str, compute_url: &str, instance_id: &str)
        -> Result<()>;
    async fn unshelve_instance(&self, token: &str, compute_url: &str, instance_id: &str)
        -> Result<()>;
    async fn list_instance_actions(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceAction>>;
    async fn list_flavors(&self, token: &str, compute_url: &str) -> Result<Vec<Flavor>>;
    async fn list_key_pairs(&self, token: &str, compute_url: &str) -> Result<Vec<KeyPair>>;
    async fn attach_volume(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<()>;
    /// Callers pass the volume id as `attachment_id`.
    async fn detach_volume(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        attachment_id: &str,
    ) -> Result<()>;

    // Block storage
    async fn list_volumes(&self, token: &str, volume_url: &str) -> Result<Vec<Volume>>;
    async fn create_volume(
        &self,
        token: &str,
        volume_url: &str,
        params: &CreateVolumeParams,
    ) -> Result<Volume>;
    async fn delete_volume(&self, token: &str, volume_url: &str, volume_id: &str) -> Result<()>;

    // Network
    async fn list_networks(&self, token: &str, network_url: &str) -> Result<Vec<Network>>;
    async fn list_subnets(
        &self,
        token: &str,
        network_url: &str,
        network_id: Option<&str>,
    ) -> Result<Vec<Subnet>>;
    async fn list_routers(&self, token: &str, network_url: &str) -> Result<Vec<Router>>;
    async fn list_ports(&self, token: &str, network_url: &str, query: &PortQuery)
        -> Result<Vec<Port>>;
    async fn list_floating_ips(&self, token: &str, network_url: &str) -> Result<Vec<FloatingIp>>;
    async fn allocate_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        pool_network_id: &str,
    ) -> Result<FloatingIp>;
    async fn release_floating_ip(&self, token: &str, network_url: &str, fip_id: &str)
        -> Result<()>;
    async fn associate_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        fip_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp>;
    async fn disassociate_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        fip_id: &str,
    ) -> Result<FloatingIp>;
    async fn list_security_groups(&self, token: &str, network_url: &str)
        -> Result<Vec<SecurityGroup>>;
    async fn create_security_group(
        &self,
        token: &str,
        network_url: &str,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup>;
    async fn delete_security_group(&self, token: &str, network_url: &str, group_id: &str)
        -> Result<()>;
    async fn add_security_group_rule(
        &self,
        token: &str,
        network_url: &str,
        rule: &NewSecurityGroupRule,
    ) -> Result<SecurityGroupRule>;
    async fn delete_security_group_rule(
        &self,
        token: &str,
        network_url: &str,
        rule_id: &str,
    ) -> Result<()>;

    // Image
    async fn list_images(&self, token: &str, image_url: &str) -> Result<Vec<Image>>;

    // Quotas
    /// Compute, volume and network quota lines. A failing service only drops
    /// its own lines.
    async fn fetch_all_quotas(
        &self,
        token: &str,
        catalog: &[ServiceCatalogEntry],
        selector: &EndpointSelector,
        project_id: Option<&str>,
    ) -> Result<Vec<Quota>>;

    // Identity
    async fn list_domains(&self, token: &str, identity_url: &str) -> Result<Vec<KeystoneDomain>>;
    async fn list_users(&self, token: &str, identity_url: &str) -> Result<Vec<KeystoneUser>>;
    async fn create_user(
        &self,
        token: &str,
        identity_url: &str,
        request: &CreateUserRequest,
    ) -> Result<KeystoneUser>;
    async fn delete_user(&self, token: &str, identity_url: &str, user_id: &str) -> Result<()>;
    async fn update_user(
        &self,
        token: &str,
        identity_url: &str,
        user_id: &str,
        update: &UserUpdate,
    ) -> Result<KeystoneUser>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_power_action_envelopes() {
        assert_eq!(PowerAction::Start.action_body(), json!({"os-start": null}));
        assert_eq!(PowerAction::Stop.action_body(), json!({"os-stop": null}));
        assert_eq!(
            PowerAction::Reboot(RebootType::Soft).action_body(),
            json!({"reboot": {"type": "SOFT"}})
        );
        assert_eq!(
            PowerAction::Reboot(RebootType::Hard).action_body(),
            json!({"reboot": {"type": "HARD"}})
        );
    }

    #[test]
    fn test_console_envelopes() {
        assert_eq!(
            ConsoleType::NoVnc.action_body(),
            json!({"os-getVNCConsole": {"type": "novnc"}})
        );
        assert_eq!(
            ConsoleType::SpiceHtml5.action_body(),
            json!({"os-getSPICEConsole": {"type": "spice-html5"}})
        );
        assert_eq!(
            "serial".parse::<ConsoleType>().unwrap().action_body(),
            json!({"os-getSerialConsole": {"type": "serial"}})
        );
        assert!("rdp".parse::<ConsoleType>().is_err());
    }

    #[test]
    fn test_launch_body_auto_network() {
        let params = LaunchInstanceParams {
            name: "web".into(),
            image_id: "img-1".into(),
            flavor_id: "f-2".into(),
            ..Default::default()
        };
        assert_eq!(
            params.request_body(),
            json!({"server": {"name": "web", "imageRef": "img-1", "flavorRef": "f-2",
                              "networks": [{"uuid": "auto"}]}})
        );
    }

    #[test]
    fn test_launch_body_full() {
        let params = LaunchInstanceParams {
            name: "web".into(),
            image_id: "img-1".into(),
            flavor_id: "f-2".into(),
            key_pair: Some("my-key".into()),
            security_groups: vec!["default".into(), "web-sg".into()],
            network_ids: vec!["net-1".into()],
        };
        let body = params.request_body();
        assert_eq!(body["server"]["key_name"], "my-key");
        assert_eq!(
            body["server"]["security_groups"],
            json!([{"name": "default"}, {"name": "web-sg"}])
        );
        assert_eq!(body["server"]["networks"], json!([{"uuid": "net-1"}]));
    }

    #[test]
    fn test_port_query_params_skip_unset() {
        let query = PortQuery {
            network_id: Some("net-1".into()),
            device_owner: Some("compute:nova".into()),
            ..Default::default()
        };
        assert_eq!(
            query.params(),
            vec![
                ("network_id", "net-1".to_string()),
                ("device_owner", "compute:nova".to_string())
            ]
        );
        assert!(PortQuery::default().params().is_empty());
    }

    #[test]
    fn test_create_user_body_and_debug() {
        let request = CreateUserRequest {
            name: "bob".into(),
            domain_id: "default".into(),
            password: Some(Zeroizing::new("hunter2".into())),
            enabled: true,
            description: Some("ops".into()),
            email: None,
        };
        let body = request.request_body();
        assert_eq!(body["user"]["password"], "hunter2");
        assert_eq!(body["user"]["enabled"], true);
        assert!(body["user"].get("email").is_none());
        assert!(!format!("{:?}", request).contains("hunter2"));
    }

    #[test]
    fn test_user_update_serializes_only_set_fields() {
        let update = UserUpdate {
            enabled: Some(false),
            name: None,
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"enabled": false})
        );
    }
}
