//! Normalized entities
//!
//! Stable shapes the rest of the console works with, independent of which
//! API version (or the mock backend) produced them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived runtime state of a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Shutoff,
    Building,
    Paused,
    Error,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Running => "Running",
            PowerState::Shutoff => "Shutoff",
            PowerState::Building => "Building",
            PowerState::Paused => "Paused",
            PowerState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Id plus an optional display name filled in by a later join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl NamedRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Name when known, id otherwise.
    pub fn display(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: String,
    pub power_state: PowerState,
    pub flavor: NamedRef,
    pub image: NamedRef,
    pub ip_address: String,
    pub key_pair: Option<String>,
    pub security_groups: Vec<String>,
    pub volumes_attached: Vec<String>,
    pub created: Option<String>,
    pub availability_zone: Option<String>,
    pub user_id: Option<String>,
    pub host_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub server_id: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    /// Size in GB.
    pub size: u64,
    pub status: String,
    pub volume_type: Option<String>,
    /// "true"/"false", exactly as Cinder reports it.
    pub bootable: String,
    pub attachments: Vec<VolumeAttachment>,
    pub availability_zone: Option<String>,
    pub created: Option<String>,
}

impl Volume {
    pub fn is_available(&self) -> bool {
        self.status.eq_ignore_ascii_case("available")
    }

    /// Instance the volume is attached to, if any.
    pub fn attached_to(&self) -> Option<&str> {
        self.attachments.first().map(|a| a.server_id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    #[serde(default)]
    pub security_group_id: Option<String>,
    pub direction: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub port_range_min: Option<u32>,
    #[serde(default)]
    pub port_range_max: Option<u32>,
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
    pub ethertype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub rules: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub subnet_ids: Vec<String>,
    pub shared: bool,
    pub status: String,
    pub admin_state_up: bool,
    pub external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPool {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub cidr: String,
    pub ip_version: u8,
    #[serde(default)]
    pub gateway_ip: Option<String>,
    #[serde(default)]
    pub enable_dhcp: bool,
    #[serde(default)]
    pub allocation_pools: Vec<AllocationPool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGateway {
    pub network_id: String,
    #[serde(default)]
    pub enable_snat: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    pub name: String,
    pub status: String,
    pub admin_state_up: bool,
    #[serde(default)]
    pub external_gateway_info: Option<ExternalGateway>,
    #[serde(default)]
    pub ha: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub mac_address: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    /// External network the address was allocated from.
    pub floating_network_id: String,
    #[serde(default)]
    pub fixed_ip_address: Option<String>,
    #[serde(default)]
    pub port_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub vcpus: u32,
    /// RAM in MB.
    pub ram: u64,
    /// Root disk in GB.
    pub disk: u64,
    pub is_public: bool,
    pub ephemeral: u64,
    /// Swap in MB.
    pub swap: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Nova keys key pairs by name.
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: String,
    pub visibility: String,
    /// Bytes.
    pub size: Option<u64>,
    pub min_disk: u64,
    pub min_ram: u64,
    pub created: Option<String>,
    pub os_distro: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub resource: String,
    /// `Quota::UNKNOWN` when usage was not computed.
    pub used: i64,
    pub limit: i64,
}

impl Quota {
    pub const UNKNOWN: i64 = -1;

    pub fn limit_only(resource: &str, limit: Option<i64>) -> Self {
        Self {
            resource: resource.to_string(),
            used: Self::UNKNOWN,
            limit: limit.unwrap_or(Self::UNKNOWN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneDomain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneUser {
    pub id: String,
    pub name: String,
    pub domain_id: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One entry of Nova's per-server action log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAction {
    pub action: String,
    pub request_id: String,
    pub instance_uuid: String,
    pub start_time: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    #[serde(rename = "type")]
    pub console_type: String,
    pub url: String,
}
