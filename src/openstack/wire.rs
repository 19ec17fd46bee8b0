//! Raw response shapes, as the services send them.
//!
//! Everything defaults so that partial bodies (e.g. Nova's terse create
//! response) still decode. Shapes that already match the normalized model
//! are decoded straight into `model` types.

use super::model::{
    ConsoleInfo, FloatingIp, InstanceAction, KeystoneDomain, KeystoneUser, Port, Router,
    SecurityGroupRule, Subnet,
};
use serde::Deserialize;
use serde_json::{Map, Value};

// --- Nova ---

#[derive(Debug, Default, Clone, Deserialize)]
pub struct IdRef {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NameRef {
    #[serde(default)]
    pub name: String,
}

/// Flavor reference on a server. Microversion 2.47+ drops `id` in favour of
/// an embedded flavor with `original_name`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFlavorRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub original_name: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawServer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "OS-EXT-STS:power_state")]
    pub power_state: Option<i64>,
    #[serde(default)]
    pub flavor: ServerFlavorRef,
    /// `{"id": ...}` or `""` for volume-backed servers.
    #[serde(default)]
    pub image: Value,
    /// Network name -> list of `{addr, version, ...}`, in server order.
    #[serde(default)]
    pub addresses: Map<String, Value>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<NameRef>,
    #[serde(default, rename = "os-extended-volumes:volumes_attached")]
    pub volumes_attached: Vec<IdRef>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default, rename = "OS-EXT-AZ:availability_zone")]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, rename = "OS-EXT-SRV-ATTR:host")]
    pub host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServersRsp {
    #[serde(default)]
    pub servers: Vec<RawServer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerRsp {
    #[serde(default)]
    pub server: RawServer,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawFlavor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vcpus: u32,
    #[serde(default)]
    pub ram: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default, rename = "os-flavor-access:is_public")]
    pub is_public: Option<bool>,
    #[serde(default, rename = "OS-FLV-EXT-DATA:ephemeral")]
    pub ephemeral: Option<u64>,
    /// `""`, a number, or a numeric string depending on release.
    #[serde(default)]
    pub swap: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlavorsRsp {
    #[serde(default)]
    pub flavors: Vec<RawFlavor>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawKeyPair {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub public_key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyPairEnvelope {
    #[serde(default)]
    pub keypair: RawKeyPair,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyPairsRsp {
    #[serde(default)]
    pub keypairs: Vec<KeyPairEnvelope>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceActionsRsp {
    #[serde(default, rename = "instanceActions")]
    pub instance_actions: Vec<InstanceAction>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleRsp {
    #[serde(default)]
    pub console: Option<ConsoleInfo>,
    /// Microversion 2.6+ answers `remote_console` instead.
    #[serde(default)]
    pub remote_console: Option<ConsoleInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NovaQuotaSet {
    #[serde(default)]
    pub instances: Option<i64>,
    #[serde(default)]
    pub cores: Option<i64>,
    #[serde(default)]
    pub ram: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NovaQuotaRsp {
    #[serde(default)]
    pub quota_set: NovaQuotaSet,
}

// --- Cinder ---

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawVolumeAttachment {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub volume_id: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawVolume {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub volume_type: Option<String>,
    /// Cinder sends a string; some deployments a bool.
    #[serde(default)]
    pub bootable: Value,
    #[serde(default)]
    pub attachments: Vec<RawVolumeAttachment>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VolumesRsp {
    #[serde(default)]
    pub volumes: Vec<RawVolume>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VolumeRsp {
    #[serde(default)]
    pub volume: RawVolume,
}

#[derive(Debug, Default, Deserialize)]
pub struct CinderQuotaSet {
    #[serde(default)]
    pub volumes: Option<i64>,
    #[serde(default)]
    pub gigabytes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CinderQuotaRsp {
    #[serde(default)]
    pub quota_set: CinderQuotaSet,
}

// --- Neutron ---

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawNetwork {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub admin_state_up: bool,
    #[serde(default, rename = "router:external")]
    pub external: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworksRsp {
    #[serde(default)]
    pub networks: Vec<RawNetwork>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubnetsRsp {
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoutersRsp {
    #[serde(default)]
    pub routers: Vec<Router>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortsRsp {
    #[serde(default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FloatingIpsRsp {
    #[serde(default)]
    pub floatingips: Vec<FloatingIp>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FloatingIpRsp {
    #[serde(default)]
    pub floatingip: Option<FloatingIp>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawSecurityGroup {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub security_group_rules: Option<Vec<SecurityGroupRule>>,
    #[serde(default)]
    pub rules: Option<Vec<SecurityGroupRule>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityGroupsRsp {
    #[serde(default)]
    pub security_groups: Vec<RawSecurityGroup>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityGroupRsp {
    #[serde(default)]
    pub security_group: RawSecurityGroup,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecurityGroupRuleRsp {
    #[serde(default)]
    pub security_group_rule: SecurityGroupRule,
}

#[derive(Debug, Default, Deserialize)]
pub struct NeutronQuota {
    #[serde(default)]
    pub floatingip: Option<i64>,
    #[serde(default)]
    pub network: Option<i64>,
    #[serde(default)]
    pub security_group: Option<i64>,
    #[serde(default)]
    pub subnet: Option<i64>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub router: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NeutronQuotaRsp {
    #[serde(default)]
    pub quota: NeutronQuota,
}

// --- Glance ---

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawImage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub min_disk: u64,
    #[serde(default)]
    pub min_ram: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub os_distro: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImagesRsp {
    #[serde(default)]
    pub images: Vec<RawImage>,
}

// --- Keystone ---

#[derive(Debug, Default, Deserialize)]
pub struct DomainsRsp {
    #[serde(default)]
    pub domains: Vec<KeystoneDomain>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsersRsp {
    #[serde(default)]
    pub users: Vec<KeystoneUser>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserRsp {
    #[serde(default)]
    pub user: Option<KeystoneUser>,
}
