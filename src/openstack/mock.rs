//! In-memory mock backend
//!
//! Serves every operation from a seeded store after a fixed delay, and plays
//! out state transitions (build, reboot, volume create, attach, detach) on
//! timers. The store is private to the backend; its lock is only held in
//! short synchronous sections, never across an await. Nothing is persisted:
//! each process starts from the seed.

use super::catalog::{EndpointSelector, Interface, ServiceCatalogEntry, ServiceEndpoint};
use super::error::{ApiError, Result};
use super::model::{
    AllocationPool, ConsoleInfo, ExternalGateway, FixedIp, Flavor, FloatingIp, Image, Instance,
    InstanceAction, KeyPair, KeystoneDomain, KeystoneUser, NamedRef, Network, Port, PowerState,
    Quota, Router, SecurityGroup, SecurityGroupRule, Subnet, Volume, VolumeAttachment,
};
use super::ops::{
    CloudOperations, ConsoleType, CreateUserRequest, CreateVolumeParams, LaunchInstanceParams,
    NewSecurityGroupRule, PortQuery, PowerAction, UserUpdate,
};
use super::session::{AuthSession, DomainRef, ProjectRef, RoleRef, Token, UserRef};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const MOCK_PROJECT_ID: &str = "mock-project-id";
pub const MOCK_USER_ID: &str = "mock-user-id";
const MOCK_API: &str = "http://mock-api.local";

/// Delays used by the mock backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTimings {
    /// Added to every operation.
    pub delay: Duration,
    /// BUILD -> ACTIVE, REBOOT -> ACTIVE, creating -> available.
    pub transition: Duration,
    /// attaching -> in-use, detaching -> available.
    pub settle: Duration,
}

impl Default for MockTimings {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(200),
            transition: Duration::from_secs(3),
            settle: Duration::from_secs(2),
        }
    }
}

/// The bypass-login session: mock catalog, project, user and admin role.
pub fn mock_session() -> AuthSession {
    AuthSession {
        auth_url: format!("{}/identity/v3", MOCK_API),
        token: Token::new("mock-token"),
        catalog: mock_catalog(),
        project: Some(ProjectRef {
            id: MOCK_PROJECT_ID.to_string(),
            name: "Mock Project".to_string(),
            domain: Some(DomainRef {
                id: "mock-domain-id".to_string(),
                name: "mock-domain".to_string(),
            }),
        }),
        user: Some(UserRef {
            id: MOCK_USER_ID.to_string(),
            name: "Mock User".to_string(),
            domain: Some(DomainRef {
                id: "mock-domain-id".to_string(),
                name: "mock-domain".to_string(),
            }),
        }),
        roles: vec![RoleRef {
            id: "mock-role-admin".to_string(),
            name: "admin".to_string(),
        }],
    }
}

pub fn mock_catalog() -> Vec<ServiceCatalogEntry> {
    let entry = |kind: &str, service_type: &str, name: &str, path: &str| ServiceCatalogEntry {
        id: format!("cat-{}", kind),
        service_type: service_type.to_string(),
        name: name.to_string(),
        endpoints: vec![ServiceEndpoint {
            id: format!("ep-{}-public", kind),
            region: Some("MockRegion".to_string()),
            interface: Interface::Public,
            url: format!("{}/{}", MOCK_API, path),
            region_id: Some("MockRegion".to_string()),
        }],
    };
    vec![
        entry("compute", "compute", "nova", "compute/v2.1/mock-project-id"),
        entry("volume", "volumev3", "cinder", "volume/v3/mock-project-id"),
        entry("network", "network", "neutron", "network"),
        entry("image", "image", "glance", "image"),
        entry("identity", "identity", "keystone", "identity/v3"),
    ]
}

fn days_ago(days: i64) -> Option<String> {
    Some((Utc::now() - chrono::Duration::days(days)).to_rfc3339())
}

fn secs_ago(secs: i64) -> String {
    (Utc::now() - chrono::Duration::seconds(secs)).to_rfc3339()
}

fn s(v: &str) -> String {
    v.to_string()
}

fn named(id: &str, name: &str) -> NamedRef {
    NamedRef {
        id: s(id),
        name: Some(s(name)),
    }
}

fn rule(
    id: &str,
    group: &str,
    direction: &str,
    port: Option<u32>,
    remote_ip_prefix: Option<&str>,
    remote_group_id: Option<&str>,
) -> SecurityGroupRule {
    SecurityGroupRule {
        id: s(id),
        security_group_id: Some(s(group)),
        direction: s(direction),
        protocol: port.map(|_| s("tcp")),
        port_range_min: port,
        port_range_max: port,
        remote_ip_prefix: remote_ip_prefix.map(s),
        remote_group_id: remote_group_id.map(s),
        ethertype: s("IPv4"),
    }
}

fn port(id: &str, network: &str, device: &str, owner: &str, subnet: &str, ip: &str, mac: Option<&str>) -> Port {
    Port {
        id: s(id),
        name: String::new(),
        network_id: s(network),
        device_id: s(device),
        device_owner: s(owner),
        fixed_ips: vec![FixedIp {
            subnet_id: s(subnet),
            ip_address: s(ip),
        }],
        mac_address: mac.map(s),
        status: s("ACTIVE"),
    }
}

#[derive(Debug, Clone)]
struct MockStore {
    instances: Vec<Instance>,
    volumes: Vec<Volume>,
    networks: Vec<Network>,
    subnets: Vec<Subnet>,
    routers: Vec<Router>,
    ports: Vec<Port>,
    security_groups: Vec<SecurityGroup>,
    floating_ips: Vec<FloatingIp>,
    key_pairs: Vec<KeyPair>,
    flavors: Vec<Flavor>,
    images: Vec<Image>,
    domains: Vec<KeystoneDomain>,
    users: Vec<KeystoneUser>,
    next_id: u64,
}

impl MockStore {
    fn seeded() -> Self {
        let flavor = |id: &str, name: &str, vcpus: u32, ram: u64, disk: u64| Flavor {
            id: s(id),
            name: s(name),
            vcpus,
            ram,
            disk,
            is_public: true,
            ephemeral: 0,
            swap: 0,
        };
        let image = |id: &str, name: &str, size: u64, visibility: &str, min_disk: u64, min_ram: u64, age: i64, distro: &str| Image {
            id: s(id),
            name: s(name),
            status: s("active"),
            visibility: s(visibility),
            size: Some(size),
            min_disk,
            min_ram,
            created: days_ago(age),
            os_distro: Some(s(distro)),
        };
        let instance = |id: &str, name: &str, status: &str, power_state: PowerState, flavor: NamedRef, image: NamedRef, ip: &str, age: i64| Instance {
            id: s(id),
            name: s(name),
            status: s(status),
            power_state,
            flavor,
            image,
            ip_address: s(ip),
            key_pair: None,
            security_groups: Vec::new(),
            volumes_attached: Vec::new(),
            created: days_ago(age),
            availability_zone: Some(s("nova")),
            user_id: Some(s("user-id-123")),
            host_id: Some(s("compute-host-A")),
        };
        let volume = |id: &str, name: &str, size: u64, volume_type: &str, age: i64, az: &str| Volume {
            id: s(id),
            name: s(name),
            size,
            status: s("available"),
            volume_type: Some(s(volume_type)),
            bootable: s("false"),
            attachments: Vec::new(),
            availability_zone: Some(s(az)),
            created: days_ago(age),
        };

        const GIB: u64 = 1024 * 1024 * 1024;

        let instances = vec![
            Instance {
                key_pair: Some(s("my-ssh-key")),
                security_groups: vec![s("default"), s("web-sg")],
                ..instance("inst-1", "web-server-01", "ACTIVE", PowerState::Running,
                    named("f-2", "m1.small"), named("img-1", "Ubuntu 22.04 LTS"),
                    "10.0.0.5, 192.168.1.101", 2)
            },
            Instance {
                key_pair: Some(s("my-ssh-key")),
                security_groups: vec![s("default"), s("db-sg")],
                volumes_attached: vec![s("vol-2")],
                user_id: Some(s("user-id-456")),
                host_id: Some(s("compute-host-B")),
                ..instance("inst-2", "db-server-01", "ACTIVE", PowerState::Running,
                    named("f-3", "m1.medium"), named("img-2", "CentOS Stream 9"), "10.0.0.6", 5)
            },
            Instance {
                availability_zone: Some(s("zone1")),
                ..instance("inst-3", "dev-vm", "SHUTOFF", PowerState::Shutoff,
                    named("f-2", "m1.small"), named("img-4", "Fedora 38 Cloud"), "", 1)
            },
            Instance {
                user_id: Some(s("user-id-789")),
                host_id: Some(s("compute-host-C")),
                ..instance("inst-4", "build-worker-01", "BUILD", PowerState::Building,
                    named("f-4", "m1.large"), named("img-1", "Ubuntu 22.04 LTS"), "", 0)
            },
            Instance {
                availability_zone: Some(s("zone2")),
                host_id: Some(s("compute-host-B")),
                ..instance("inst-5", "shelved-vm", "SHELVED", PowerState::Shutoff,
                    named("f-1", "m1.tiny"), named("img-2", "CentOS Stream 9"), "", 7)
            },
        ];

        let volumes = vec![
            volume("vol-1", "data-disk-01", 50, "ssd", 3, "nova"),
            Volume {
                status: s("in-use"),
                bootable: s("true"),
                attachments: vec![VolumeAttachment {
                    server_id: s("inst-2"),
                    device: Some(s("/dev/vdb")),
                    attachment_id: Some(s("vol-2")),
                    volume_id: s("vol-2"),
                }],
                ..volume("vol-2", "os-disk-db", 20, "ssd", 5, "nova")
            },
            volume("vol-3", "backup-archive", 100, "hdd", 10, "cinder-az1"),
            volume("vol-4", "available-ssd", 25, "ssd", 1, "nova"),
        ];

        let subnet = |id: &str, name: &str, network: &str, cidr: &str, gateway: &str, start: &str, end: &str| Subnet {
            id: s(id),
            name: s(name),
            network_id: s(network),
            cidr: s(cidr),
            ip_version: 4,
            gateway_ip: Some(s(gateway)),
            enable_dhcp: true,
            allocation_pools: vec![AllocationPool {
                start: s(start),
                end: s(end),
            }],
        };
        let network = |id: &str, name: &str, subnet: &str, shared: bool, external: bool| Network {
            id: s(id),
            name: s(name),
            subnet_ids: vec![s(subnet)],
            shared,
            status: s("ACTIVE"),
            admin_state_up: true,
            external,
        };

        let egress = |group: &str| rule("rule-egress-any", group, "egress", None, Some("0.0.0.0/0"), None);

        Self {
            instances,
            volumes,
            networks: vec![
                network("net-1", "private-network-A", "sub-1", false, false),
                network("net-2", "public-network", "sub-2", true, true),
                network("net-3", "private-network-B", "sub-3", false, false),
            ],
            subnets: vec![
                subnet("sub-1", "private-subnet-A", "net-1", "10.0.0.0/24", "10.0.0.1", "10.0.0.2", "10.0.0.254"),
                subnet("sub-2", "public-subnet", "net-2", "192.168.1.0/24", "192.168.1.1", "192.168.1.100", "192.168.1.200"),
                subnet("sub-3", "private-subnet-B", "net-3", "10.0.1.0/24", "10.0.1.1", "10.0.1.2", "10.0.1.254"),
            ],
            routers: vec![
                Router {
                    id: s("router-1"),
                    name: s("main-router"),
                    status: s("ACTIVE"),
                    admin_state_up: true,
                    external_gateway_info: Some(ExternalGateway {
                        network_id: s("net-2"),
                        enable_snat: Some(true),
                    }),
                    ha: Some(false),
                },
                Router {
                    id: s("router-2"),
                    name: s("internal-router"),
                    status: s("ACTIVE"),
                    admin_state_up: true,
                    external_gateway_info: None,
                    ha: Some(false),
                },
            ],
            ports: vec![
                port("port-r1-privA", "net-1", "router-1", "network:router_interface", "sub-1", "10.0.0.1", None),
                port("port-r1-pub", "net-2", "router-1", "network:router_gateway", "sub-2", "192.168.1.50", None),
                port("port-r2-privB", "net-3", "router-2", "network:router_interface", "sub-3", "10.0.1.1", None),
                port("port-inst1-privA", "net-1", "inst-1", "compute:nova", "sub-1", "10.0.0.5", Some("fa:16:3e:11:22:33")),
                port("port-inst2-privA", "net-1", "inst-2", "compute:nova", "sub-1", "10.0.0.6", Some("fa:16:3e:44:55:66")),
            ],
            security_groups: vec![
                SecurityGroup {
                    id: s("sg-1"),
                    name: s("default"),
                    description: s("Default security group"),
                    rules: vec![egress("sg-1")],
                },
                SecurityGroup {
                    id: s("sg-2"),
                    name: s("web-sg"),
                    description: s("Allows HTTP/HTTPS and SSH"),
                    rules: vec![
                        rule("rule-ssh", "sg-2", "ingress", Some(22), Some("0.0.0.0/0"), None),
                        rule("rule-http", "sg-2", "ingress", Some(80), Some("0.0.0.0/0"), None),
                        rule("rule-https", "sg-2", "ingress", Some(443), Some("0.0.0.0/0"), None),
                        egress("sg-2"),
                    ],
                },
                SecurityGroup {
                    id: s("sg-3"),
                    name: s("db-sg"),
                    description: s("Allows SSH and internal DB access"),
                    rules: vec![
                        rule("rule-ssh", "sg-3", "ingress", Some(22), Some("0.0.0.0/0"), None),
                        rule("rule-db", "sg-3", "ingress", Some(3306), None, Some("sg-2")),
                        egress("sg-3"),
                    ],
                },
            ],
            floating_ips: vec![
                FloatingIp {
                    id: s("fip-1"),
                    floating_ip_address: s("192.168.1.101"),
                    floating_network_id: s("net-2"),
                    fixed_ip_address: Some(s("10.0.0.5")),
                    port_id: Some(s("port-inst1-privA")),
                    status: s("ACTIVE"),
                },
                FloatingIp {
                    id: s("fip-2"),
                    floating_ip_address: s("192.168.1.102"),
                    floating_network_id: s("net-2"),
                    fixed_ip_address: None,
                    port_id: None,
                    status: s("DOWN"),
                },
            ],
            key_pairs: vec![
                KeyPair {
                    id: s("my-ssh-key"),
                    name: s("my-ssh-key"),
                    fingerprint: s("ab:cd:ef:12:34:56:78:90"),
                    public_key: s("ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQD mock@my-ssh-key"),
                },
                KeyPair {
                    id: s("dev-key"),
                    name: s("dev-key"),
                    fingerprint: s("11:22:33:44:55:66:77:88"),
                    public_key: s("ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQE mock@dev-key"),
                },
            ],
            flavors: vec![
                flavor("f-1", "m1.tiny", 1, 512, 1),
                flavor("f-2", "m1.small", 1, 2048, 20),
                flavor("f-3", "m1.medium", 2, 4096, 40),
                flavor("f-4", "m1.large", 4, 8192, 80),
            ],
            images: vec![
                image("img-1", "Ubuntu 22.04 LTS", 2 * GIB, "public", 10, 512, 30, "ubuntu"),
                image("img-2", "CentOS Stream 9", 3 * GIB / 2, "public", 8, 512, 20, "centos"),
                image("img-3", "Windows Server 2022 (Custom)", 12 * GIB, "private", 40, 2048, 5, "windows"),
                image("img-4", "Fedora 38 Cloud", 800 * 1024 * 1024, "public", 5, 1024, 15, "fedora"),
            ],
            domains: vec![
                KeystoneDomain {
                    id: s("default"),
                    name: s("Default"),
                    description: s("The default domain"),
                    enabled: true,
                },
                KeystoneDomain {
                    id: s("domain-one"),
                    name: s("Domain One"),
                    description: s("Custom domain one"),
                    enabled: true,
                },
                KeystoneDomain {
                    id: s("disabled-domain"),
                    name: s("Disabled Domain"),
                    description: s("A disabled domain"),
                    enabled: false,
                },
            ],
            users: vec![
                KeystoneUser {
                    id: s(MOCK_USER_ID),
                    name: s("Mock User"),
                    domain_id: s("mock-domain-id"),
                    enabled: true,
                    email: None,
                    description: None,
                },
                KeystoneUser {
                    id: s("user-2"),
                    name: s("jane.doe"),
                    domain_id: s("default"),
                    enabled: true,
                    email: None,
                    description: None,
                },
                KeystoneUser {
                    id: s("user-3"),
                    name: s("john.smith"),
                    domain_id: s("domain-one"),
                    enabled: false,
                    email: None,
                    description: None,
                },
            ],
            next_id: 1000,
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        let id = format!("{}-{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    fn volume_mut(&mut self, id: &str) -> Option<&mut Volume> {
        self.volumes.iter_mut().find(|v| v.id == id)
    }

    fn quotas(&self) -> Vec<Quota> {
        let flavor_of = |i: &Instance| self.flavors.iter().find(|f| f.id == i.flavor.id);
        let vcpus: u64 = self
            .instances
            .iter()
            .filter_map(flavor_of)
            .map(|f| u64::from(f.vcpus))
            .sum();
        let ram: u64 = self.instances.iter().filter_map(flavor_of).map(|f| f.ram).sum();
        let storage: u64 = self.volumes.iter().map(|v| v.size).sum();
        let associated = self.floating_ips.iter().filter(|f| f.port_id.is_some()).count();

        let line = |resource: &str, used: usize, limit: i64| Quota {
            resource: s(resource),
            used: used as i64,
            limit,
        };
        vec![
            line("Instances", self.instances.len(), 20),
            Quota {
                resource: s("vCPUs"),
                used: vcpus as i64,
                limit: 50,
            },
            Quota {
                resource: s("RAM (MB)"),
                used: ram as i64,
                limit: 102_400,
            },
            line("Volumes", self.volumes.len(), 30),
            Quota {
                resource: s("Volume Storage (GB)"),
                used: storage as i64,
                limit: 1000,
            },
            line("Floating IPs", associated, 10),
            line("Networks", self.networks.len(), 5),
            line("Subnets", self.subnets.len(), 10),
            line("Routers", self.routers.len(), 3),
            line("Ports", self.ports.len(), 50),
            line("Security Groups", self.security_groups.len(), 20),
        ]
    }
}

/// Mock implementation of [`CloudOperations`].
pub struct MockBackend {
    store: Arc<Mutex<MockStore>>,
    timings: MockTimings,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(MockTimings::default())
    }
}

impl MockBackend {
    pub fn new(timings: MockTimings) -> Self {
        Self {
            store: Arc::new(Mutex::new(MockStore::seeded())),
            timings,
        }
    }

    fn store(&self) -> MutexGuard<'_, MockStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        tokio::time::sleep(self.timings.delay).await;
    }

    /// Run `f` against the store after `delay`, on a separate task.
    fn after<F>(&self, delay: Duration, f: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(&mut MockStore) + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
        })
    }
}

#[async_trait]
impl CloudOperations for MockBackend {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn list_instances(&self, _token: &str, _compute_url: &str) -> Result<Vec<Instance>> {
        self.pause().await;
        Ok(self.store().instances.clone())
    }

    async fn get_instance(&self, _token: &str, _compute_url: &str, instance_id: &str) -> Result<Instance> {
        self.pause().await;
        let store = self.store();
        store
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("Instance", instance_id))
    }

    async fn launch_instance(
        &self,
        _token: &str,
        _compute_url: &str,
        params: &LaunchInstanceParams,
    ) -> Result<Instance> {
        self.pause().await;
        let (instance, octet) = {
            let mut store = self.store();
            let octet = 10 + store.next_id % 240;
            let id = store.next_id("inst");
            let flavor = store
                .flavors
                .iter()
                .find(|f| f.id == params.flavor_id)
                .map(|f| named(&f.id, &f.name))
                .unwrap_or_else(|| named("f-unknown", "unknown-flavor"));
            let image = store
                .images
                .iter()
                .find(|i| i.id == params.image_id)
                .map(|i| named(&i.id, &i.name))
                .unwrap_or_else(|| named("img-unknown", "unknown-image"));
            let host = (b'A' + (store.next_id % 3) as u8) as char;

            let instance = Instance {
                id,
                name: if params.name.is_empty() {
                    s("new-instance")
                } else {
                    params.name.clone()
                },
                status: s("BUILD"),
                power_state: PowerState::Building,
                flavor,
                image,
                ip_address: String::new(),
                key_pair: params.key_pair.clone(),
                security_groups: params.security_groups.clone(),
                volumes_attached: Vec::new(),
                created: Some(Utc::now().to_rfc3339()),
                availability_zone: Some(s("nova")),
                user_id: Some(s(MOCK_USER_ID)),
                host_id: Some(format!("compute-host-{}", host)),
            };
            store.instances.push(instance.clone());
            (instance, octet)
        };

        let id = instance.id.clone();
        self.after(self.timings.transition, move |store| {
            if let Some(inst) = store.instance_mut(&id) {
                inst.status = s("ACTIVE");
                inst.power_state = PowerState::Running;
                inst.ip_address = format!("10.0.0.{}", octet);
            }
        });

        tracing::debug!("mock: launched {}", instance.id);
        Ok(instance)
    }

    async fn terminate_instance(&self, _token: &str, _compute_url: &str, instance_id: &str) -> Result<()> {
        self.pause().await;
        let mut store = self.store();
        store.instances.retain(|i| i.id != instance_id);
        for volume in store.volumes.iter_mut() {
            if volume.attached_to() == Some(instance_id) {
                volume.attachments.clear();
                volume.status = s("available");
            }
        }
        Ok(())
    }

    async fn control_instance_power(
        &self,
        _token: &str,
        _compute_url: &str,
        instance_id: &str,
        action: PowerAction,
    ) -> Result<()> {
        self.pause().await;
        let rebooting = {
            let mut store = self.store();
            let Some(instance) = store.instance_mut(instance_id) else {
                return Ok(());
            };
            if instance.status.to_ascii_uppercase().contains("SHELVED") {
                tracing::debug!("mock: ignoring {} on shelved {}", action, instance_id);
                return Ok(());
            }
            match action {
                PowerAction::Start => {
                    instance.status = s("ACTIVE");
                    instance.power_state = PowerState::Running;
                    false
                }
                PowerAction::Stop => {
                    instance.status = s("SHUTOFF");
                    instance.power_state = PowerState::Shutoff;
                    false
                }
                PowerAction::Reboot(_) => {
                    instance.status = s("REBOOT");
                    instance.power_state = PowerState::Building;
                    true
                }
            }
        };

        if rebooting {
            let id = instance_id.to_string();
            self.after(self.timings.transition, move |store| {
                if let Some(inst) = store.instance_mut(&id) {
                    if inst.status == "REBOOT" {
                        inst.status = s("ACTIVE");
                        inst.power_state = PowerState::Running;
                    }
                }
            });
        }
        Ok(())
    }

    async fn get_console_url(
        &self,
        _token: &str,
        _compute_url: &str,
        instance_id: &str,
        console_type: ConsoleType,
    ) -> Result<ConsoleInfo> {
        self.pause().await;
        Ok(ConsoleInfo {
            console_type: console_type.to_string(),
            url: format!(
                "https://mock-console.example.com/{}/?token=dummy-token-for-{}",
                console_type, instance_id
            ),
        })
    }

    async fn shelve_instance(&self, _token: &str, _compute_url: &str, instance_id: &str) -> Result<()> {
        self.pause().await;
        if let Some(instance) = self.store().instance_mut(instance_id) {
            instance.status = s("SHELVED");
            instance.power_state = PowerState::Shutoff;
        }
        Ok(())
    }

    async fn unshelve_instance(&self, _token: &str, _compute_url: &str, instance_id: &str) -> Result<()> {
        self.pause().await;
        if let Some(instance) = self.store().instance_mut(instance_id) {
            if instance.status.to_ascii_uppercase().contains("SHELVED") {
                instance.status = s("ACTIVE");
                instance.power_state = PowerState::Running;
            }
        }
        Ok(())
    }

    async fn list_instance_actions(
        &self,
        _token: &str,
        _compute_url: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceAction>> {
        self.pause().await;
        let action = |action: &str, request_id: &str, start_time: String, message: Option<&str>| InstanceAction {
            action: s(action),
            request_id: s(request_id),
            instance_uuid: s(instance_id),
            start_time,
            message: message.map(s),
            user_id: Some(s(MOCK_USER_ID)),
            project_id: Some(s(MOCK_PROJECT_ID)),
        };
        Ok(vec![
            action("create", "req-1", secs_ago(2 * 86_400), Some("Instance created successfully from image xyz.")),
            action("stop", "req-2", secs_ago(3600), Some("Instance stopped successfully.")),
            action("start", "req-3", secs_ago(1800), Some("Instance started successfully.")),
            action("reboot", "req-4", secs_ago(0), None),
        ])
    }

    async fn list_flavors(&self, _token: &str, _compute_url: &str) -> Result<Vec<Flavor>> {
        self.pause().await;
        Ok(self.store().flavors.clone())
    }

    async fn list_key_pairs(&self, _token: &str, _compute_url: &str) -> Result<Vec<KeyPair>> {
        self.pause().await;
        Ok(self.store().key_pairs.clone())
    }

    async fn attach_volume(
        &self,
        _token: &str,
        _compute_url: &str,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<()> {
        self.pause().await;
        {
            let mut store = self.store();
            if store.instance_mut(instance_id).is_none() {
                return Err(ApiError::not_found("Instance", instance_id));
            }
            let volume = store
                .volume_mut(volume_id)
                .ok_or_else(|| ApiError::not_found("Volume", volume_id))?;
            volume.status = s("attaching");
        }

        let (instance_id, volume_id) = (instance_id.to_string(), volume_id.to_string());
        self.after(self.timings.settle, move |store| {
            let Some(instance) = store.instance_mut(&instance_id) else {
                return;
            };
            let letter = (b'b' + instance.volumes_attached.len().min(24) as u8) as char;
            if !instance.volumes_attached.contains(&volume_id) {
                instance.volumes_attached.push(volume_id.clone());
            }
            if let Some(volume) = store.volume_mut(&volume_id) {
                volume.status = s("in-use");
                volume.attachments = vec![VolumeAttachment {
                    server_id: instance_id.clone(),
                    device: Some(format!("/dev/vd{}", letter)),
                    attachment_id: Some(volume_id.clone()),
                    volume_id: volume_id.clone(),
                }];
            }
        })
        .await
        .map_err(|_| ApiError::Cancelled)
    }

    async fn detach_volume(
        &self,
        _token: &str,
        _compute_url: &str,
        instance_id: &str,
        attachment_id: &str,
    ) -> Result<()> {
        self.pause().await;
        {
            let mut store = self.store();
            if store.volume_mut(attachment_id).is_none() {
                return Err(ApiError::not_found("Volume", attachment_id));
            }
            let instance = store
                .instance_mut(instance_id)
                .ok_or_else(|| ApiError::not_found("Instance", instance_id))?;
            instance.volumes_attached.retain(|v| v != attachment_id);
            if let Some(volume) = store.volume_mut(attachment_id) {
                volume.status = s("detaching");
            }
        }

        let volume_id = attachment_id.to_string();
        self.after(self.timings.settle, move |store| {
            if let Some(volume) = store.volume_mut(&volume_id) {
                volume.status = s("available");
                volume.attachments.clear();
            }
        })
        .await
        .map_err(|_| ApiError::Cancelled)
    }

    async fn list_volumes(&self, _token: &str, _volume_url: &str) -> Result<Vec<Volume>> {
        self.pause().await;
        Ok(self.store().volumes.clone())
    }

    async fn create_volume(
        &self,
        _token: &str,
        _volume_url: &str,
        params: &CreateVolumeParams,
    ) -> Result<Volume> {
        self.pause().await;
        let volume = {
            let mut store = self.store();
            let volume = Volume {
                id: store.next_id("vol"),
                name: params.name.clone(),
                size: params.size,
                status: s("creating"),
                volume_type: Some(params.volume_type.clone().unwrap_or_else(|| s("ssd"))),
                bootable: s("false"),
                attachments: Vec::new(),
                availability_zone: Some(
                    params
                        .availability_zone
                        .clone()
                        .unwrap_or_else(|| s("nova")),
                ),
                created: Some(Utc::now().to_rfc3339()),
            };
            store.volumes.push(volume.clone());
            volume
        };

        let id = volume.id.clone();
        self.after(self.timings.transition, move |store| {
            if let Some(v) = store.volume_mut(&id) {
                if v.status == "creating" {
                    v.status = s("available");
                }
            }
        });
        Ok(volume)
    }

    async fn delete_volume(&self, _token: &str, _volume_url: &str, volume_id: &str) -> Result<()> {
        self.pause().await;
        let mut store = self.store();
        store.volumes.retain(|v| v.id != volume_id);
        for instance in store.instances.iter_mut() {
            instance.volumes_attached.retain(|v| v != volume_id);
        }
        Ok(())
    }

    async fn list_networks(&self, _token: &str, _network_url: &str) -> Result<Vec<Network>> {
        self.pause().await;
        Ok(self.store().networks.clone())
    }

    async fn list_subnets(
        &self,
        _token: &str,
        _network_url: &str,
        network_id: Option<&str>,
    ) -> Result<Vec<Subnet>> {
        self.pause().await;
        Ok(self
            .store()
            .subnets
            .iter()
            .filter(|sub| network_id.map_or(true, |n| sub.network_id == n))
            .cloned()
            .collect())
    }

    async fn list_routers(&self, _token: &str, _network_url: &str) -> Result<Vec<Router>> {
        self.pause().await;
        Ok(self.store().routers.clone())
    }

    async fn list_ports(&self, _token: &str, _network_url: &str, query: &PortQuery) -> Result<Vec<Port>> {
        self.pause().await;
        Ok(self
            .store()
            .ports
            .iter()
            .filter(|p| query.matches(p))
            .cloned()
            .collect())
    }

    async fn list_floating_ips(&self, _token: &str, _network_url: &str) -> Result<Vec<FloatingIp>> {
        self.pause().await;
        Ok(self.store().floating_ips.clone())
    }

    async fn allocate_floating_ip(
        &self,
        _token: &str,
        _network_url: &str,
        pool_network_id: &str,
    ) -> Result<FloatingIp> {
        self.pause().await;
        let mut store = self.store();
        let host = 103 + store.next_id % 150;
        let fip = FloatingIp {
            id: store.next_id("fip"),
            floating_ip_address: format!("192.168.1.{}", host),
            floating_network_id: s(pool_network_id),
            fixed_ip_address: None,
            port_id: None,
            status: s("DOWN"),
        };
        store.floating_ips.push(fip.clone());
        Ok(fip)
    }

    async fn release_floating_ip(&self, _token: &str, _network_url: &str, fip_id: &str) -> Result<()> {
        self.pause().await;
        self.store().floating_ips.retain(|f| f.id != fip_id);
        Ok(())
    }

    async fn associate_floating_ip(
        &self,
        _token: &str,
        _network_url: &str,
        fip_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp> {
        self.pause().await;
        let mut store = self.store();
        let fixed_ip = store
            .ports
            .iter()
            .find(|p| p.id == port_id)
            .and_then(|p| p.fixed_ips.first())
            .map(|ip| ip.ip_address.clone());
        let fip = store
            .floating_ips
            .iter_mut()
            .find(|f| f.id == fip_id)
            .ok_or_else(|| ApiError::not_found("Floating IP", fip_id))?;
        fip.port_id = Some(s(port_id));
        fip.fixed_ip_address = fixed_ip;
        fip.status = s("ACTIVE");
        Ok(fip.clone())
    }

    async fn disassociate_floating_ip(
        &self,
        _token: &str,
        _network_url: &str,
        fip_id: &str,
    ) -> Result<FloatingIp> {
        self.pause().await;
        let mut store = self.store();
        let fip = store
            .floating_ips
            .iter_mut()
            .find(|f| f.id == fip_id)
            .ok_or_else(|| ApiError::not_found("Floating IP", fip_id))?;
        fip.port_id = None;
        fip.fixed_ip_address = None;
        fip.status = s("DOWN");
        Ok(fip.clone())
    }

    async fn list_security_groups(&self, _token: &str, _network_url: &str) -> Result<Vec<SecurityGroup>> {
        self.pause().await;
        Ok(self.store().security_groups.clone())
    }

    async fn create_security_group(
        &self,
        _token: &str,
        _network_url: &str,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup> {
        self.pause().await;
        let mut store = self.store();
        let id = store.next_id("sg");
        let egress_id = store.next_id("rule");
        let group = SecurityGroup {
            rules: vec![rule(&egress_id, &id, "egress", None, Some("0.0.0.0/0"), None)],
            id,
            name: s(name),
            description: s(description),
        };
        store.security_groups.push(group.clone());
        Ok(group)
    }

    async fn delete_security_group(&self, _token: &str, _network_url: &str, group_id: &str) -> Result<()> {
        self.pause().await;
        self.store().security_groups.retain(|g| g.id != group_id);
        Ok(())
    }

    async fn add_security_group_rule(
        &self,
        _token: &str,
        _network_url: &str,
        rule: &NewSecurityGroupRule,
    ) -> Result<SecurityGroupRule> {
        self.pause().await;
        let mut store = self.store();
        let created = SecurityGroupRule {
            id: store.next_id("rule"),
            security_group_id: Some(rule.security_group_id.clone()),
            direction: rule.direction.clone(),
            protocol: rule.protocol.clone(),
            port_range_min: rule.port_range_min,
            port_range_max: rule.port_range_max,
            remote_ip_prefix: rule.remote_ip_prefix.clone(),
            remote_group_id: rule.remote_group_id.clone(),
            ethertype: rule.ethertype.clone(),
        };
        if let Some(group) = store
            .security_groups
            .iter_mut()
            .find(|g| g.id == rule.security_group_id)
        {
            group.rules.push(created.clone());
        }
        Ok(created)
    }

    async fn delete_security_group_rule(&self, _token: &str, _network_url: &str, rule_id: &str) -> Result<()> {
        self.pause().await;
        let mut store = self.store();
        if let Some(group) = store
            .security_groups
            .iter_mut()
            .find(|g| g.rules.iter().any(|r| r.id == rule_id))
        {
            group.rules.retain(|r| r.id != rule_id);
        }
        Ok(())
    }

    async fn list_images(&self, _token: &str, _image_url: &str) -> Result<Vec<Image>> {
        self.pause().await;
        Ok(self.store().images.clone())
    }

    async fn fetch_all_quotas(
        &self,
        _token: &str,
        _catalog: &[ServiceCatalogEntry],
        _selector: &EndpointSelector,
        _project_id: Option<&str>,
    ) -> Result<Vec<Quota>> {
        self.pause().await;
        Ok(self.store().quotas())
    }

    async fn list_domains(&self, _token: &str, _identity_url: &str) -> Result<Vec<KeystoneDomain>> {
        self.pause().await;
        Ok(self.store().domains.clone())
    }

    async fn list_users(&self, _token: &str, _identity_url: &str) -> Result<Vec<KeystoneUser>> {
        self.pause().await;
        Ok(self.store().users.clone())
    }

    async fn create_user(
        &self,
        _token: &str,
        _identity_url: &str,
        request: &CreateUserRequest,
    ) -> Result<KeystoneUser> {
        self.pause().await;
        let mut store = self.store();
        if !store.domains.iter().any(|d| d.id == request.domain_id) {
            return Err(ApiError::not_found("Domain", request.domain_id.clone()));
        }
        let user = KeystoneUser {
            id: store.next_id("user"),
            name: request.name.clone(),
            domain_id: request.domain_id.clone(),
            enabled: request.enabled,
            email: request.email.clone(),
            description: request.description.clone(),
        };
        store.users.push(user.clone());
        Ok(user)
    }

    async fn delete_user(&self, _token: &str, _identity_url: &str, user_id: &str) -> Result<()> {
        self.pause().await;
        self.store().users.retain(|u| u.id != user_id);
        Ok(())
    }

    async fn update_user(
        &self,
        _token: &str,
        _identity_url: &str,
        user_id: &str,
        update: &UserUpdate,
    ) -> Result<KeystoneUser> {
        self.pause().await;
        let mut store = self.store();
        let user = store
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| ApiError::not_found("User", user_id))?;
        if let Some(enabled) = update.enabled {
            user.enabled = enabled;
        }
        if let Some(name) = &update.name {
            user.name = name.clone();
        }
        Ok(user.clone())
    }
}
