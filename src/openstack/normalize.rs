//! Raw wire shapes -> normalized entities.

use super::model::{
    Flavor, Image, Instance, KeyPair, NamedRef, Network, PowerState, Quota, SecurityGroup, Volume,
    VolumeAttachment,
};
use super::wire::{
    CinderQuotaSet, NeutronQuota, NovaQuotaSet, RawFlavor, RawImage, RawKeyPair, RawNetwork,
    RawSecurityGroup, RawServer, RawVolume,
};
use serde_json::{Map, Value};

/// Derive the power state from Nova's text status and numeric code.
///
/// Text status wins, except for ACTIVE (and anything unrecognized) where the
/// numeric code decides.
pub fn derive_power_state(status: &str, power_state: Option<i64>) -> PowerState {
    let status = status.to_ascii_uppercase();

    match status.as_str() {
        "BUILD" | "REBUILD" | "MIGRATING" | "RESCUE" | "RESIZE" | "VERIFY_RESIZE" => {
            return PowerState::Building
        }
        "ERROR" => return PowerState::Error,
        "PAUSED" | "SUSPENDED" => return PowerState::Paused,
        "SHUTOFF" | "STOPPED" => return PowerState::Shutoff,
        s if s.contains("SHELVED") => return PowerState::Shutoff,
        _ => {}
    }

    match power_state {
        Some(1) => PowerState::Running,
        Some(3) | Some(7) => PowerState::Paused,
        Some(4) => PowerState::Shutoff,
        Some(6) => PowerState::Error,
        Some(0) => PowerState::Building,
        None if status == "ACTIVE" => {
            tracing::warn!("power_state missing for ACTIVE instance, mapping to Building");
            PowerState::Building
        }
        other => {
            tracing::warn!(
                "unexpected power_state {:?} with status '{}', mapping to Error",
                other,
                status
            );
            PowerState::Error
        }
    }
}

/// Every `addr` of every network, networks in server order, joined with ", ".
pub fn join_addresses(addresses: &Map<String, Value>) -> String {
    addresses
        .values()
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|entry| entry.get("addr").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(", ")
}

fn image_ref(image: &Value) -> NamedRef {
    match image {
        Value::Object(obj) => NamedRef::new(obj.get("id").and_then(Value::as_str).unwrap_or_default()),
        _ => NamedRef::new(""),
    }
}

pub fn normalize_server(raw: RawServer) -> Instance {
    let power_state = derive_power_state(&raw.status, raw.power_state);

    // 2.47+ embeds the flavor without an id
    let flavor_id = if raw.flavor.id.is_empty() {
        raw.flavor.original_name.clone().unwrap_or_default()
    } else {
        raw.flavor.id.clone()
    };

    Instance {
        ip_address: join_addresses(&raw.addresses),
        image: image_ref(&raw.image),
        flavor: NamedRef {
            id: flavor_id,
            name: None,
        },
        power_state,
        key_pair: raw.key_name.filter(|k| !k.is_empty()),
        security_groups: raw.security_groups.into_iter().map(|sg| sg.name).collect(),
        volumes_attached: raw.volumes_attached.into_iter().map(|v| v.id).collect(),
        id: raw.id,
        name: raw.name,
        status: raw.status,
        created: raw.created,
        availability_zone: raw.availability_zone,
        user_id: raw.user_id,
        host_id: raw.host,
    }
}

/// Fill flavor and image names by id. Unknown ids keep `name: None`.
pub fn backfill_names(instance: &mut Instance, flavors: &[Flavor], images: &[Image]) {
    if let Some(flavor) = flavors.iter().find(|f| f.id == instance.flavor.id) {
        instance.flavor.name = Some(flavor.name.clone());
    }
    if let Some(image) = images.iter().find(|i| i.id == instance.image.id) {
        instance.image.name = Some(image.name.clone());
    }
}

fn bootable_string(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        _ => "false".to_string(),
    }
}

pub fn normalize_volume(raw: RawVolume) -> Volume {
    Volume {
        bootable: bootable_string(&raw.bootable),
        attachments: raw
            .attachments
            .into_iter()
            .map(|a| VolumeAttachment {
                volume_id: if a.volume_id.is_empty() {
                    raw.id.clone()
                } else {
                    a.volume_id
                },
                server_id: a.server_id,
                device: a.device,
                attachment_id: a.attachment_id,
            })
            .collect(),
        name: raw.name.unwrap_or_default(),
        id: raw.id,
        size: raw.size,
        status: raw.status,
        volume_type: raw.volume_type,
        availability_zone: raw.availability_zone,
        created: raw.created_at,
    }
}

pub fn normalize_network(raw: RawNetwork) -> Network {
    Network {
        id: raw.id,
        name: raw.name,
        subnet_ids: raw.subnets,
        shared: raw.shared,
        status: raw.status,
        admin_state_up: raw.admin_state_up,
        external: raw.external,
    }
}

/// Rules live under `security_group_rules` or `rules` depending on version.
pub fn normalize_security_group(raw: RawSecurityGroup) -> SecurityGroup {
    let rules = raw
        .security_group_rules
        .or(raw.rules)
        .unwrap_or_default();
    SecurityGroup {
        id: raw.id,
        name: raw.name,
        description: raw.description,
        rules,
    }
}

fn parse_swap(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub fn normalize_flavor(raw: RawFlavor) -> Flavor {
    Flavor {
        swap: parse_swap(&raw.swap),
        id: raw.id,
        name: raw.name,
        vcpus: raw.vcpus,
        ram: raw.ram,
        disk: raw.disk,
        is_public: raw.is_public.unwrap_or(true),
        ephemeral: raw.ephemeral.unwrap_or(0),
    }
}

pub fn normalize_key_pair(raw: RawKeyPair) -> KeyPair {
    KeyPair {
        id: raw.name.clone(),
        name: raw.name,
        fingerprint: raw.fingerprint,
        public_key: raw.public_key,
    }
}

pub fn normalize_image(raw: RawImage) -> Image {
    Image {
        name: raw.name.unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        status: raw.status,
        visibility: raw.visibility,
        size: raw.size,
        min_disk: raw.min_disk,
        min_ram: raw.min_ram,
        created: raw.created_at,
        os_distro: raw.os_distro,
    }
}

pub fn nova_quota_lines(set: &NovaQuotaSet) -> Vec<Quota> {
    vec![
        Quota::limit_only("Instances", set.instances),
        Quota::limit_only("vCPUs", set.cores),
        Quota::limit_only("RAM (MB)", set.ram),
    ]
}

pub fn cinder_quota_lines(set: &CinderQuotaSet) -> Vec<Quota> {
    vec![
        Quota::limit_only("Volumes", set.volumes),
        Quota::limit_only("Volume Storage (GB)", set.gigabytes),
    ]
}

pub fn neutron_quota_lines(quota: &NeutronQuota) -> Vec<Quota> {
    vec![
        Quota::limit_only("Floating IPs", quota.floatingip),
        Quota::limit_only("Networks", quota.network),
        Quota::limit_only("Security Groups", quota.security_group),
        Quota::limit_only("Subnets", quota.subnet),
        Quota::limit_only("Ports", quota.port),
        Quota::limit_only("Routers", quota.router),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::wire::{FlavorsRsp, SecurityGroupsRsp, ServerRsp, VolumesRsp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_power_state_truth_table() {
        let cases: &[(&str, Option<i64>, PowerState)] = &[
            ("ACTIVE", Some(1), PowerState::Running),
            ("ACTIVE", Some(0), PowerState::Building),
            ("ACTIVE", None, PowerState::Building),
            ("ACTIVE", Some(3), PowerState::Paused),
            ("ACTIVE", Some(7), PowerState::Paused),
            ("ACTIVE", Some(4), PowerState::Shutoff),
            ("ACTIVE", Some(6), PowerState::Error),
            ("ACTIVE", Some(42), PowerState::Error),
            ("BUILD", Some(1), PowerState::Building),
            ("REBUILD", Some(4), PowerState::Building),
            ("MIGRATING", Some(1), PowerState::Building),
            ("RESCUE", Some(1), PowerState::Building),
            ("RESIZE", Some(1), PowerState::Building),
            ("VERIFY_RESIZE", Some(1), PowerState::Building),
            ("ERROR", Some(1), PowerState::Error),
            ("PAUSED", Some(1), PowerState::Paused),
            ("SUSPENDED", Some(1), PowerState::Paused),
            ("SHUTOFF", Some(1), PowerState::Shutoff),
            ("STOPPED", None, PowerState::Shutoff),
            ("SHELVED", Some(1), PowerState::Shutoff),
            ("SHELVED_OFFLOADED", Some(4), PowerState::Shutoff),
            ("active", Some(1), PowerState::Running),
            ("shelved_offloaded", None, PowerState::Shutoff),
            ("REBOOT", Some(1), PowerState::Running),
            ("REBOOT", None, PowerState::Error),
            ("HARD_REBOOT", Some(0), PowerState::Building),
        ];

        for (status, code, expected) in cases {
            assert_eq!(
                derive_power_state(status, *code),
                *expected,
                "status={} code={:?}",
                status,
                code
            );
        }
    }

    #[test]
    fn test_join_addresses_keeps_network_order() {
        let raw = json!({
            "private": [{"addr": "10.0.0.5", "version": 4}],
            "public": [{"addr": "192.168.1.101", "version": 4}, {"addr": "2001:db8::1", "version": 6}]
        });
        let map = raw.as_object().unwrap();
        assert_eq!(join_addresses(map), "10.0.0.5, 192.168.1.101, 2001:db8::1");
        assert_eq!(join_addresses(&Map::new()), "");
    }

    #[test]
    fn test_normalize_server_fixture() {
        let body = json!({
            "server": {
                "id": "9e1c2f3a",
                "name": "web-1",
                "status": "ACTIVE",
                "OS-EXT-STS:power_state": 1,
                "flavor": {"id": "f-2", "links": []},
                "image": {"id": "img-1", "links": []},
                "addresses": {"private": [{"addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed"}]},
                "key_name": "my-key",
                "security_groups": [{"name": "default"}, {"name": "web"}],
                "os-extended-volumes:volumes_attached": [{"id": "vol-9"}],
                "created": "2024-05-01T10:00:00Z",
                "OS-EXT-AZ:availability_zone": "nova",
                "user_id": "u-1",
                "OS-EXT-SRV-ATTR:host": "compute-a"
            }
        });
        let rsp: ServerRsp = serde_json::from_value(body).unwrap();
        let instance = normalize_server(rsp.server);

        assert_eq!(instance.power_state, PowerState::Running);
        assert_eq!(instance.flavor, NamedRef::new("f-2"));
        assert_eq!(instance.image, NamedRef::new("img-1"));
        assert_eq!(instance.ip_address, "10.0.0.5");
        assert_eq!(instance.key_pair.as_deref(), Some("my-key"));
        assert_eq!(instance.security_groups, vec!["default", "web"]);
        assert_eq!(instance.volumes_attached, vec!["vol-9"]);
        assert_eq!(instance.availability_zone.as_deref(), Some("nova"));
        assert_eq!(instance.host_id.as_deref(), Some("compute-a"));
    }

    #[test]
    fn test_volume_backed_server_has_empty_image() {
        let body = json!({"server": {"id": "s", "name": "n", "status": "SHELVED_OFFLOADED",
                                     "power_state": 4, "image": "", "flavor": {"id": "f"}}});
        let rsp: ServerRsp = serde_json::from_value(body).unwrap();
        let instance = normalize_server(rsp.server);
        assert_eq!(instance.image.id, "");
        assert_eq!(instance.power_state, PowerState::Shutoff);
        assert_eq!(instance.ip_address, "");
    }

    #[test]
    fn test_backfill_names_by_id() {
        let body = json!({"server": {"id": "s", "name": "n", "status": "ACTIVE", "power_state": 1,
                                     "image": {"id": "img-1"}, "flavor": {"id": "f-missing"}}});
        let rsp: ServerRsp = serde_json::from_value(body).unwrap();
        let mut instance = normalize_server(rsp.server);

        let flavors = vec![normalize_flavor(RawFlavor {
            id: "f-1".into(),
            name: "m1.tiny".into(),
            ..Default::default()
        })];
        let images = vec![normalize_image(RawImage {
            id: "img-1".into(),
            name: Some("Ubuntu".into()),
            ..Default::default()
        })];
        backfill_names(&mut instance, &flavors, &images);

        assert_eq!(instance.image.name.as_deref(), Some("Ubuntu"));
        assert_eq!(instance.flavor.name, None);
        assert_eq!(instance.flavor.display(), "f-missing");
    }

    #[test]
    fn test_security_group_rules_under_either_key() {
        let body = json!({"security_groups": [
            {"id": "sg-1", "name": "default", "description": "",
             "security_group_rules": [{"id": "r1", "direction": "egress", "ethertype": "IPv4"}]},
            {"id": "sg-2", "name": "web", "description": "web",
             "rules": [{"id": "r2", "direction": "ingress", "ethertype": "IPv4",
                        "protocol": "tcp", "port_range_min": 80, "port_range_max": 80}]},
            {"id": "sg-3", "name": "bare", "description": ""}
        ]});
        let rsp: SecurityGroupsRsp = serde_json::from_value(body).unwrap();
        let groups: Vec<_> = rsp.security_groups.into_iter().map(normalize_security_group).collect();

        assert_eq!(groups[0].rules[0].id, "r1");
        assert_eq!(groups[1].rules[0].port_range_min, Some(80));
        assert!(groups[2].rules.is_empty());
    }

    #[test]
    fn test_flavor_defaults() {
        let body = json!({"flavors": [
            {"id": "1", "name": "m1.tiny", "vcpus": 1, "ram": 512, "disk": 1, "swap": ""},
            {"id": "2", "name": "m1.private", "vcpus": 2, "ram": 2048, "disk": 20,
             "swap": 1024, "os-flavor-access:is_public": false, "OS-FLV-EXT-DATA:ephemeral": 10},
            {"id": "3", "name": "odd", "vcpus": 1, "ram": 1, "disk": 1, "swap": "512"}
        ]});
        let rsp: FlavorsRsp = serde_json::from_value(body).unwrap();
        let flavors: Vec<_> = rsp.flavors.into_iter().map(normalize_flavor).collect();

        assert!(flavors[0].is_public);
        assert_eq!(flavors[0].swap, 0);
        assert_eq!(flavors[0].ephemeral, 0);
        assert!(!flavors[1].is_public);
        assert_eq!(flavors[1].swap, 1024);
        assert_eq!(flavors[1].ephemeral, 10);
        assert_eq!(flavors[2].swap, 512);
    }

    #[test]
    fn test_volume_fixture() {
        let body = json!({"volumes": [{
            "id": "vol-2", "name": null, "size": 20, "status": "in-use",
            "volume_type": "ssd", "bootable": "true", "availability_zone": "nova",
            "created_at": "2024-05-01T10:00:00.000000",
            "attachments": [{"server_id": "inst-2", "device": "/dev/vdb",
                             "attachment_id": "att-1", "volume_id": "vol-2"}]
        }]});
        let rsp: VolumesRsp = serde_json::from_value(body).unwrap();
        let volume = normalize_volume(rsp.volumes.into_iter().next().unwrap());

        assert_eq!(volume.name, "");
        assert_eq!(volume.bootable, "true");
        assert_eq!(volume.attached_to(), Some("inst-2"));
        assert!(!volume.is_available());
    }

    #[test]
    fn test_bootable_keeps_reported_text() {
        assert_eq!(bootable_string(&json!("True")), "True");
        assert_eq!(bootable_string(&json!("false")), "false");
        assert_eq!(bootable_string(&json!(true)), "true");
        assert_eq!(bootable_string(&Value::Null), "false");
    }

    #[test]
    fn test_network_maps_subnets_and_external() {
        let raw: RawNetwork = serde_json::from_value(json!({
            "id": "net-2", "name": "public", "subnets": ["sub-2"], "shared": true,
            "status": "ACTIVE", "admin_state_up": true, "router:external": true
        }))
        .unwrap();
        let network = normalize_network(raw);
        assert_eq!(network.subnet_ids, vec!["sub-2"]);
        assert!(network.external);
    }

    #[test]
    fn test_key_pair_uses_name_as_id() {
        let kp = normalize_key_pair(RawKeyPair {
            name: "dev-key".into(),
            fingerprint: "11:22".into(),
            public_key: "ssh-rsa AAA".into(),
        });
        assert_eq!(kp.id, "dev-key");
    }

    #[test]
    fn test_quota_lines_default_to_unknown() {
        let lines = nova_quota_lines(&NovaQuotaSet {
            instances: Some(10),
            cores: None,
            ram: Some(51200),
        });
        assert_eq!(lines[0], Quota { resource: "Instances".into(), used: -1, limit: 10 });
        assert_eq!(lines[1].limit, Quota::UNKNOWN);
        assert_eq!(neutron_quota_lines(&NeutronQuota::default()).len(), 6);
        assert_eq!(cinder_quota_lines(&CinderQuotaSet::default())[1].resource, "Volume Storage (GB)");
    }
}
