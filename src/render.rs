//! Terminal output
//!
//! Fixed-width tables for every entity the console lists, or pretty JSON
//! when `--json` is set.

use crate::openstack::model::{
    Flavor, FloatingIp, Image, Instance, InstanceAction, KeyPair, KeystoneDomain, KeystoneUser,
    Network, Port, Quota, Router, SecurityGroup, SecurityGroupRule, Subnet, Volume,
};
use anyhow::Result;
use serde::Serialize;

/// Column header with a maximum display width.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub header: &'static str,
    pub width: usize,
}

const fn col(header: &'static str, width: usize) -> Column {
    Column { header, width }
}

/// Something that renders as one table row.
pub trait Tabular {
    fn columns() -> Vec<Column>;
    fn cells(&self) -> Vec<String>;
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// `-1` means "not reported".
fn quota_value(value: i64) -> String {
    if value == Quota::UNKNOWN {
        "-".to_string()
    } else {
        value.to_string()
    }
}

fn opt(value: &Option<String>) -> String {
    value.as_deref().filter(|v| !v.is_empty()).unwrap_or("-").to_string()
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        s.to_string()
    }
}

/// Render rows under their headers, columns sized to content up to each
/// column's maximum width.
pub fn render_table(columns: &[Column], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            rows.iter()
                .filter_map(|r| r.get(i))
                .map(|cell| cell.chars().count())
                .chain(std::iter::once(c.header.len()))
                .max()
                .unwrap_or(0)
                .min(c.width.max(c.header.len()))
        })
        .collect();

    let line = |cells: Vec<String>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:<width$}", truncate(cell, *w), width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(line(columns.iter().map(|c| c.header.to_string()).collect()));
    for row in rows {
        out.push(line(row.clone()));
    }
    out.join("\n")
}

pub fn table<T: Tabular>(items: &[T]) -> String {
    let rows: Vec<Vec<String>> = items.iter().map(Tabular::cells).collect();
    render_table(&T::columns(), &rows)
}

/// Print a list as a table, or as JSON.
pub fn print_list<T: Tabular + Serialize>(items: &[T], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
    } else if items.is_empty() {
        println!("No results.");
    } else {
        println!("{}", table(items));
    }
    Ok(())
}

/// Print a single record as JSON, or as `key: value` lines via `table`.
pub fn print_one<T: Tabular + Serialize>(item: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(item)?);
    } else {
        println!("{}", describe(item));
    }
    Ok(())
}

/// Vertical `HEADER  value` layout for one record.
pub fn describe<T: Tabular>(item: &T) -> String {
    let columns = T::columns();
    let label = columns.iter().map(|c| c.header.len()).max().unwrap_or(0);
    columns
        .iter()
        .zip(item.cells())
        .map(|(c, v)| format!("{:<label$}  {}", c.header, v, label = label))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Tabular for Instance {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NAME", 24),
            col("STATUS", 14),
            col("POWER", 9),
            col("FLAVOR", 16),
            col("IMAGE", 24),
            col("IP ADDRESSES", 32),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.status.clone(),
            self.power_state.to_string(),
            or_dash(self.flavor.display()),
            or_dash(self.image.display()),
            or_dash(&self.ip_address),
        ]
    }
}

impl Tabular for Volume {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NAME", 24),
            col("SIZE", 8),
            col("STATUS", 10),
            col("TYPE", 10),
            col("BOOTABLE", 8),
            col("ATTACHED TO", 36),
        ]
    }

    fn cells(&self) -> Vec<String> {
        let attached = self
            .attachments
            .iter()
            .map(|a| match &a.device {
                Some(device) => format!("{} on {}", a.server_id, device),
                None => a.server_id.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        vec![
            self.id.clone(),
            or_dash(&self.name),
            format!("{} GB", self.size),
            self.status.clone(),
            opt(&self.volume_type),
            self.bootable.clone(),
            or_dash(&attached),
        ]
    }
}

impl Tabular for Network {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NAME", 24),
            col("STATUS", 8),
            col("SHARED", 6),
            col("EXTERNAL", 8),
            col("SUBNETS", 40),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            or_dash(&self.name),
            self.status.clone(),
            self.shared.to_string(),
            self.external.to_string(),
            or_dash(&self.subnet_ids.join(", ")),
        ]
    }
}

impl Tabular for Subnet {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NAME", 24),
            col("NETWORK", 36),
            col("CIDR", 18),
            col("GATEWAY", 15),
            col("DHCP", 5),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            or_dash(&self.name),
            self.network_id.clone(),
            self.cidr.clone(),
            opt(&self.gateway_ip),
            self.enable_dhcp.to_string(),
        ]
    }
}

impl Tabular for Router {
    fn columns() -> Vec<Column> {
        vec![col("ID", 36), col("NAME", 24), col("STATUS", 8), col("GATEWAY", 36)]
    }

    fn cells(&self) -> Vec<String> {
        let gateway = self
            .external_gateway_info
            .as_ref()
            .map(|g| g.network_id.clone())
            .unwrap_or_else(|| "-".to_string());
        vec![self.id.clone(), or_dash(&self.name), self.status.clone(), gateway]
    }
}

impl Tabular for Port {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NETWORK", 36),
            col("DEVICE", 36),
            col("OWNER", 26),
            col("FIXED IPS", 32),
            col("MAC", 17),
        ]
    }

    fn cells(&self) -> Vec<String> {
        let ips = self
            .fixed_ips
            .iter()
            .map(|ip| ip.ip_address.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        vec![
            self.id.clone(),
            self.network_id.clone(),
            or_dash(&self.device_id),
            or_dash(&self.device_owner),
            or_dash(&ips),
            opt(&self.mac_address),
        ]
    }
}

impl Tabular for FloatingIp {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("ADDRESS", 15),
            col("FIXED IP", 15),
            col("PORT", 36),
            col("POOL", 36),
            col("STATUS", 8),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.floating_ip_address.clone(),
            opt(&self.fixed_ip_address),
            opt(&self.port_id),
            self.floating_network_id.clone(),
            self.status.clone(),
        ]
    }
}

impl Tabular for SecurityGroup {
    fn columns() -> Vec<Column> {
        vec![col("ID", 36), col("NAME", 24), col("RULES", 5), col("DESCRIPTION", 48)]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.rules.len().to_string(),
            or_dash(&self.description),
        ]
    }
}

impl Tabular for SecurityGroupRule {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("DIRECTION", 9),
            col("ETHERTYPE", 9),
            col("PROTOCOL", 8),
            col("PORTS", 11),
            col("REMOTE", 36),
        ]
    }

    fn cells(&self) -> Vec<String> {
        let ports = match (self.port_range_min, self.port_range_max) {
            (Some(min), Some(max)) if min == max => min.to_string(),
            (Some(min), Some(max)) => format!("{}-{}", min, max),
            (Some(min), None) => min.to_string(),
            _ => "any".to_string(),
        };
        let remote = self
            .remote_ip_prefix
            .clone()
            .or_else(|| self.remote_group_id.clone())
            .unwrap_or_else(|| "any".to_string());
        vec![
            self.id.clone(),
            self.direction.clone(),
            self.ethertype.clone(),
            self.protocol.clone().unwrap_or_else(|| "any".to_string()),
            ports,
            remote,
        ]
    }
}

impl Tabular for Flavor {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NAME", 20),
            col("VCPUS", 5),
            col("RAM", 10),
            col("DISK", 8),
            col("PUBLIC", 6),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.vcpus.to_string(),
            format!("{} MB", self.ram),
            format!("{} GB", self.disk),
            self.is_public.to_string(),
        ]
    }
}

impl Tabular for KeyPair {
    fn columns() -> Vec<Column> {
        vec![col("NAME", 24), col("FINGERPRINT", 48)]
    }

    fn cells(&self) -> Vec<String> {
        vec![self.name.clone(), or_dash(&self.fingerprint)]
    }
}

impl Tabular for Image {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 36),
            col("NAME", 32),
            col("STATUS", 8),
            col("VISIBILITY", 10),
            col("SIZE", 10),
            col("MIN DISK", 8),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.status.clone(),
            self.visibility.clone(),
            self.size.map(format_bytes).unwrap_or_else(|| "-".to_string()),
            format!("{} GB", self.min_disk),
        ]
    }
}

impl Tabular for Quota {
    fn columns() -> Vec<Column> {
        vec![col("RESOURCE", 20), col("USED", 8), col("LIMIT", 8)]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.resource.clone(),
            quota_value(self.used),
            quota_value(self.limit),
        ]
    }
}

impl Tabular for KeystoneDomain {
    fn columns() -> Vec<Column> {
        vec![col("ID", 32), col("NAME", 24), col("ENABLED", 7), col("DESCRIPTION", 48)]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.enabled.to_string(),
            or_dash(&self.description),
        ]
    }
}

impl Tabular for KeystoneUser {
    fn columns() -> Vec<Column> {
        vec![
            col("ID", 32),
            col("NAME", 24),
            col("DOMAIN", 32),
            col("ENABLED", 7),
            col("EMAIL", 32),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.domain_id.clone(),
            self.enabled.to_string(),
            opt(&self.email),
        ]
    }
}

impl Tabular for InstanceAction {
    fn columns() -> Vec<Column> {
        vec![
            col("ACTION", 12),
            col("REQUEST", 40),
            col("STARTED", 32),
            col("MESSAGE", 48),
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.action.clone(),
            self.request_id.clone(),
            self.start_time.clone(),
            opt(&self.message),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(800 * 1024 * 1024), "800.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GiB");
    }

    #[test]
    fn test_quota_sentinel_renders_as_dash() {
        let quota = Quota {
            resource: "Instances".into(),
            used: Quota::UNKNOWN,
            limit: 20,
        };
        assert_eq!(quota.cells(), vec!["Instances", "-", "20"]);
    }

    #[test]
    fn test_table_alignment() {
        let quotas = vec![
            Quota {
                resource: "Instances".into(),
                used: 5,
                limit: 20,
            },
            Quota {
                resource: "RAM (MB)".into(),
                used: 26624,
                limit: 102400,
            },
        ];
        let rendered = table(&quotas);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "RESOURCE   USED   LIMIT");
        assert_eq!(lines[1], "Instances  5      20");
        assert_eq!(lines[2], "RAM (MB)   26624  102400");
    }

    #[test]
    fn test_long_cells_are_truncated() {
        let columns = [col("NAME", 8)];
        let rows = vec![vec!["a-very-long-name".to_string()]];
        assert_eq!(render_table(&columns, &rows), "NAME\na-ver...");
    }

    #[test]
    fn test_rule_ports_and_remote() {
        let rule = SecurityGroupRule {
            id: "r".into(),
            direction: "ingress".into(),
            ethertype: "IPv4".into(),
            protocol: Some("tcp".into()),
            port_range_min: Some(22),
            port_range_max: Some(22),
            remote_group_id: Some("sg-2".into()),
            ..Default::default()
        };
        let cells = rule.cells();
        assert_eq!(cells[4], "22");
        assert_eq!(cells[5], "sg-2");
    }

    #[test]
    fn test_describe_layout() {
        let key = KeyPair {
            id: "k".into(),
            name: "k".into(),
            fingerprint: "aa:bb".into(),
            public_key: String::new(),
        };
        assert_eq!(describe(&key), "NAME         k\nFINGERPRINT  aa:bb");
    }
}
