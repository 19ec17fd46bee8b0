//! Remote backend: the operation set over the OpenStack REST APIs.

use super::catalog::{build_service_path, EndpointSelector, ServiceCatalogEntry};
use super::client::{HttpClient, RequestOptions};
use super::error::{ApiError, Result, ServiceKind};
use super::model::{
    ConsoleInfo, Flavor, FloatingIp, Image, Instance, InstanceAction, KeyPair, KeystoneDomain,
    KeystoneUser, Network, Port, Quota, Router, SecurityGroup, SecurityGroupRule, Subnet, Volume,
};
use super::normalize;
use super::ops::{
    CloudOperations, ConsoleType, CreateUserRequest, CreateVolumeParams, LaunchInstanceParams,
    NewSecurityGroupRule, PortQuery, PowerAction, UserUpdate,
};
use super::wire;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

const NEUTRON_API_VERSION: &str = "v2.0";
const GLANCE_API_VERSION: &str = "v2";
const KEYSTONE_API_VERSION: &str = "v3";

fn neutron(base: &str, resource: &str) -> String {
    build_service_path(base, NEUTRON_API_VERSION, resource)
}

fn keystone(base: &str, resource: &str) -> String {
    build_service_path(base, KEYSTONE_API_VERSION, resource)
}

pub struct RemoteBackend {
    http: HttpClient,
}

impl RemoteBackend {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn server_action(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        body: Value,
    ) -> Result<()> {
        let url = format!("{}/servers/{}/action", compute_url, instance_id);
        self.http
            .request_empty(Method::POST, &url, RequestOptions::with_token(token).body(body))
            .await
    }

    async fn delete(&self, token: &str, url: &str) -> Result<()> {
        self.http
            .request_empty(Method::DELETE, url, RequestOptions::with_token(token))
            .await
    }

    async fn nova_quotas(&self, token: &str, compute_url: &str, project_id: &str) -> Result<Vec<Quota>> {
        let url = format!("{}/os-quota-sets/{}", compute_url, project_id);
        let rsp: wire::NovaQuotaRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(normalize::nova_quota_lines(&rsp.quota_set))
    }

    async fn cinder_quotas(&self, token: &str, volume_url: &str, project_id: &str) -> Result<Vec<Quota>> {
        let url = format!("{}/os-quota-sets/{}", volume_url, project_id);
        let rsp: wire::CinderQuotaRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(normalize::cinder_quota_lines(&rsp.quota_set))
    }

    async fn neutron_quotas(&self, token: &str, network_url: &str, project_id: &str) -> Result<Vec<Quota>> {
        let url = neutron(network_url, &format!("quotas/{}", project_id));
        let rsp: wire::NeutronQuotaRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(normalize::neutron_quota_lines(&rsp.quota))
    }

    async fn put_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        fip_id: &str,
        port_id: Option<&str>,
    ) -> Result<FloatingIp> {
        let url = neutron(network_url, &format!("floatingips/{}", fip_id));
        let body = json!({ "floatingip": { "port_id": port_id } });
        let rsp: wire::FloatingIpRsp = self
            .http
            .request(Method::PUT, &url, RequestOptions::with_token(token).body(body))
            .await?;
        rsp.floatingip
            .ok_or_else(|| ApiError::not_found("Floating IP", fip_id))
    }
}

/// Append one service's quota lines, or log why they are missing.
fn collect_quotas(quotas: &mut Vec<Quota>, kind: ServiceKind, result: Option<Result<Vec<Quota>>>) {
    match result {
        Some(Ok(lines)) => quotas.extend(lines),
        Some(Err(e)) => tracing::warn!("Failed to fetch {} quotas: {}", kind, e),
        None => tracing::debug!("No {} endpoint, skipping its quotas", kind),
    }
}

#[async_trait]
impl CloudOperations for RemoteBackend {
    fn backend_name(&self) -> &'static str {
        "openstack"
    }

    async fn list_instances(&self, token: &str, compute_url: &str) -> Result<Vec<Instance>> {
        let url = format!("{}/servers/detail", compute_url);
        let rsp: wire::ServersRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(rsp.servers.into_iter().map(normalize::normalize_server).collect())
    }

    async fn get_instance(&self, token: &str, compute_url: &str, instance_id: &str) -> Result<Instance> {
        let url = format!("{}/servers/{}", compute_url, instance_id);
        let rsp: wire::ServerRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(normalize::normalize_server(rsp.server))
    }

    async fn launch_instance(
        &self,
        token: &str,
        compute_url: &str,
        params: &LaunchInstanceParams,
    ) -> Result<Instance> {
        let url = format!("{}/servers", compute_url);
        let rsp: wire::ServerRsp = self
            .http
            .request(
                Method::POST,
                &url,
                RequestOptions::with_token(token).body(params.request_body()),
            )
            .await?;

        // The create response only carries the id; fill in what was asked for.
        let mut raw = rsp.server;
        if raw.status.is_empty() {
            raw.status = "BUILD".to_string();
        }
        if raw.name.is_empty() {
            raw.name = params.name.clone();
        }
        if raw.flavor.id.is_empty() {
            raw.flavor.id = params.flavor_id.clone();
        }
        if raw.image.is_null() {
            raw.image = json!({ "id": params.image_id });
        }
        Ok(normalize::normalize_server(raw))
    }

    async fn terminate_instance(&self, token: &str, compute_url: &str, instance_id: &str) -> Result<()> {
        self.delete(token, &format!("{}/servers/{}", compute_url, instance_id))
            .await
    }

    async fn control_instance_power(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        action: PowerAction,
    ) -> Result<()> {
        self.server_action(token, compute_url, instance_id, action.action_body())
            .await
    }

    async fn get_console_url(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        console_type: ConsoleType,
    ) -> Result<ConsoleInfo> {
        let url = format!("{}/servers/{}/action", compute_url, instance_id);
        let rsp: wire::ConsoleRsp = self
            .http
            .request(
                Method::POST,
                &url,
                RequestOptions::with_token(token).body(console_type.action_body()),
            )
            .await?;
        rsp.console
            .or(rsp.remote_console)
            .ok_or_else(|| ApiError::not_found("Console", instance_id))
    }

    async fn shelve_instance(&self, token: &str, compute_url: &str, instance_id: &str) -> Result<()> {
        self.server_action(token, compute_url, instance_id, json!({ "shelve": null }))
            .await
    }

    async fn unshelve_instance(&self, token: &str, compute_url: &str, instance_id: &str) -> Result<()> {
        self.server_action(token, compute_url, instance_id, json!({ "unshelve": null }))
            .await
    }

    async fn list_instance_actions(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceAction>> {
        let url = format!("{}/servers/{}/os-instance-actions", compute_url, instance_id);
        let rsp: wire::InstanceActionsRsp =
            self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(rsp.instance_actions)
    }

    async fn list_flavors(&self, token: &str, compute_url: &str) -> Result<Vec<Flavor>> {
        let url = format!("{}/flavors/detail", compute_url);
        let rsp: wire::FlavorsRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(rsp.flavors.into_iter().map(normalize::normalize_flavor).collect())
    }

    async fn list_key_pairs(&self, token: &str, compute_url: &str) -> Result<Vec<KeyPair>> {
        let url = format!("{}/os-keypairs", compute_url);
        let rsp: wire::KeyPairsRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(rsp
            .keypairs
            .into_iter()
            .map(|envelope| normalize::normalize_key_pair(envelope.keypair))
            .collect())
    }

    async fn attach_volume(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<()> {
        let url = format!("{}/servers/{}/os-volume_attachments", compute_url, instance_id);
        let body = json!({ "volumeAttachment": { "volumeId": volume_id } });
        self.http
            .request_empty(Method::POST, &url, RequestOptions::with_token(token).body(body))
            .await
    }

    async fn detach_volume(
        &self,
        token: &str,
        compute_url: &str,
        instance_id: &str,
        attachment_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/servers/{}/os-volume_attachments/{}",
            compute_url, instance_id, attachment_id
        );
        self.delete(token, &url).await
    }

    async fn list_volumes(&self, token: &str, volume_url: &str) -> Result<Vec<Volume>> {
        let url = format!("{}/volumes/detail", volume_url);
        let rsp: wire::VolumesRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(rsp.volumes.into_iter().map(normalize::normalize_volume).collect())
    }

    async fn create_volume(
        &self,
        token: &str,
        volume_url: &str,
        params: &CreateVolumeParams,
    ) -> Result<Volume> {
        let url = format!("{}/volumes", volume_url);
        let body = json!({ "volume": params });
        let rsp: wire::VolumeRsp = self
            .http
            .request(Method::POST, &url, RequestOptions::with_token(token).body(body))
            .await?;
        Ok(normalize::normalize_volume(rsp.volume))
    }

    async fn delete_volume(&self, token: &str, volume_url: &str, volume_id: &str) -> Result<()> {
        self.delete(token, &format!("{}/volumes/{}", volume_url, volume_id))
            .await
    }

    async fn list_networks(&self, token: &str, network_url: &str) -> Result<Vec<Network>> {
        let rsp: wire::NetworksRsp = self
            .http
            .get(&neutron(network_url, "networks"), RequestOptions::with_token(token))
            .await?;
        Ok(rsp.networks.into_iter().map(normalize::normalize_network).collect())
    }

    async fn list_subnets(
        &self,
        token: &str,
        network_url: &str,
        network_id: Option<&str>,
    ) -> Result<Vec<Subnet>> {
        let mut opts = RequestOptions::with_token(token);
        if let Some(id) = network_id {
            opts = opts.param("network_id", id);
        }
        let rsp: wire::SubnetsRsp = self.http.get(&neutron(network_url, "subnets"), opts).await?;
        Ok(rsp.subnets)
    }

    async fn list_routers(&self, token: &str, network_url: &str) -> Result<Vec<Router>> {
        let rsp: wire::RoutersRsp = self
            .http
            .get(&neutron(network_url, "routers"), RequestOptions::with_token(token))
            .await?;
        Ok(rsp.routers)
    }

    async fn list_ports(&self, token: &str, network_url: &str, query: &PortQuery) -> Result<Vec<Port>> {
        let mut opts = RequestOptions::with_token(token);
        opts.params = query.params();
        let rsp: wire::PortsRsp = self.http.get(&neutron(network_url, "ports"), opts).await?;
        Ok(rsp.ports)
    }

    async fn list_floating_ips(&self, token: &str, network_url: &str) -> Result<Vec<FloatingIp>> {
        let rsp: wire::FloatingIpsRsp = self
            .http
            .get(&neutron(network_url, "floatingips"), RequestOptions::with_token(token))
            .await?;
        Ok(rsp.floatingips)
    }

    async fn allocate_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        pool_network_id: &str,
    ) -> Result<FloatingIp> {
        let body = json!({ "floatingip": { "floating_network_id": pool_network_id } });
        let rsp: wire::FloatingIpRsp = self
            .http
            .request(
                Method::POST,
                &neutron(network_url, "floatingips"),
                RequestOptions::with_token(token).body(body),
            )
            .await?;
        rsp.floatingip.ok_or_else(|| ApiError::Http {
            url: neutron(network_url, "floatingips"),
            status: 200,
            detail: "response did not contain a floating IP".to_string(),
        })
    }

    async fn release_floating_ip(&self, token: &str, network_url: &str, fip_id: &str) -> Result<()> {
        self.delete(token, &neutron(network_url, &format!("floatingips/{}", fip_id)))
            .await
    }

    async fn associate_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        fip_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp> {
        self.put_floating_ip(token, network_url, fip_id, Some(port_id))
            .await
    }

    async fn disassociate_floating_ip(
        &self,
        token: &str,
        network_url: &str,
        fip_id: &str,
    ) -> Result<FloatingIp> {
        self.put_floating_ip(token, network_url, fip_id, None).await
    }

    async fn list_security_groups(&self, token: &str, network_url: &str) -> Result<Vec<SecurityGroup>> {
        let rsp: wire::SecurityGroupsRsp = self
            .http
            .get(&neutron(network_url, "security-groups"), RequestOptions::with_token(token))
            .await?;
        Ok(rsp
            .security_groups
            .into_iter()
            .map(normalize::normalize_security_group)
            .collect())
    }

    async fn create_security_group(
        &self,
        token: &str,
        network_url: &str,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup> {
        let body = json!({ "security_group": { "name": name, "description": description } });
        let rsp: wire::SecurityGroupRsp = self
            .http
            .request(
                Method::POST,
                &neutron(network_url, "security-groups"),
                RequestOptions::with_token(token).body(body),
            )
            .await?;
        Ok(normalize::normalize_security_group(rsp.security_group))
    }

    async fn delete_security_group(&self, token: &str, network_url: &str, group_id: &str) -> Result<()> {
        self.delete(token, &neutron(network_url, &format!("security-groups/{}", group_id)))
            .await
    }

    async fn add_security_group_rule(
        &self,
        token: &str,
        network_url: &str,
        rule: &NewSecurityGroupRule,
    ) -> Result<SecurityGroupRule> {
        let body = json!({ "security_group_rule": rule });
        let rsp: wire::SecurityGroupRuleRsp = self
            .http
            .request(
                Method::POST,
                &neutron(network_url, "security-group-rules"),
                RequestOptions::with_token(token).body(body),
            )
            .await?;
        Ok(rsp.security_group_rule)
    }

    async fn delete_security_group_rule(&self, token: &str, network_url: &str, rule_id: &str) -> Result<()> {
        self.delete(
            token,
            &neutron(network_url, &format!("security-group-rules/{}", rule_id)),
        )
        .await
    }

    async fn list_images(&self, token: &str, image_url: &str) -> Result<Vec<Image>> {
        let url = build_service_path(image_url, GLANCE_API_VERSION, "images");
        let rsp: wire::ImagesRsp = self.http.get(&url, RequestOptions::with_token(token)).await?;
        Ok(rsp.images.into_iter().map(normalize::normalize_image).collect())
    }

    async fn fetch_all_quotas(
        &self,
        token: &str,
        catalog: &[ServiceCatalogEntry],
        selector: &EndpointSelector,
        project_id: Option<&str>,
    ) -> Result<Vec<Quota>> {
        let Some(project_id) = project_id else {
            tracing::warn!("fetch_all_quotas: no project id, returning no quota lines");
            return Ok(Vec::new());
        };

        let compute = selector.resolve(catalog, ServiceKind::Compute);
        let volume = selector.resolve(catalog, ServiceKind::Volume);
        let network = selector.resolve(catalog, ServiceKind::Network);

        let (nova, cinder, neutron) = tokio::join!(
            async {
                match &compute {
                    Some(url) => Some(self.nova_quotas(token, url, project_id).await),
                    None => None,
                }
            },
            async {
                match &volume {
                    Some(url) => Some(self.cinder_quotas(token, url, project_id).await),
                    None => None,
                }
            },
            async {
                match &network {
                    Some(url) => Some(self.neutron_quotas(token, url, project_id).await),
                    None => None,
                }
            },
        );

        let mut quotas = Vec::new();
        collect_quotas(&mut quotas, ServiceKind::Compute, nova);
        collect_quotas(&mut quotas, ServiceKind::Volume, cinder);
        collect_quotas(&mut quotas, ServiceKind::Network, neutron);
        Ok(quotas)
    }

    async fn list_domains(&self, token: &str, identity_url: &str) -> Result<Vec<KeystoneDomain>> {
        let rsp: wire::DomainsRsp = self
            .http
            .get(&keystone(identity_url, "domains"), RequestOptions::with_token(token))
            .await?;
        Ok(rsp.domains)
    }

    async fn list_users(&self, token: &str, identity_url: &str) -> Result<Vec<KeystoneUser>> {
        let rsp: wire::UsersRsp = self
            .http
            .get(&keystone(identity_url, "users"), RequestOptions::with_token(token))
            .await?;
        Ok(rsp.users)
    }

    async fn create_user(
        &self,
        token: &str,
        identity_url: &str,
        request: &CreateUserRequest,
    ) -> Result<KeystoneUser> {
        let rsp: wire::UserRsp = self
            .http
            .request(
                Method::POST,
                &keystone(identity_url, "users"),
                RequestOptions::with_token(token).body(request.request_body()),
            )
            .await?;
        rsp.user
            .ok_or_else(|| ApiError::not_found("User", request.name.clone()))
    }

    async fn delete_user(&self, token: &str, identity_url: &str, user_id: &str) -> Result<()> {
        self.delete(token, &keystone(identity_url, &format!("users/{}", user_id)))
            .await
    }

    async fn update_user(
        &self,
        token: &str,
        identity_url: &str,
        user_id: &str,
        update: &UserUpdate,
    ) -> Result<KeystoneUser> {
        let body = json!({ "user": update });
        let rsp: wire::UserRsp = self
            .http
            .request(
                Method::PATCH,
                &keystone(identity_url, &format!("users/{}", user_id)),
                RequestOptions::with_token(token).body(body),
            )
            .await?;
        rsp.user.ok_or_else(|| ApiError::not_found("User", user_id))
    }
}
